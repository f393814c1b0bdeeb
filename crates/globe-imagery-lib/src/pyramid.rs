//! Tile pyramid: refinement levels, tile addressing and the tile-identity cache
//!
//! Rows are numbered from the **north** edge of the pyramid extent (row 0 is the
//! northernmost band) and columns from the **west** edge, both zero-based. A tile's sector
//! is derived arithmetically from its level's angular delta and its row/column, then
//! clipped to the extent. Each level halves the delta of the one above, so tile
//! `(level, row, column)` has children `(level + 1, 2·row + i, 2·column + j)`.

use crate::{BoundingBox, ElevationModel, Globe, ImageryError, Result, Sector};
use glam::DVec3;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Deepest supported pyramid, keeps row/column counts well inside `u32`
const MAX_LEVEL_COUNT: usize = 28;

/// Upper bound on the number of level-zero tiles
const MAX_TOP_LEVEL_TILES: u32 = 1 << 20;

/// Layout of a tile pyramid
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PyramidConfig {
    /// Geographic extent covered by the pyramid
    pub extent: Sector,
    /// Latitude span of one level-0 tile, in degrees
    pub level_zero_delta_lat: f64,
    /// Longitude span of one level-0 tile, in degrees
    pub level_zero_delta_lon: f64,
    /// Number of refinement levels (at least one)
    pub num_levels: usize,
    /// Tile image width in pixels
    pub tile_width: u32,
    /// Tile image height in pixels
    pub tile_height: u32,
    /// Maximum number of tiles kept in the identity cache
    pub tile_cache_capacity: usize,
    /// Prefix of every resource key
    pub dataset: String,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            extent: Sector::full_sphere(),
            level_zero_delta_lat: 36.0,
            level_zero_delta_lon: 36.0,
            num_levels: 15,
            tile_width: 256,
            tile_height: 256,
            tile_cache_capacity: 4096,
            dataset: "imagery".to_string(),
        }
    }
}

impl PyramidConfig {
    pub fn validate(&self) -> Result<()> {
        if self.extent.is_degenerate() {
            return Err(ImageryError::DegenerateSector(format!(
                "pyramid extent {:?}",
                self.extent
            )));
        }
        let deltas = [self.level_zero_delta_lat, self.level_zero_delta_lon];
        if deltas.iter().any(|d| !d.is_finite() || *d <= 0.0) {
            return Err(ImageryError::InvalidConfig(format!(
                "level-zero tile deltas must be positive, got {deltas:?}"
            )));
        }
        if self.num_levels == 0 || self.num_levels > MAX_LEVEL_COUNT {
            return Err(ImageryError::InvalidConfig(format!(
                "pyramid needs between 1 and {MAX_LEVEL_COUNT} levels, got {}",
                self.num_levels
            )));
        }
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(ImageryError::InvalidConfig(format!(
                "tile dimensions must be non-zero, got {}x{}",
                self.tile_width, self.tile_height
            )));
        }
        if self.tile_cache_capacity == 0 {
            return Err(ImageryError::InvalidConfig(
                "tile cache capacity must be greater than zero".to_string(),
            ));
        }
        self.level_zero_grid()?;
        Ok(())
    }

    /// Rows and columns of level-zero tiles.
    ///
    /// Fails unless the grid stays under the top-level tile limit and row/column
    /// indices of the finest level still fit in `u32`.
    pub fn level_zero_grid(&self) -> Result<(u32, u32)> {
        let too_large = || {
            ImageryError::InvalidConfig(format!(
                "level-zero deltas {}x{} over {} levels address more tiles than supported",
                self.level_zero_delta_lat, self.level_zero_delta_lon, self.num_levels
            ))
        };

        let rows = span_count(self.extent.delta_latitude(), self.level_zero_delta_lat)
            .ok_or_else(too_large)?;
        let cols = span_count(self.extent.delta_longitude(), self.level_zero_delta_lon)
            .ok_or_else(too_large)?;

        let top_level = rows.checked_mul(cols).ok_or_else(too_large)?;
        if top_level > MAX_TOP_LEVEL_TILES {
            return Err(too_large());
        }

        let finest_scale = u32::try_from(self.num_levels.saturating_sub(1))
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .ok_or_else(too_large)?;
        rows.checked_mul(finest_scale).ok_or_else(too_large)?;
        cols.checked_mul(finest_scale).ok_or_else(too_large)?;

        Ok((rows, cols))
    }
}

/// One refinement tier of the pyramid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    pub index: usize,
    pub tile_delta_lat: f64,
    pub tile_delta_lon: f64,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl Level {
    /// Angular size of one texel in radians (along latitude)
    pub fn texel_size(&self) -> f64 {
        self.tile_delta_lat.to_radians() / self.tile_height as f64
    }
}

/// Address of a quadtree cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub level: usize,
    pub row: u32,
    pub column: u32,
}

impl TileKey {
    pub fn new(level: usize, row: u32, column: u32) -> Self {
        Self { level, row, column }
    }

    /// Children in NW, NE, SW, SE order, or `None` if their indices overflow `u32`
    pub fn children(&self) -> Option<[TileKey; 4]> {
        let row = self.row.checked_mul(2)?;
        let col = self.column.checked_mul(2)?;
        let level = self.level + 1;
        // Doubled indices are even, so adding one cannot overflow
        Some([
            TileKey::new(level, row, col),
            TileKey::new(level, row, col + 1),
            TileKey::new(level, row + 1, col),
            TileKey::new(level, row + 1, col + 1),
        ])
    }
}

/// What backs a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TileKind {
    /// An image resource fetched by key
    Imagery,
    /// A cell clipped away by the pyramid extent; nothing to fetch or draw
    Empty,
}

/// A quadtree cell bound to its geographic sector and backing image resource
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub key: TileKey,
    pub kind: TileKind,
    pub sector: Sector,
    pub resource_key: String,
}

impl Tile {
    #[inline]
    pub fn level(&self) -> usize {
        self.key.level
    }

    /// Key of the image to fetch, if the tile has one
    pub fn resource(&self) -> Option<&str> {
        match self.kind {
            TileKind::Imagery => Some(&self.resource_key),
            TileKind::Empty => None,
        }
    }
}

/// Cached geometry used for culling and the detail test
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TileExtent {
    pub bounds: BoundingBox,
    /// Corners and centroid at the minimum elevation
    pub reference_points: [DVec3; 5],
    pub min_elevation: f64,
    pub max_elevation: f64,
}

impl TileExtent {
    fn compute(sector: &Sector, globe: &Globe, min_elevation: f64, max_elevation: f64) -> Self {
        let (c_lat, c_lon) = sector.centroid();
        let corners = [
            (sector.min_latitude(), sector.min_longitude()),
            (sector.min_latitude(), sector.max_longitude()),
            (sector.max_latitude(), sector.min_longitude()),
            (sector.max_latitude(), sector.max_longitude()),
            (c_lat, c_lon),
        ];
        Self {
            bounds: BoundingBox::from_sector(sector, globe, min_elevation, max_elevation),
            reference_points: corners
                .map(|(lat, lon)| globe.compute_point_from_position(lat, lon, min_elevation)),
            min_elevation,
            max_elevation,
        }
    }

    /// Distance from `point` to the nearest reference point
    pub fn distance_to(&self, point: DVec3) -> f64 {
        self.reference_points
            .iter()
            .map(|p| p.distance(point))
            .fold(f64::INFINITY, f64::min)
    }
}

struct TileEntry {
    tile: Arc<Tile>,
    extent: Option<TileExtent>,
    fallback: Option<TileKey>,
}

impl TileEntry {
    fn new(tile: Arc<Tile>) -> Self {
        Self {
            tile,
            extent: None,
            fallback: None,
        }
    }
}

/// The fixed multi-resolution grid and its memoized tiles.
pub struct TilePyramid {
    config: PyramidConfig,
    levels: Vec<Level>,
    top_level: Vec<Arc<Tile>>,
    /// Identity cache; evicting an entry drops its cached extent and fallback link
    tiles: LruCache<TileKey, TileEntry>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl TilePyramid {
    pub fn new(config: &PyramidConfig) -> Result<Self> {
        config.validate()?;

        let levels = (0..config.num_levels)
            .map(|index| {
                let scale = (1u64 << index) as f64;
                Level {
                    index,
                    tile_delta_lat: config.level_zero_delta_lat / scale,
                    tile_delta_lon: config.level_zero_delta_lon / scale,
                    tile_width: config.tile_width,
                    tile_height: config.tile_height,
                }
            })
            .collect();

        let (rows, cols) = config.level_zero_grid()?;
        let capacity = NonZeroUsize::new(config.tile_cache_capacity).ok_or_else(|| {
            ImageryError::InvalidConfig("tile cache capacity must be non-zero".to_string())
        })?;

        let mut pyramid = Self {
            config: config.clone(),
            levels,
            top_level: Vec::new(),
            tiles: LruCache::new(capacity),
        };
        pyramid.top_level = pyramid.create_top_level_tiles(rows, cols);

        tracing::debug!(
            levels = pyramid.levels.len(),
            top_level_tiles = pyramid.top_level.len(),
            "Tile pyramid created"
        );

        Ok(pyramid)
    }

    fn create_top_level_tiles(&self, rows: u32, cols: u32) -> Vec<Arc<Tile>> {
        let mut tiles = Vec::with_capacity(rows as usize * cols as usize);
        for row in 0..rows {
            for column in 0..cols {
                tiles.push(Arc::new(self.create_tile(TileKey::new(0, row, column))));
            }
        }
        tiles
    }

    fn create_tile(&self, key: TileKey) -> Tile {
        let sector = self.sector_for(&key);
        let kind = if sector.is_degenerate() {
            TileKind::Empty
        } else {
            TileKind::Imagery
        };
        Tile {
            key,
            kind,
            sector,
            resource_key: format!(
                "{}/{}/{}/{}_{}",
                self.config.dataset, key.level, key.row, key.row, key.column
            ),
        }
    }

    /// Full sector of a cell before clipping; the area its backing image covers.
    pub fn cell_sector(&self, key: &TileKey) -> Sector {
        let level = &self.levels[key.level.min(self.levels.len() - 1)];
        let extent = &self.config.extent;

        // Both edges are measured from the extent origin so neighbors share bounds exactly
        let max_lat = extent.max_latitude() - key.row as f64 * level.tile_delta_lat;
        let min_lat = extent.max_latitude() - (key.row as f64 + 1.0) * level.tile_delta_lat;
        let min_lon = extent.min_longitude() + key.column as f64 * level.tile_delta_lon;
        let max_lon = extent.min_longitude() + (key.column as f64 + 1.0) * level.tile_delta_lon;

        Sector::new(min_lat, max_lat, min_lon, max_lon)
    }

    /// Sector of a cell, clipped to the pyramid extent.
    ///
    /// Cells entirely outside the extent yield a collapsed (degenerate) sector.
    pub fn sector_for(&self, key: &TileKey) -> Sector {
        let extent = &self.config.extent;
        let cell = self.cell_sector(key);
        cell.intersection(extent).unwrap_or_else(|| {
            let lat = cell
                .min_latitude()
                .clamp(extent.min_latitude(), extent.max_latitude());
            let lon = cell
                .min_longitude()
                .clamp(extent.min_longitude(), extent.max_longitude());
            Sector::new(lat, lat, lon, lon)
        })
    }

    /// The coarsest tiles covering the extent, in row-major order
    pub fn top_level_tiles(&self) -> &[Arc<Tile>] {
        &self.top_level
    }

    /// The four children of `tile`, reusing cached tile objects when present.
    pub fn subdivide(&mut self, tile: &Tile) -> Result<[Arc<Tile>; 4]> {
        let child_level = tile.level() + 1;
        if child_level >= self.levels.len() {
            return Err(ImageryError::InvalidLevel {
                level: child_level,
                level_count: self.levels.len(),
            });
        }

        let keys = tile.key.children().ok_or(ImageryError::InvalidLevel {
            level: child_level,
            level_count: self.levels.len(),
        })?;

        Ok(keys.map(|key| {
            if let Some(entry) = self.tiles.get(&key) {
                return entry.tile.clone();
            }
            let child = Arc::new(self.create_tile(key));
            self.insert_entry(TileEntry::new(child.clone()));
            child
        }))
    }

    /// Culling geometry for `tile`, rebuilt when the elevation range changes.
    pub(crate) fn tile_extent(
        &mut self,
        tile: &Arc<Tile>,
        globe: &Globe,
        elevation: &dyn ElevationModel,
    ) -> TileExtent {
        let (min_elevation, max_elevation) = elevation.min_and_max_elevation(&tile.sector);

        if let Some(entry) = self.tiles.get_mut(&tile.key) {
            if let Some(extent) = entry.extent {
                if extent.min_elevation == min_elevation && extent.max_elevation == max_elevation {
                    return extent;
                }
            }
            let extent = TileExtent::compute(&tile.sector, globe, min_elevation, max_elevation);
            entry.extent = Some(extent);
            return extent;
        }

        let extent = TileExtent::compute(&tile.sector, globe, min_elevation, max_elevation);
        let mut entry = TileEntry::new(tile.clone());
        entry.extent = Some(extent);
        self.insert_entry(entry);
        extent
    }

    /// Record the ancestor whose texture currently stands in for `key`.
    pub fn set_fallback(&mut self, key: &TileKey, fallback: Option<TileKey>) {
        if let Some(entry) = self.tiles.get_mut(key) {
            entry.fallback = fallback;
        }
    }

    pub fn fallback(&self, key: &TileKey) -> Option<TileKey> {
        self.tiles.peek(key).and_then(|e| e.fallback)
    }

    /// The cached tile object for `key`, if it is still memoized
    pub fn cached_tile(&self, key: &TileKey) -> Option<Arc<Tile>> {
        self.tiles.peek(key).map(|e| e.tile.clone())
    }

    pub fn cached_tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> Option<&Level> {
        self.levels.get(index)
    }

    pub fn is_last_level(&self, index: usize) -> bool {
        index + 1 >= self.levels.len()
    }

    pub fn config(&self) -> &PyramidConfig {
        &self.config
    }

    fn insert_entry(&mut self, entry: TileEntry) {
        if let Some((evicted, _)) = self.tiles.push(entry.tile.key, entry) {
            tracing::trace!(?evicted, "Tile evicted from identity cache");
        }
    }
}

/// Number of tiles of size `delta` needed to span `extent`, if it fits in `u32`
fn span_count(extent: f64, delta: f64) -> Option<u32> {
    // Tolerate rounding when the extent is an exact multiple of the delta
    let count = ((extent / delta) - 1e-9).ceil().max(1.0);
    (count <= u32::MAX as f64).then_some(count as u32)
}
