//! Per-frame visible tile selection
//!
//! Each assembly walks the pyramid from the top-level tiles, prunes branches whose
//! bounding boxes fall outside the frustum, refines tiles that are too coarse for their
//! distance from the eye, and resolves a texture for every selected tile. Tiles whose
//! own texture is not yet resident borrow the texture of their nearest resident ancestor.

use crate::cache::TextureCache;
use crate::layer::Texture;
use crate::pyramid::{Level, Tile, TileExtent, TileKey, TilePyramid};
use crate::{ElevationModel, Frustum, Globe, ImageryError, Result, Sector};
use glam::{DVec2, DVec3};
use std::collections::HashSet;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Resolution threshold below which cell sizes are not refined, in meters
const MIN_CELL_SIZE: f64 = 0.5;

/// Tuning for the level-of-detail test
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DetailConfig {
    /// Texels allowed per screen pixel before a tile is subdivided; higher is coarser
    pub detail_hint: f64,
    /// Floor for the polar relaxation factor applied to cell sizes
    pub polar_min_scale: f64,
}

impl Default for DetailConfig {
    fn default() -> Self {
        Self {
            detail_hint: 1.75,
            polar_min_scale: 0.1,
        }
    }
}

impl DetailConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.detail_hint.is_finite() && self.detail_hint > 0.0) {
            return Err(ImageryError::InvalidConfig(format!(
                "detail hint must be positive, got {}",
                self.detail_hint
            )));
        }
        if !(self.polar_min_scale > 0.0 && self.polar_min_scale <= 1.0) {
            return Err(ImageryError::InvalidConfig(format!(
                "polar minimum scale must be in (0, 1], got {}",
                self.polar_min_scale
            )));
        }
        Ok(())
    }
}

/// How a tile without its own texture is drawn when an ancestor texture is resident
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FallbackPolicy {
    /// Draw the tile itself with the ancestor texture remapped onto its sector
    #[default]
    Stretch,
    /// Draw the ancestor tile in place of its missing descendants
    DrawAncestor,
}

/// Camera inputs of one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameState {
    pub frustum: Frustum,
    pub eye_point: DVec3,
    /// Size in meters of one pixel at unit distance from the eye
    pub pixel_size_scale: f64,
}

impl FrameState {
    pub fn new(frustum: Frustum, eye_point: DVec3, pixel_size_scale: f64) -> Self {
        Self {
            frustum,
            eye_point,
            pixel_size_scale,
        }
    }

    /// Frame of a perspective camera with vertical field of view `fov_y` in radians.
    pub fn perspective(frustum: Frustum, eye_point: DVec3, fov_y: f64, viewport_height: f64) -> Self {
        let pixel_size_scale = 2.0 * (0.5 * fov_y).tan() / viewport_height.max(1.0);
        Self::new(frustum, eye_point, pixel_size_scale)
    }

    /// Size of one pixel in meters at `distance` from the eye
    #[inline]
    pub fn pixel_size_at_distance(&self, distance: f64) -> f64 {
        distance.max(0.0) * self.pixel_size_scale
    }
}

/// Maps a tile's texture coordinates into the texture of the tile that owns it.
///
/// `s` runs west to east and `t` south to north across a sector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TexCoordTransform {
    pub scale: DVec2,
    pub offset: DVec2,
}

impl Default for TexCoordTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl TexCoordTransform {
    pub const IDENTITY: Self = Self {
        scale: DVec2::ONE,
        offset: DVec2::ZERO,
    };

    /// Transform placing `sector` within the texture of `texture_sector`.
    pub fn between(sector: &Sector, texture_sector: &Sector) -> Self {
        let size = DVec2::new(
            texture_sector.delta_longitude(),
            texture_sector.delta_latitude(),
        );
        Self {
            scale: DVec2::new(sector.delta_longitude(), sector.delta_latitude()) / size,
            offset: DVec2::new(
                sector.min_longitude() - texture_sector.min_longitude(),
                sector.min_latitude() - texture_sector.min_latitude(),
            ) / size,
        }
    }

    #[inline]
    pub fn apply(&self, uv: DVec2) -> DVec2 {
        self.offset + uv * self.scale
    }
}

/// One entry of the draw list
#[derive(Debug, Clone, PartialEq)]
pub struct DrawTile {
    /// The tile whose geometry is drawn
    pub tile: Arc<Tile>,
    pub texture: Texture,
    /// The tile that owns `texture`
    pub texture_tile: TileKey,
    pub using_fallback: bool,
    pub tex_transform: TexCoordTransform,
}

/// Nearest ancestor whose texture is resident
struct Resident {
    tile: Arc<Tile>,
    texture: Texture,
}

/// Borrowed inputs of one assembly pass
struct Pass<'a> {
    frame: &'a FrameState,
    pyramid: &'a mut TilePyramid,
    cache: &'a mut TextureCache<Texture>,
    elevation: &'a dyn ElevationModel,
}

/// Builds the ordered draw list for a frame.
pub struct VisibleSetAssembler {
    globe: Globe,
    detail: DetailConfig,
    fallback_policy: FallbackPolicy,
    draw_list: Vec<DrawTile>,
    missing: Vec<Arc<Tile>>,
    drawn: HashSet<TileKey>,
    /// Inputs of the last assembly, used to skip redundant passes
    last_inputs: Option<(FrameState, u64)>,
    stale: bool,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl VisibleSetAssembler {
    pub fn new(globe: Globe, detail: DetailConfig, fallback_policy: FallbackPolicy) -> Self {
        Self {
            globe,
            detail,
            fallback_policy,
            draw_list: Vec::new(),
            missing: Vec::new(),
            drawn: HashSet::new(),
            last_inputs: None,
            stale: true,
        }
    }

    /// Rebuild the draw list unless the frame inputs are unchanged and nothing marked the
    /// set stale. Returns whether a traversal ran.
    ///
    /// Textures in the new draw list are pinned in `cache`; pins from the previous pass
    /// are released first.
    pub fn assemble(
        &mut self,
        frame: &FrameState,
        pyramid: &mut TilePyramid,
        cache: &mut TextureCache<Texture>,
        elevation: &dyn ElevationModel,
    ) -> bool {
        profiling::scope!("assemble_visible_tiles");

        let inputs = (*frame, elevation.version());
        if !self.stale && self.last_inputs == Some(inputs) {
            return false;
        }

        cache.unpin_all();
        self.draw_list.clear();
        self.missing.clear();
        self.drawn.clear();

        let mut pass = Pass {
            frame,
            pyramid,
            cache,
            elevation,
        };
        let top_level = pass.pyramid.top_level_tiles().to_vec();
        for tile in &top_level {
            self.visit(&mut pass, tile, None);
        }

        // Coarser tiles first so finer tiles draw over them
        self.draw_list.sort_by_key(|d| d.tile.level());

        self.last_inputs = Some(inputs);
        self.stale = false;

        tracing::debug!(
            drawn = self.draw_list.len(),
            fallbacks = self.fallback_count(),
            missing = self.missing.len(),
            "Visible set assembled"
        );
        true
    }

    /// Force the next [`VisibleSetAssembler::assemble`] to traverse again
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn draw_list(&self) -> &[DrawTile] {
        &self.draw_list
    }

    /// Selected tiles whose own texture was not resident during the last pass
    pub fn missing_tiles(&self) -> &[Arc<Tile>] {
        &self.missing
    }

    pub fn fallback_count(&self) -> usize {
        self.draw_list.iter().filter(|d| d.using_fallback).count()
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        self.fallback_policy
    }

    /// Drop the previous draw list and force a new traversal
    pub fn reset(&mut self) {
        self.draw_list.clear();
        self.missing.clear();
        self.drawn.clear();
        self.last_inputs = None;
        self.stale = true;
    }

    fn visit(&mut self, pass: &mut Pass<'_>, tile: &Arc<Tile>, ancestor: Option<&Resident>) {
        let Some(resource) = tile.resource() else {
            tracing::debug!(key = ?tile.key, "Pruned tile outside the pyramid extent");
            return;
        };
        if tile.sector.is_degenerate() {
            tracing::debug!(key = ?tile.key, sector = ?tile.sector, "Pruned degenerate tile");
            return;
        }

        let extent = pass.pyramid.tile_extent(tile, &self.globe, pass.elevation);
        if !extent.bounds.intersects_frustum(&pass.frame.frustum) {
            return;
        }

        let own = pass.cache.get(resource).cloned();

        let refine = match pass.pyramid.level(tile.level()) {
            Some(level) => {
                !pass.pyramid.is_last_level(tile.level())
                    && self.needs_subdivision(tile, level, &extent, pass.frame)
            }
            None => false,
        };

        if refine {
            match pass.pyramid.subdivide(tile) {
                Ok(children) => {
                    let resident = own.map(|texture| Resident {
                        tile: tile.clone(),
                        texture,
                    });
                    let nearest = resident.as_ref().or(ancestor);
                    for child in &children {
                        self.visit(pass, child, nearest);
                    }
                    return;
                }
                Err(err) => {
                    tracing::debug!(key = ?tile.key, %err, "Drawing tile without refinement");
                }
            }
        }

        self.resolve(pass, tile, own, ancestor);
    }

    /// Whether the tile's texels are larger on screen than the detail hint allows
    fn needs_subdivision(
        &self,
        tile: &Tile,
        level: &Level,
        extent: &TileExtent,
        frame: &FrameState,
    ) -> bool {
        let distance = extent.distance_to(frame.eye_point);
        let pixel_size = frame.pixel_size_at_distance(distance);
        let cell_size =
            self.globe.equatorial_radius * level.texel_size() * self.polar_scale(&tile.sector);
        cell_size > (pixel_size * self.detail.detail_hint).max(MIN_CELL_SIZE)
    }

    /// Cosine of the sector's equator-most latitude, floored at the configured minimum
    fn polar_scale(&self, sector: &Sector) -> f64 {
        let lat = if sector.min_latitude() <= 0.0 && sector.max_latitude() >= 0.0 {
            0.0
        } else {
            sector.min_latitude().abs().min(sector.max_latitude().abs())
        };
        lat.to_radians().cos().max(self.detail.polar_min_scale)
    }

    fn resolve(
        &mut self,
        pass: &mut Pass<'_>,
        tile: &Arc<Tile>,
        own: Option<Texture>,
        ancestor: Option<&Resident>,
    ) {
        // Images cover whole cells; clipped sectors map onto part of them
        if let Some(texture) = own {
            pass.pyramid.set_fallback(&tile.key, None);
            pass.cache.pin(&tile.resource_key);
            let cell = pass.pyramid.cell_sector(&tile.key);
            self.push(DrawTile {
                tile: tile.clone(),
                texture,
                texture_tile: tile.key,
                using_fallback: false,
                tex_transform: TexCoordTransform::between(&tile.sector, &cell),
            });
            return;
        }

        self.missing.push(tile.clone());

        let Some(ancestor) = ancestor else {
            pass.pyramid.set_fallback(&tile.key, None);
            return;
        };

        pass.pyramid.set_fallback(&tile.key, Some(ancestor.tile.key));
        pass.cache.pin(&ancestor.tile.resource_key);
        let ancestor_cell = pass.pyramid.cell_sector(&ancestor.tile.key);

        let draw = match self.fallback_policy {
            FallbackPolicy::Stretch => DrawTile {
                tile: tile.clone(),
                texture: ancestor.texture.clone(),
                texture_tile: ancestor.tile.key,
                using_fallback: true,
                tex_transform: TexCoordTransform::between(&tile.sector, &ancestor_cell),
            },
            FallbackPolicy::DrawAncestor => DrawTile {
                tile: ancestor.tile.clone(),
                texture: ancestor.texture.clone(),
                texture_tile: ancestor.tile.key,
                using_fallback: true,
                tex_transform: TexCoordTransform::between(&ancestor.tile.sector, &ancestor_cell),
            },
        };
        self.push(draw);
    }

    /// Append a draw entry unless its tile was already drawn this pass
    fn push(&mut self, draw: DrawTile) {
        if self.drawn.insert(draw.tile.key) {
            self.draw_list.push(draw);
        }
    }
}
