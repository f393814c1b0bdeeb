//! Tiled imagery layer: owns the pyramid, texture cache and retrieval state

use crate::assembler::{DetailConfig, DrawTile, FallbackPolicy, FrameState, VisibleSetAssembler};
use crate::cache::{CacheConfig, TextureCache};
use crate::pyramid::{PyramidConfig, TilePyramid};
use crate::retrieval::{RetrievalConfig, RetrievalCoordinator, RetrievalEvent};
use crate::{ElevationModel, Globe, ImageryError, Result, RetrievalError};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration for a [`TiledImageryLayer`]
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    pub pyramid: PyramidConfig,
    pub cache: CacheConfig,
    pub retrieval: RetrievalConfig,
    pub detail: DetailConfig,
    pub fallback_policy: FallbackPolicy,
    pub globe: Globe,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pyramid: PyramidConfig::default(),
            cache: CacheConfig::default(),
            retrieval: RetrievalConfig::default(),
            detail: DetailConfig::default(),
            fallback_policy: FallbackPolicy::default(),
            globe: Globe::wgs84(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.pyramid.validate()?;
        self.cache.validate()?;
        self.retrieval.validate()?;
        self.detail.validate()?;
        if !(self.globe.equatorial_radius > 0.0 && self.globe.polar_radius > 0.0) {
            return Err(ImageryError::InvalidConfig(format!(
                "globe radii must be positive, got {:?}",
                self.globe
            )));
        }
        Ok(())
    }
}

/// A decoded image ready for upload by the renderer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

impl Texture {
    pub fn new(width: u32, height: u32, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            width,
            height,
            data: data.into(),
        }
    }

    /// Wrap tightly packed RGBA8 pixels, checking the buffer length.
    pub fn from_rgba(
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> std::result::Result<Self, RetrievalError> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(RetrievalError::Decode(format!(
                "expected {expected} bytes for {width}x{height} RGBA, got {}",
                data.len()
            )));
        }
        Ok(Self::new(width, height, data))
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.data.len()
    }
}

/// Source of tile images, keyed by [`crate::Tile::resource_key`].
pub trait TileFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        key: &str,
    ) -> impl Future<Output = std::result::Result<Texture, RetrievalError>> + Send;
}

/// Counters describing the layer after the most recent frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerStats {
    pub drawn_tiles: usize,
    pub fallback_tiles: usize,
    pub missing_tiles: usize,
    pub cached_textures: usize,
    pub cached_bytes: usize,
    pub cached_tiles: usize,
    pub in_flight: usize,
    pub absent: usize,
    pub assemblies: u64,
    pub skipped_assemblies: u64,
    pub fetches_started: u64,
    pub fetches_failed: u64,
}

type ReadyHook = Box<dyn FnMut(&str) + Send>;
type FailedHook = Box<dyn FnMut(&str, &RetrievalError) + Send>;

/// Multi-resolution imagery draped over the globe.
///
/// Call [`TiledImageryLayer::assemble_visible_tiles`] once per frame from the render
/// thread. Textures are fetched in the background and become visible on a later frame.
pub struct TiledImageryLayer<F: TileFetcher> {
    pyramid: TilePyramid,
    cache: TextureCache<Texture>,
    retrieval: RetrievalCoordinator<Texture>,
    fetcher: Arc<F>,
    assembler: VisibleSetAssembler,
    enabled: bool,
    opacity: f64,
    on_resource_ready: Option<ReadyHook>,
    on_resource_failed: Option<FailedHook>,
    assemblies: u64,
    skipped_assemblies: u64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<F: TileFetcher> TiledImageryLayer<F> {
    /// Create a layer whose fetches run on `runtime`.
    pub fn new(config: Config, fetcher: F, runtime: Handle) -> Result<Self> {
        config.validate()?;

        let layer = Self {
            pyramid: TilePyramid::new(&config.pyramid)?,
            cache: TextureCache::new(config.cache)?,
            retrieval: RetrievalCoordinator::new(config.retrieval, runtime)?,
            fetcher: Arc::new(fetcher),
            assembler: VisibleSetAssembler::new(
                config.globe,
                config.detail,
                config.fallback_policy,
            ),
            enabled: true,
            opacity: 1.0,
            on_resource_ready: None,
            on_resource_failed: None,
            assemblies: 0,
            skipped_assemblies: 0,
        };

        tracing::info!(
            dataset = %config.pyramid.dataset,
            levels = config.pyramid.num_levels,
            cache_bytes = config.cache.capacity_bytes,
            "Imagery layer created"
        );

        Ok(layer)
    }

    /// Apply finished fetches, then return the draw list for `frame`.
    pub fn assemble_visible_tiles(
        &mut self,
        frame: &FrameState,
        elevation: &dyn ElevationModel,
    ) -> &[DrawTile] {
        profiling::scope!("TiledImageryLayer::assemble_visible_tiles");

        self.process_completions();

        if !self.is_active() {
            // Nothing is drawn, so nothing may stay protected from eviction
            self.cache.unpin_all();
            self.assembler.mark_stale();
            return &[];
        }

        if self
            .assembler
            .assemble(frame, &mut self.pyramid, &mut self.cache, elevation)
        {
            self.assemblies += 1;
        } else {
            self.skipped_assemblies += 1;
        }

        self.request_missing(Instant::now());
        self.assembler.draw_list()
    }

    /// Insert finished textures into the cache and record failures. Returns the number
    /// of completions applied.
    pub fn process_completions(&mut self) -> usize {
        profiling::scope!("process_completions");

        let events = self.retrieval.process_completions(Instant::now());
        let count = events.len();

        for event in events {
            match event {
                RetrievalEvent::Ready { key, payload } => {
                    let size = payload.size_in_bytes();
                    self.cache.put(&key, payload, size);
                    self.assembler.mark_stale();
                    if let Some(hook) = self.on_resource_ready.as_mut() {
                        hook(&key);
                    }
                }
                RetrievalEvent::Failed { key, error, .. } => {
                    if let Some(hook) = self.on_resource_failed.as_mut() {
                        hook(&key, &error);
                    }
                }
            }
        }

        count
    }

    fn request_missing(&mut self, now: Instant) {
        let fetcher = &self.fetcher;
        for tile in self.assembler.missing_tiles() {
            let Some(key) = tile.resource() else {
                continue;
            };
            self.retrieval.request_if_needed(key, now, || {
                let fetcher = fetcher.clone();
                let key = key.to_string();
                async move { fetcher.fetch(&key).await }
            });
        }
    }

    /// Called with the resource key of every texture that becomes resident
    pub fn set_on_resource_ready(&mut self, hook: impl FnMut(&str) + Send + 'static) {
        self.on_resource_ready = Some(Box::new(hook));
    }

    /// Called with the resource key and error of every failed fetch
    pub fn set_on_resource_failed(
        &mut self,
        hook: impl FnMut(&str, &RetrievalError) + Send + 'static,
    ) {
        self.on_resource_failed = Some(Box::new(hook));
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Opacity handed to the renderer, clamped to `[0, 1]`
    pub fn set_opacity(&mut self, opacity: f64) {
        self.opacity = if opacity.is_nan() {
            0.0
        } else {
            opacity.clamp(0.0, 1.0)
        };
    }

    pub fn opacity(&self) -> f64 {
        self.opacity
    }

    /// Whether the layer produces anything to draw
    pub fn is_active(&self) -> bool {
        self.enabled && self.opacity > 0.0
    }

    /// Force a full traversal on the next frame even if the camera did not move
    pub fn mark_stale(&mut self) {
        self.assembler.mark_stale();
    }

    /// Drop all textures and failure records so everything is fetched again.
    pub fn invalidate(&mut self) {
        self.cache.clear();
        self.retrieval.clear_absent();
        self.assembler.reset();
        tracing::debug!("Imagery layer invalidated");
    }

    pub fn pyramid(&self) -> &TilePyramid {
        &self.pyramid
    }

    pub fn cache(&self) -> &TextureCache<Texture> {
        &self.cache
    }

    pub fn retrieval(&self) -> &RetrievalCoordinator<Texture> {
        &self.retrieval
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn stats(&self) -> LayerStats {
        LayerStats {
            drawn_tiles: self.assembler.draw_list().len(),
            fallback_tiles: self.assembler.fallback_count(),
            missing_tiles: self.assembler.missing_tiles().len(),
            cached_textures: self.cache.len(),
            cached_bytes: self.cache.used_bytes(),
            cached_tiles: self.pyramid.cached_tile_count(),
            in_flight: self.retrieval.in_flight_count(),
            absent: self.retrieval.absent().len(),
            assemblies: self.assemblies,
            skipped_assemblies: self.skipped_assemblies,
            fetches_started: self.retrieval.fetches_started(),
            fetches_failed: self.retrieval.fetches_failed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConstantElevation, Frustum, Globe, Sector, TileKey};
    use glam::DVec3;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const RADIUS: f64 = 1000.0;

    /// Serves a solid texture for every key except the ones marked missing
    struct StubFetcher {
        missing: HashSet<String>,
        calls: AtomicUsize,
    }

    impl StubFetcher {
        fn new(missing: &[&str]) -> Self {
            Self {
                missing: missing.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TileFetcher for StubFetcher {
        fn fetch(
            &self,
            key: &str,
        ) -> impl Future<Output = std::result::Result<Texture, RetrievalError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if self.missing.contains(key) {
                Err(RetrievalError::Status(404))
            } else {
                Texture::from_rgba(2, 2, vec![key.len() as u8; 16])
            };
            async move { result }
        }
    }

    fn config() -> Config {
        Config {
            pyramid: PyramidConfig {
                extent: Sector::full_sphere(),
                level_zero_delta_lat: 90.0,
                level_zero_delta_lon: 90.0,
                num_levels: 2,
                tile_width: 2,
                tile_height: 2,
                tile_cache_capacity: 64,
                dataset: "test".to_string(),
            },
            cache: CacheConfig {
                capacity_bytes: 1 << 20,
                low_water_bytes: 1 << 19,
            },
            globe: Globe::sphere(RADIUS),
            ..Config::default()
        }
    }

    fn layer(missing: &[&str]) -> TiledImageryLayer<StubFetcher> {
        TiledImageryLayer::new(config(), StubFetcher::new(missing), Handle::current()).unwrap()
    }

    fn everything() -> Frustum {
        Frustum::from_bounds(DVec3::splat(-10.0 * RADIUS), DVec3::splat(10.0 * RADIUS))
    }

    fn far_frame() -> FrameState {
        FrameState::new(everything(), DVec3::new(1e6, 0.0, 0.0), 0.01)
    }

    fn close_frame() -> FrameState {
        let eye = Globe::sphere(RADIUS).compute_point_from_position(45.0, -135.0, 10.0);
        FrameState::new(everything(), eye, 1.0)
    }

    async fn settle(layer: &mut TiledImageryLayer<StubFetcher>) {
        for _ in 0..200 {
            layer.process_completions();
            if layer.stats().in_flight == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("fetches did not settle");
    }

    #[tokio::test]
    async fn test_far_camera_fetches_then_draws_level_zero() {
        let mut layer = layer(&[]);
        let elevation = ConstantElevation::default();

        assert!(layer.assemble_visible_tiles(&far_frame(), &elevation).is_empty());
        assert_eq!(layer.stats().fetches_started, 8);

        settle(&mut layer).await;
        let draws = layer.assemble_visible_tiles(&far_frame(), &elevation);
        assert_eq!(draws.len(), 8);
        assert!(draws.iter().all(|d| d.tile.level() == 0 && !d.using_fallback));
        assert_eq!(layer.stats().cached_textures, 8);
    }

    #[tokio::test]
    async fn test_duplicate_requests_across_frames_fetch_once() {
        let mut layer = layer(&[]);
        let elevation = ConstantElevation::default();

        layer.assemble_visible_tiles(&far_frame(), &elevation);
        layer.assemble_visible_tiles(&far_frame(), &elevation);
        let stats = layer.stats();
        assert_eq!(stats.fetches_started, 8);
        assert_eq!(stats.in_flight, 8);
        assert_eq!(stats.skipped_assemblies, 1);

        settle(&mut layer).await;
        assert_eq!(layer.fetcher().calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_failed_child_falls_back_to_parent() {
        let mut layer = layer(&["test/1/0/0_0"]);
        let elevation = ConstantElevation::default();

        let failed = Arc::new(Mutex::new(Vec::new()));
        let sink = failed.clone();
        layer.set_on_resource_failed(move |key, _| sink.lock().unwrap().push(key.to_string()));

        // Far view first so the parent texture becomes resident
        layer.assemble_visible_tiles(&far_frame(), &elevation);
        settle(&mut layer).await;
        layer.assemble_visible_tiles(&close_frame(), &elevation);
        settle(&mut layer).await;

        let draws = layer.assemble_visible_tiles(&close_frame(), &elevation);
        let children: Vec<&DrawTile> = draws.iter().filter(|d| d.tile.level() == 1).collect();
        assert_eq!(children.len(), 4);

        let fallback = children.iter().find(|d| d.using_fallback).unwrap();
        assert_eq!(fallback.tile.key, TileKey::new(1, 0, 0));
        assert_eq!(fallback.texture_tile, TileKey::new(0, 0, 0));
        assert_eq!(children.iter().filter(|d| !d.using_fallback).count(), 3);

        assert_eq!(failed.lock().unwrap().as_slice(), ["test/1/0/0_0"]);
        let stats = layer.stats();
        assert_eq!(stats.absent, 1);
        assert_eq!(stats.fetches_failed, 1);

        // Still within the backoff window: no new fetch
        let started = stats.fetches_started;
        layer.assemble_visible_tiles(&close_frame(), &elevation);
        assert_eq!(layer.stats().fetches_started, started);
    }

    #[tokio::test]
    async fn test_ready_hook_and_stale_marking() {
        let mut layer = layer(&[]);
        let elevation = ConstantElevation::default();

        let ready = Arc::new(AtomicUsize::new(0));
        let counter = ready.clone();
        layer.set_on_resource_ready(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        layer.assemble_visible_tiles(&far_frame(), &elevation);
        settle(&mut layer).await;
        assert_eq!(ready.load(Ordering::SeqCst), 8);

        // New textures force a fresh traversal even though the frame is unchanged
        layer.assemble_visible_tiles(&far_frame(), &elevation);
        assert_eq!(layer.stats().assemblies, 2);
        layer.assemble_visible_tiles(&far_frame(), &elevation);
        assert_eq!(layer.stats().skipped_assemblies, 1);
    }

    #[tokio::test]
    async fn test_inactive_layer_draws_nothing() {
        let mut layer = layer(&[]);
        let elevation = ConstantElevation::default();

        layer.set_enabled(false);
        assert!(layer.assemble_visible_tiles(&far_frame(), &elevation).is_empty());
        assert_eq!(layer.stats().fetches_started, 0);

        layer.set_enabled(true);
        layer.set_opacity(-3.0);
        assert_eq!(layer.opacity(), 0.0);
        assert!(!layer.is_active());
        assert!(layer.assemble_visible_tiles(&far_frame(), &elevation).is_empty());
    }

    #[tokio::test]
    async fn test_disabling_releases_pins() {
        let mut layer = layer(&[]);
        let elevation = ConstantElevation::default();

        layer.assemble_visible_tiles(&far_frame(), &elevation);
        settle(&mut layer).await;
        assert_eq!(layer.assemble_visible_tiles(&far_frame(), &elevation).len(), 8);
        assert!(layer.cache().is_pinned("test/0/0/0_0"));

        layer.set_enabled(false);
        layer.assemble_visible_tiles(&far_frame(), &elevation);
        assert!(!layer.cache().is_pinned("test/0/0/0_0"));

        // Re-enabling with the same frame traverses again and restores the pins
        layer.set_enabled(true);
        assert_eq!(layer.assemble_visible_tiles(&far_frame(), &elevation).len(), 8);
        assert!(layer.cache().is_pinned("test/0/0/0_0"));
    }

    #[tokio::test]
    async fn test_invalidate_refetches() {
        let mut layer = layer(&[]);
        let elevation = ConstantElevation::default();

        layer.assemble_visible_tiles(&far_frame(), &elevation);
        settle(&mut layer).await;
        layer.invalidate();
        assert!(layer.cache().is_empty());

        assert!(layer.assemble_visible_tiles(&far_frame(), &elevation).is_empty());
        assert_eq!(layer.stats().fetches_started, 16);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut bad = config();
        bad.cache.low_water_bytes = bad.cache.capacity_bytes;
        assert!(TiledImageryLayer::new(bad, StubFetcher::new(&[]), Handle::current()).is_err());

        let mut bad = config();
        bad.pyramid.num_levels = 0;
        assert!(TiledImageryLayer::new(bad, StubFetcher::new(&[]), Handle::current()).is_err());
    }

    #[test]
    fn test_texture_from_rgba_checks_length() {
        assert!(Texture::from_rgba(2, 2, vec![0; 16]).is_ok());
        assert!(matches!(
            Texture::from_rgba(2, 2, vec![0; 15]),
            Err(RetrievalError::Decode(_))
        ));
        assert_eq!(Texture::new(4, 4, vec![0u8; 64]).size_in_bytes(), 64);
    }
}
