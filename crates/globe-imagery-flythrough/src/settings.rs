use clap::{Parser, ValueEnum};
use globe_imagery_lib::{
    CacheConfig, Config, DetailConfig, FallbackPolicy, Globe, PyramidConfig, RetrievalConfig,
    Sector,
};
use std::path::PathBuf;
use std::time::Duration;

const MIB: usize = 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Globe Imagery Fly-through - streams imagery tiles while a camera descends towards a target
pub struct Settings {
    /// Directory holding raw RGBA tiles as `<dataset>/<level>/<row>/<row>_<column>.<ext>`.
    /// Synthetic tiles are generated when omitted.
    #[clap(short, long, value_name = "DIR")]
    pub image_root: Option<PathBuf>,

    /// File extension of tiles under the image root
    #[clap(long, default_value = "rgba")]
    pub extension: String,

    /// Dataset name, the first component of every resource key
    #[clap(long, default_value = "imagery")]
    pub dataset: String,

    /// Tile width and height in pixels
    #[clap(long, default_value = "256")]
    pub tile_size: u32,

    /// Number of pyramid levels
    #[clap(long, default_value = "12")]
    pub levels: usize,

    /// Angular size of level-zero tiles in degrees
    #[clap(long, default_value = "36.0")]
    pub level_zero_delta: f64,

    /// Texture cache capacity in MiB
    #[clap(long, default_value = "256")]
    pub cache_mb: usize,

    /// Texture cache low-water mark in MiB
    #[clap(long, default_value = "192")]
    pub cache_low_water_mb: usize,

    /// Maximum number of tiles memoized by the pyramid
    #[clap(long, default_value = "4096")]
    pub tile_cache_capacity: usize,

    /// Delay before retrying a failed tile in milliseconds; doubles per failure
    #[clap(long, default_value = "500")]
    pub backoff_base_ms: u64,

    /// Upper bound on the retry delay in milliseconds
    #[clap(long, default_value = "8000")]
    pub backoff_max_ms: u64,

    /// Failures after which a tile is not requested again
    #[clap(long, default_value = "8")]
    pub max_strikes: u32,

    /// Texels per pixel tolerated before refining (higher = coarser)
    #[clap(long, default_value = "1.75")]
    pub detail_hint: f64,

    /// How tiles without their own texture are drawn
    #[clap(long, value_enum, default_value_t = Fallback::Stretch)]
    pub fallback: Fallback,

    /// Fraction of synthetic fetches that fail (0.0-1.0)
    #[clap(long, default_value = "0.05")]
    pub failure_rate: f64,

    /// Simulated latency of synthetic fetches in milliseconds
    #[clap(long, default_value = "40")]
    pub latency_ms: u64,

    /// Latitude of the point the camera descends towards
    #[clap(long, default_value = "46.5", allow_negative_numbers = true)]
    pub target_lat: f64,

    /// Longitude of the point the camera descends towards
    #[clap(long, default_value = "8.0", allow_negative_numbers = true)]
    pub target_lon: f64,

    /// Camera altitude at the first frame in meters
    #[clap(long, default_value = "20000000")]
    pub start_altitude: f64,

    /// Camera altitude at the last frame in meters
    #[clap(long, default_value = "500")]
    pub end_altitude: f64,

    /// Highest terrain elevation assumed for bounding volumes, in meters
    #[clap(long, default_value = "4800")]
    pub max_elevation: f64,

    /// Number of frames to simulate
    #[clap(long, default_value = "300")]
    pub frames: u32,

    /// Time between frames in milliseconds
    #[clap(long, default_value = "16")]
    pub frame_ms: u64,

    /// Vertical field of view in degrees
    #[clap(long, default_value = "45")]
    pub fov: f64,

    /// Viewport width in pixels
    #[clap(long, default_value = "1920")]
    pub viewport_width: u32,

    /// Viewport height in pixels
    #[clap(long, default_value = "1080")]
    pub viewport_height: u32,

    /// Log statistics every N frames
    #[clap(long, default_value = "30")]
    pub log_every: u32,

    /// Print the resolved layer configuration as JSON and exit
    #[clap(long, default_value = "false")]
    pub print_config: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Remap the ancestor texture onto the missing tile
    Stretch,
    /// Draw the ancestor tile in place of its missing descendants
    DrawAncestor,
}

impl From<Fallback> for FallbackPolicy {
    fn from(value: Fallback) -> Self {
        match value {
            Fallback::Stretch => FallbackPolicy::Stretch,
            Fallback::DrawAncestor => FallbackPolicy::DrawAncestor,
        }
    }
}

impl Settings {
    pub fn from_cli() -> Self {
        match Settings::try_parse() {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    /// Layer configuration derived from the command line
    pub fn layer_config(&self) -> Config {
        Config {
            pyramid: PyramidConfig {
                extent: Sector::full_sphere(),
                level_zero_delta_lat: self.level_zero_delta,
                level_zero_delta_lon: self.level_zero_delta,
                num_levels: self.levels,
                tile_width: self.tile_size,
                tile_height: self.tile_size,
                tile_cache_capacity: self.tile_cache_capacity,
                dataset: self.dataset.clone(),
            },
            cache: CacheConfig {
                capacity_bytes: self.cache_mb * MIB,
                low_water_bytes: self.cache_low_water_mb * MIB,
            },
            retrieval: RetrievalConfig {
                backoff_base: Duration::from_millis(self.backoff_base_ms),
                backoff_max: Duration::from_millis(self.backoff_max_ms),
                max_strikes: self.max_strikes,
            },
            detail: DetailConfig {
                detail_hint: self.detail_hint,
                ..DetailConfig::default()
            },
            fallback_policy: self.fallback.into(),
            globe: Globe::wgs84(),
        }
    }
}
