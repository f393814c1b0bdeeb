//! Globe Imagery Library - Tiled raster imagery draped over a 3D globe
//!
//! This library streams multi-resolution image tiles for a virtual globe. Tiles form a
//! quadtree pyramid that is refined as the camera approaches the surface, textures are
//! fetched asynchronously and kept in a byte-budgeted LRU cache, and every frame the
//! visible set is assembled by culling tile bounding volumes against the view frustum.
//!
//! # Architecture
//!
//! - **[`TilePyramid`]**: Fixed level/row/column grid with a memoizing tile-identity cache
//! - **[`BoundingBox`]**: Oriented box per sector, tested against a [`Frustum`]
//! - **[`TextureCache`]**: Byte-budgeted LRU store with pinning
//! - **[`RetrievalCoordinator`]**: Async fetches with per-key dedup and failure backoff
//! - **[`VisibleSetAssembler`]**: Per-frame traversal producing the ordered draw list
//! - **[`TiledImageryLayer`]**: High-level owner wiring all of the above together
//!
//! # Threading
//!
//! Assembly runs synchronously on the render thread. Fetches run on a tokio runtime and
//! report back through a channel that is drained by
//! [`TiledImageryLayer::process_completions`], so cache mutations never interleave with
//! an assembly pass.

mod assembler;
mod bounding;
mod cache;
mod globe;
mod layer;
mod pyramid;
mod retrieval;
mod sector;

// Public API exports
pub use assembler::{
    DetailConfig, DrawTile, FallbackPolicy, FrameState, TexCoordTransform, VisibleSetAssembler,
};
pub use bounding::{BoundingBox, Frustum, Plane};
pub use cache::{CacheConfig, TextureCache};
pub use globe::{ConstantElevation, ElevationModel, Globe};
pub use layer::{Config, LayerStats, Texture, TileFetcher, TiledImageryLayer};
pub use pyramid::{Level, PyramidConfig, Tile, TileKey, TileKind, TilePyramid};
pub use retrieval::{
    AbsentResourceList, RequestOutcome, RetrievalConfig, RetrievalCoordinator, RetrievalEvent,
};
pub use sector::Sector;

/// Error types for the imagery library
#[derive(Debug, thiserror::Error)]
pub enum ImageryError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid level {level}: the pyramid has {level_count} levels")]
    InvalidLevel { level: usize, level_count: usize },

    #[error("Degenerate sector: {0}")]
    DegenerateSector(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a [`TileFetcher`] for a single resource
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetrievalError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl From<std::io::Error> for RetrievalError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ImageryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that all public types are accessible
        let _: fn() -> Config = Config::default;
        let _: fn() -> Globe = Globe::wgs84;
        let _: fn(&PyramidConfig) -> Result<TilePyramid> = TilePyramid::new;
    }

    #[test]
    fn test_retrieval_error_from_io() {
        let err: RetrievalError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing tile").into();
        assert!(matches!(err, RetrievalError::Io(ref msg) if msg.contains("missing tile")));
    }
}
