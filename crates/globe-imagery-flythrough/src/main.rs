//! Headless fly-through over a tiled imagery layer
//!
//! Streams tiles from a directory (or a synthetic source) while a camera descends
//! towards a target, logging what the renderer would draw every few frames.

mod camera;
mod fetcher;
mod settings;

use camera::{Camera, FlightPath};
use fetcher::{FileFetcher, Source, SyntheticFetcher};
use globe_imagery_lib::{ConstantElevation, LayerStats, Result, TiledImageryLayer};
use settings::Settings;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

fn setup_logging() {
    let default_filter = if cfg!(debug_assertions) {
        "debug,globe_imagery_lib=info"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .init();
}

fn main() -> Result<()> {
    setup_logging();
    let settings = Settings::from_cli();
    let config = settings.layer_config();

    if settings.print_config {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::error!("Failed to serialize configuration: {e}"),
        }
        return Ok(());
    }

    // Fetches run on the runtime's workers; the frame loop stays on this thread
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tile-fetch")
        .build()?;

    let source = match &settings.image_root {
        Some(root) => {
            tracing::info!("Reading tiles from {}", root.display());
            Source::Files(FileFetcher::new(
                root.clone(),
                &settings.extension,
                settings.tile_size,
                settings.tile_size,
            )?)
        }
        None => {
            tracing::info!(
                failure_rate = settings.failure_rate,
                latency_ms = settings.latency_ms,
                "Generating synthetic tiles"
            );
            Source::Synthetic(SyntheticFetcher::new(
                settings.tile_size,
                settings.tile_size,
                Duration::from_millis(settings.latency_ms),
                settings.failure_rate,
            ))
        }
    };

    let mut layer = TiledImageryLayer::new(config.clone(), source, runtime.handle().clone())?;
    layer.set_on_resource_failed(|key, error| {
        tracing::debug!(key, %error, "Tile unavailable");
    });

    let path = FlightPath {
        target_lat: settings.target_lat,
        target_lon: settings.target_lon,
        start_altitude: settings.start_altitude,
        end_altitude: settings.end_altitude,
        frames: settings.frames,
    };
    let camera = Camera {
        globe: config.globe,
        fov_y: settings.fov.to_radians(),
        viewport_width: settings.viewport_width,
        viewport_height: settings.viewport_height,
    };
    let elevation = ConstantElevation::new(0.0, settings.max_elevation);
    let frame_interval = Duration::from_millis(settings.frame_ms);

    let started = Instant::now();
    for frame in 0..settings.frames {
        profiling::scope!("frame");
        let frame_start = Instant::now();

        let altitude = path.altitude_at(frame);
        let state = camera.frame_state(path.target_lat, path.target_lon, altitude);
        let deepest = layer
            .assemble_visible_tiles(&state, &elevation)
            .iter()
            .map(|d| d.tile.level())
            .max();

        if settings.log_every > 0 && frame % settings.log_every == 0 {
            log_frame(frame, altitude, deepest, &layer.stats());
        }

        profiling::finish_frame!();
        if let Some(rest) = frame_interval.checked_sub(frame_start.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    let stats = layer.stats();
    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        assemblies = stats.assemblies,
        skipped = stats.skipped_assemblies,
        fetches = stats.fetches_started,
        failures = stats.fetches_failed,
        absent = stats.absent,
        cached_mb = stats.cached_bytes as f64 / (1024.0 * 1024.0),
        "Fly-through finished"
    );

    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}

fn log_frame(frame: u32, altitude: f64, deepest: Option<usize>, stats: &LayerStats) {
    tracing::info!(
        frame,
        altitude_km = altitude / 1000.0,
        deepest_level = deepest.map_or(-1, |l| l as i64),
        drawn = stats.drawn_tiles,
        fallbacks = stats.fallback_tiles,
        missing = stats.missing_tiles,
        in_flight = stats.in_flight,
        cached = stats.cached_textures,
        cached_mb = stats.cached_bytes as f64 / (1024.0 * 1024.0),
        "Frame"
    );
}
