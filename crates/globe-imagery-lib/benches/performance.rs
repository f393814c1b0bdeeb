//! Performance benchmarks for globe-imagery-lib
//!
//! Run with: cargo bench --package globe-imagery-lib

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use glam::DMat4;
use globe_imagery_lib::{
    CacheConfig, Config, ConstantElevation, FrameState, Frustum, Globe, PyramidConfig,
    RetrievalError, Texture, TextureCache, TileFetcher, TilePyramid, TiledImageryLayer,
};
use std::future::Future;

/// Serves a tiny texture for every key without any latency
struct InstantFetcher;

impl TileFetcher for InstantFetcher {
    fn fetch(
        &self,
        _key: &str,
    ) -> impl Future<Output = Result<Texture, RetrievalError>> + Send {
        async { Ok(Texture::new(4, 4, vec![128u8; 64])) }
    }
}

/// Nadir-looking camera above a point, mirroring what a renderer would hand in
fn frame_above(lat: f64, lon: f64, altitude: f64) -> FrameState {
    let globe = Globe::wgs84();
    let eye = globe.compute_point_from_position(lat, lon, altitude);
    let target = globe.compute_point_from_position(lat, lon, 0.0);
    let up = globe.north_tangent_at_location(lat, lon);
    let fov = 45f64.to_radians();

    let horizon = (altitude * (2.0 * globe.equatorial_radius + altitude)).sqrt();
    let near = (altitude * 0.1).max(1.0);
    let projection = DMat4::perspective_rh(fov, 16.0 / 9.0, near, horizon * 1.1 + near);
    let view = DMat4::look_at_rh(eye, target, up);

    FrameState::perspective(
        Frustum::from_view_projection(projection * view),
        eye,
        fov,
        1080.0,
    )
}

// ============================================================================
// Core Benchmarks - Key performance indicators
// ============================================================================

fn bench_subdivision(c: &mut Criterion) {
    let mut group = c.benchmark_group("pyramid");

    // Full quadtree down to level 6 from one top-level tile
    let config = PyramidConfig {
        tile_cache_capacity: 8192,
        ..PyramidConfig::default()
    };
    let tiles_per_pass: u64 = (1..=6).map(|l| 4u64.pow(l)).sum();

    group.throughput(Throughput::Elements(tiles_per_pass));
    group.bench_function("subdivide_to_level_6", |b| {
        let mut pyramid = TilePyramid::new(&config).unwrap();
        let root = pyramid.top_level_tiles()[0].clone();
        b.iter(|| {
            let mut frontier = vec![root.clone()];
            for _ in 0..6 {
                let mut next = Vec::with_capacity(frontier.len() * 4);
                for tile in &frontier {
                    next.extend(pyramid.subdivide(tile).unwrap());
                }
                frontier = next;
            }
            frontier.len()
        });
    });

    group.finish();
}

fn bench_cache_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");

    for entries in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(entries as u64));
        group.bench_with_input(BenchmarkId::new("put_get", entries), &entries, |b, &n| {
            let keys: Vec<String> = (0..n).map(|i| format!("imagery/8/{i}/{i}_{i}")).collect();
            b.iter(|| {
                // Room for roughly half the working set
                let mut cache = TextureCache::new(CacheConfig {
                    capacity_bytes: n * 32,
                    low_water_bytes: n * 24,
                })
                .unwrap();
                for (i, key) in keys.iter().enumerate() {
                    cache.put(key, i, 64);
                    if i % 3 == 0 {
                        cache.get(&keys[i / 2]);
                    }
                }
                cache.used_bytes()
            });
        });
    }

    group.finish();
}

fn bench_frame_assembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("assembly");
    group.sample_size(20);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let elevation = ConstantElevation::new(0.0, 4000.0);

    for altitude in [2.0e7, 2.0e5, 5.0e3] {
        let frame = frame_above(46.5, 8.0, altitude);
        let mut layer =
            TiledImageryLayer::new(Config::default(), InstantFetcher, runtime.handle().clone())
                .unwrap();

        // Warm up until every visible texture is resident
        for _ in 0..50 {
            layer.assemble_visible_tiles(&frame, &elevation);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        group.bench_with_input(
            BenchmarkId::new("cold_traversal", altitude as u64),
            &frame,
            |b, frame| {
                b.iter(|| {
                    layer.mark_stale();
                    layer.assemble_visible_tiles(frame, &elevation).len()
                });
            },
        );
    }

    group.finish();
}

// ============================================================================
// Criterion Configuration
// ============================================================================

criterion_group!(
    benches,
    bench_subdivision,
    bench_cache_churn,
    bench_frame_assembly,
);

criterion_main!(benches);
