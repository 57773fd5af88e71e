use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dsm::generate::tile_canvas;
use dsm::{
    DsmEngine, DsmRaster, ExportRequest, InMemoryCatalog, PointCloudDataset, TileCoord, TileGenerator,
};
use geo::{Coord, Point, Rect};

/// Synthetic generator with a simple elevation gradient.
struct GradientGenerator;

impl TileGenerator for GradientGenerator {
    fn generate(&self, dataset: &PointCloudDataset, tile: TileCoord) -> dsm::Result<Option<DsmRaster>> {
        let mut canvas = tile_canvas(dataset, tile, 1.0)?;
        for row in 0..canvas.height() {
            for col in 0..canvas.width() {
                canvas.set(row, col, ((row + col) % 400) as f32);
            }
        }
        Ok(Some(canvas))
    }
}

fn area() -> Rect<f64> {
    Rect::new(Coord { x: -122.43, y: 37.76 }, Coord { x: -122.41, y: 37.78 })
}

fn engine() -> DsmEngine {
    let dataset = PointCloudDataset::new(1, "bench", 3857).with_boundary(area().to_polygon());
    let catalog = InMemoryCatalog::with_datasets([dataset]).unwrap();
    DsmEngine::builder()
        .catalog(Arc::new(catalog))
        .generator(Arc::new(GradientGenerator))
        .build()
        .unwrap()
}

fn bench_single_cached(c: &mut Criterion) {
    let engine = engine();

    // Warm the tile
    let _ = engine.sample_elevation(37.7749, -122.4194);

    c.bench_function("single_sample_cached", |b| {
        b.iter(|| {
            black_box(
                engine
                    .sample_elevation(black_box(37.7749), black_box(-122.4194))
                    .unwrap(),
            );
        });
    });
}

fn bench_batch_same_tile(c: &mut Criterion) {
    let engine = engine();
    let tile = dsm::point_to_tile(37.7749, -122.4194, 17).bounds();

    // Generate 1000 coords within the same tile
    let coords: Vec<(f64, f64)> = (0..1000)
        .map(|i| {
            let frac = i as f64 / 1000.0;
            (
                tile.min().y + frac * tile.height() * 0.99,
                tile.min().x + frac * tile.width() * 0.99,
            )
        })
        .collect();
    let _ = engine.sample_elevations(&coords);

    c.bench_function("batch_1000_same_tile", |b| {
        b.iter(|| {
            black_box(engine.sample_elevations(black_box(&coords)).unwrap());
        });
    });
}

fn bench_profile(c: &mut Criterion) {
    let engine = engine();
    let tx = Point::new(-122.425, 37.765);
    let rx = Point::new(-122.415, 37.775);
    let _ = engine.surface_profile(tx, rx, 256);

    c.bench_function("profile_256_memoised", |b| {
        b.iter(|| {
            black_box(engine.surface_profile(black_box(tx), black_box(rx), 256).unwrap());
        });
    });
}

fn bench_export(c: &mut Criterion) {
    let engine = engine();
    let aoi = Rect::new(Coord { x: -122.42, y: 37.77 }, Coord { x: -122.415, y: 37.775 }).to_polygon();
    let request = ExportRequest::new(aoi).with_resolution(2.0);

    // Tiles generated once, then merged from the cache
    let _ = engine.export_dsm(&request);

    let mut group = c.benchmark_group("export");
    group.sample_size(10);
    group.bench_function("export_500m_cached_tiles", |b| {
        b.iter(|| {
            black_box(engine.export_dsm(black_box(&request)).unwrap());
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_single_cached,
    bench_batch_same_tile,
    bench_profile,
    bench_export,
);
criterion_main!(benches);
