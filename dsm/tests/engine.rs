//! End-to-end tests of the DSM engine over an in-memory store and catalog.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use dsm::crs::lon_lat_to_mercator;
use dsm::generate::tile_canvas;
use dsm::slippy::tiles_covering;
use dsm::{
    BlobStore, DatasetId, DsmEngine, DsmError, ExportRequest, FsBlobStore, InMemoryCatalog, MemoryBlobStore,
    PointCloudDataset, RetryPolicy, Sample, TileCoord, TileGenerator, TileKey,
};
use geo::{Coord, MultiPolygon, Point, Polygon, Rect};
use parking_lot::Mutex;

const ZOOM: u8 = 17;

/// Renders every tile filled with the year the dataset was collected.
#[derive(Default)]
struct YearGenerator {
    calls: AtomicUsize,
    per_key: Mutex<HashMap<(DatasetId, TileCoord), usize>>,
    failing: HashSet<DatasetId>,
}

impl YearGenerator {
    fn failing(ids: &[DatasetId]) -> Self {
        Self {
            failing: ids.iter().copied().collect(),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn calls_for(&self, dataset: DatasetId, tile: TileCoord) -> usize {
        self.per_key.lock().get(&(dataset, tile)).copied().unwrap_or(0)
    }
}

impl TileGenerator for YearGenerator {
    fn generate(&self, dataset: &PointCloudDataset, tile: TileCoord) -> dsm::Result<Option<dsm::DsmRaster>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.per_key.lock().entry((dataset.id, tile)).or_default() += 1;
        thread::sleep(Duration::from_millis(20));

        if self.failing.contains(&dataset.id) {
            return Err(DsmError::GenerationFailed {
                dataset: dataset.id,
                zoom: tile.zoom,
                x: tile.x,
                y: tile.y,
                reason: "point cloud unreachable".to_string(),
            });
        }

        let mut canvas = tile_canvas(dataset, tile, 2.0)?;
        let year = dataset.collection_end.map_or(0, |d| d.year()) as f32;
        for row in 0..canvas.height() {
            for col in 0..canvas.width() {
                canvas.set(row, col, year);
            }
        }
        Ok(Some(canvas))
    }
}

/// Top-left tile of the 2×2 block the scenario uses.
fn base_tile() -> TileCoord {
    dsm::point_to_tile(37.7749, -122.4194, ZOOM)
}

fn tile(dx: u32, dy: u32) -> TileCoord {
    let base = base_tile();
    TileCoord::new(base.x + dx, base.y + dy, ZOOM)
}

/// `rect` shrunk by `inset` degrees on every side.
fn inset(rect: Rect<f64>, inset: f64) -> Polygon<f64> {
    Rect::new(
        Coord {
            x: rect.min().x + inset,
            y: rect.min().y + inset,
        },
        Coord {
            x: rect.max().x - inset,
            y: rect.max().y - inset,
        },
    )
    .to_polygon()
}

fn block_rect() -> Rect<f64> {
    let nw = tile(0, 0).bounds();
    let se = tile(1, 1).bounds();
    Rect::new(
        Coord {
            x: nw.min().x,
            y: se.min().y,
        },
        Coord {
            x: se.max().x,
            y: nw.max().y,
        },
    )
}

/// The 2×2 block of tiles, slightly inset so neighbours are not touched.
fn block_area() -> Polygon<f64> {
    inset(block_rect(), 1e-6)
}

fn date(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y, m, d)
}

/// Dataset 1 (2010, UTM) covers the whole block; dataset 2 (2021, Web
/// Mercator) covers only the top-left tile.
fn catalog() -> InMemoryCatalog {
    let older = PointCloudDataset::new(1, "CA_SanFranCoast_2010", 32610)
        .with_boundary(inset(block_rect(), -0.001))
        .with_collection_dates(date(2010, 4, 1), date(2010, 7, 31));
    let newer = PointCloudDataset::new(2, "CA_SF_2021", 3857)
        .with_boundary(inset(tile(0, 0).bounds(), 1e-5))
        .with_collection_dates(date(2021, 1, 10), date(2021, 3, 15));
    InMemoryCatalog::with_datasets([older, newer]).unwrap()
}

fn engine_with(store: Arc<dyn BlobStore>, generator: Arc<YearGenerator>) -> DsmEngine {
    DsmEngine::builder()
        .blob_store(store)
        .catalog(Arc::new(catalog()))
        .generator(generator)
        .generation_retry(RetryPolicy::none())
        .fetch_concurrency(4)
        .build()
        .unwrap()
}

fn engine() -> (DsmEngine, Arc<YearGenerator>) {
    let generator = Arc::new(YearGenerator::default());
    (engine_with(Arc::new(MemoryBlobStore::new()), generator.clone()), generator)
}

fn center(t: TileCoord) -> (f64, f64) {
    let c = t.center();
    (c.y(), c.x())
}

#[test]
fn test_sample_prefers_most_recent_dataset() {
    let (engine, generator) = engine();

    let (lat, lon) = center(tile(0, 0));
    assert_eq!(engine.sample_elevation(lat, lon).unwrap(), Sample::Found(2021.0));

    let (lat, lon) = center(tile(1, 1));
    assert_eq!(engine.sample_elevation(lat, lon).unwrap(), Sample::Found(2010.0));

    // The older dataset was never needed for the top-left tile
    assert_eq!(generator.calls_for(1, tile(0, 0)), 0);
    assert_eq!(generator.calls_for(2, tile(0, 0)), 1);
}

#[test]
fn test_sample_without_coverage() {
    let (engine, generator) = engine();
    assert_eq!(engine.sample_elevation(0.5, 0.5).unwrap(), Sample::NoData);
    assert_eq!(engine.sample_elevation_legacy(0.5, 0.5).unwrap(), 0.0);
    assert_eq!(generator.calls(), 0);
}

#[test]
fn test_batch_sampling_keeps_order() {
    let (engine, generator) = engine();
    let coords = vec![center(tile(1, 1)), (0.5, 0.5), center(tile(0, 0)), center(tile(1, 1))];
    let samples = engine.sample_elevations(&coords).unwrap();
    assert_eq!(
        samples,
        vec![
            Sample::Found(2010.0),
            Sample::NoData,
            Sample::Found(2021.0),
            Sample::Found(2010.0)
        ]
    );
    // Repeated points in one tile share one generation
    assert_eq!(generator.calls_for(1, tile(1, 1)), 1);
}

#[test]
fn test_concurrent_requests_generate_once() {
    let (engine, generator) = engine();
    let engine = Arc::new(engine);
    let (lat, lon) = center(tile(1, 0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.sample_elevation(lat, lon).unwrap())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Sample::Found(2010.0));
    }
    assert_eq!(generator.calls_for(1, tile(1, 0)), 1);
}

#[test]
fn test_stored_tiles_are_reused_across_engines() {
    let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    let first = Arc::new(YearGenerator::default());
    let (lat, lon) = center(tile(0, 1));

    let engine = engine_with(store.clone(), first.clone());
    assert_eq!(engine.sample_elevation(lat, lon).unwrap(), Sample::Found(2010.0));
    assert_eq!(first.calls(), 1);

    let second = Arc::new(YearGenerator::default());
    let engine = engine_with(store.clone(), second.clone());
    assert_eq!(engine.sample_elevation(lat, lon).unwrap(), Sample::Found(2010.0));
    assert_eq!(second.calls(), 0);
}

#[test]
fn test_failed_dataset_falls_through_to_older() {
    let generator = Arc::new(YearGenerator::failing(&[2]));
    let engine = engine_with(Arc::new(MemoryBlobStore::new()), generator.clone());

    let (lat, lon) = center(tile(0, 0));
    assert_eq!(engine.sample_elevation(lat, lon).unwrap(), Sample::Found(2010.0));
    assert_eq!(generator.calls_for(2, tile(0, 0)), 1);
}

#[test]
fn test_corrupt_tile_is_regenerated() {
    let store = Arc::new(MemoryBlobStore::new());
    let key = TileKey::new(1, tile(1, 1));
    store.put(&key.blob_key(), b"definitely not a tiff").unwrap();

    let generator = Arc::new(YearGenerator::default());
    let engine = engine_with(store.clone(), generator.clone());
    let (lat, lon) = center(tile(1, 1));
    assert_eq!(engine.sample_elevation(lat, lon).unwrap(), Sample::Found(2010.0));
    assert_eq!(generator.calls_for(1, tile(1, 1)), 1);
    assert!(engine.tile_store().get(&key).unwrap().is_some());
}

#[test]
fn test_export_merges_by_recency() {
    let (engine, _) = engine();
    let request = ExportRequest::new(block_area()).with_resolution(4.0);
    assert_eq!(tiles_covering(&request.area, ZOOM).len(), 4);

    let export = engine.export_dsm(&request).unwrap();
    let stats = &export.stats;
    assert_eq!(stats.tiles_total, 4);
    assert_eq!(stats.tiles_resolved, 4);
    assert_eq!(stats.tiles_failed, 0);
    assert_eq!(stats.datasets, vec![2, 1]);
    assert!(stats.pixels_written > 0);

    let at = |t: TileCoord| {
        let c = t.center();
        let (x, y) = lon_lat_to_mercator(c.x(), c.y());
        export.raster.sample_at(x, y)
    };
    assert_eq!(at(tile(0, 0)), Some(2021.0));
    assert_eq!(at(tile(1, 0)), Some(2010.0));
    assert_eq!(at(tile(0, 1)), Some(2010.0));
    assert_eq!(at(tile(1, 1)), Some(2010.0));
    assert_eq!(export.raster.crs(), 3857);

    // The newer tile's generation buffer stays out of the older neighbour
    let edge = tile(1, 0).bounds().min().x;
    let (edge_x, _) = lon_lat_to_mercator(edge, 0.0);
    let (_, y) = lon_lat_to_mercator(0.0, tile(1, 0).center().y());
    assert_eq!(export.raster.sample_at(edge_x + 2.0, y), Some(2010.0));
    assert_eq!(export.raster.sample_at(edge_x + 6.0, y), Some(2010.0));
    assert_eq!(export.raster.sample_at(edge_x - 2.0, y), Some(2021.0));
}

#[test]
fn test_export_without_coverage_is_empty_not_an_error() {
    let (engine, generator) = engine();
    let area = inset(dsm::slippy::tile_to_bounds(65536, 65536, ZOOM), 1e-6);
    let export = engine.export_dsm(&ExportRequest::new(area).with_resolution(4.0)).unwrap();
    assert_eq!(export.stats.tiles_no_coverage, export.stats.tiles_total);
    assert_eq!(export.raster.valid_pixel_count(), 0);
    assert_eq!(generator.calls(), 0);
}

#[test]
fn test_export_fails_when_every_tile_fails() {
    let generator = Arc::new(YearGenerator::failing(&[1, 2]));
    let engine = engine_with(Arc::new(MemoryBlobStore::new()), generator);
    let err = engine
        .export_dsm(&ExportRequest::new(block_area()).with_resolution(4.0))
        .unwrap_err();
    assert!(matches!(err, DsmError::NoTilesProduced { failed: 4 }), "{}", err);
}

#[test]
fn test_export_rejects_empty_selection() {
    let (engine, _) = engine();
    let err = engine
        .export_dsm(&ExportRequest::new(MultiPolygon::new(vec![])))
        .unwrap_err();
    assert_eq!(err.to_string(), "Selection empty");
}

#[test]
fn test_store_and_load_export() {
    let dir = tempfile::TempDir::new().unwrap();
    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.path()).unwrap());
    let engine = engine_with(store, Arc::new(YearGenerator::default()));

    let export = engine
        .export_dsm(&ExportRequest::new(block_area()).with_resolution(8.0))
        .unwrap();
    let key = dsm::export_key("job-1", 8.0);
    engine.store_export(&key, &export).unwrap();

    let bytes = engine.load_export(&key).unwrap().unwrap();
    let raster = dsm::DsmRaster::from_geotiff(&bytes).unwrap();
    assert_eq!(raster.width(), export.raster.width());
    assert_eq!(raster.valid_pixel_count(), export.raster.valid_pixel_count());
    assert!(dir.path().join("exports/8.00/dsm-export-job-1.tif").exists());
}

#[test]
fn test_profile_is_memoised() {
    let (engine, generator) = engine();
    let tx = tile(0, 0).center();
    let rx = tile(1, 1).center();

    let profile = engine.surface_profile(tx, rx, 16).unwrap();
    assert_eq!(profile.len(), 16);
    assert_eq!(profile.points[0].elevation, Some(2021.0));
    assert_eq!(profile.points[15].elevation, Some(2010.0));
    let calls = generator.calls();

    // Sub-centimetre jitter lands in the same cache bucket
    let jittered = Point::new(tx.x() + 1e-9, tx.y() - 1e-9);
    let again = engine.surface_profile(jittered, rx, 16).unwrap();
    assert_eq!(again, profile);
    assert_eq!(generator.calls(), calls);
    assert_eq!(engine.stats().result_cache.hit_count, 1);

    // A different sample count is a different query
    let coarse = engine.surface_profile(tx, rx, 4).unwrap();
    assert_eq!(coarse.len(), 4);
}

#[test]
fn test_generate_dataset_fills_store() {
    let (engine, generator) = engine();
    let report = engine.generate_dataset(2).unwrap();
    assert_eq!(report.generated, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(generator.calls_for(2, tile(0, 0)), 1);

    let again = engine.generate_dataset(2).unwrap();
    assert_eq!(again.generated, 0);
    assert_eq!(again.already_present, 1);

    assert!(matches!(
        engine.generate_dataset(99),
        Err(DsmError::DatasetNotFound { dataset: 99 })
    ));
}

#[test]
fn test_stats_count_tile_cache() {
    let (engine, _) = engine();
    let (lat, lon) = center(tile(1, 1));
    engine.sample_elevation(lat, lon).unwrap();
    engine.sample_elevation(lat, lon).unwrap();

    let stats = engine.stats();
    assert_eq!(stats.datasets, 2);
    assert_eq!(stats.tile_cache.hit_count, 1);
    assert_eq!(stats.tile_cache.miss_count, 1);
    assert_eq!(stats.tile_cache.entry_count, 1);
}
