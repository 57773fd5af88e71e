//! DSM tile engine.
//!
//! [`DsmEngine`] answers the two questions the rest of the system asks:
//! "what is the surface elevation here?" and "give me a DSM raster for this
//! area". It is an orchestrator: the catalog picks datasets, the tile store
//! holds rasters, the generation queue fills gaps and the mosaic merges.
//!
//! # Example
//!
//! ```ignore
//! use dsm::{DsmEngine, ExportRequest};
//!
//! let engine = DsmEngine::builder()
//!     .data_dir("/data/dsm")
//!     .catalog(catalog)
//!     .build()?;
//!
//! match engine.sample_elevation(37.7749, -122.4194)? {
//!     Sample::Found(elevation) => println!("{elevation} m"),
//!     Sample::NoData => println!("no coverage"),
//! }
//!
//! let export = engine.export_dsm(&ExportRequest::new(aoi))?;
//! export.raster.write_to_file("dsm.tif")?;
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use geo::{BoundingRect, ChamberlainDuquetteArea, MultiPolygon, Point};
use moka::sync::Cache;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, CacheStats, CacheStore, ResultCache, DEFAULT_TTL, QUERY_LIDAR};
use crate::catalog::{Catalog, InMemoryCatalog};
use crate::crs::{CrsTransformer, EPSG_WGS84};
use crate::dataset::{recency_order, validate_boundary, Area, DatasetId, PointCloudDataset};
use crate::error::{DsmError, Result};
use crate::generate::{
    GenerationConfig, GenerationOutcome, GenerationReport, TileGenerationQueue, TileGenerator,
};
use crate::mosaic::{self, MosaicGrid, MosaicSource};
use crate::profile::{sample_positions, SurfaceProfile};
use crate::raster::DsmRaster;
use crate::retry::RetryPolicy;
use crate::slippy::{point_to_tile, tiles_covering, TileCoord, DEFAULT_OUTPUT_ZOOM, MAX_ZOOM};
use crate::store::{BlobStore, FsBlobStore, MemoryBlobStore};
use crate::tiles::{TileKey, TileStore};

#[cfg(feature = "download")]
use crate::download::{HttpTileSource, TileSourceConfig};

/// Default export pixel size in metres.
pub const DEFAULT_EXPORT_RESOLUTION: f64 = 1.0;

/// Default number of worker threads for tile fan-out.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 8;

/// Default maximum export area.
pub const DEFAULT_MAX_AREA_KM2: f64 = 100.0;

/// Default number of decoded tiles kept in memory.
pub const DEFAULT_TILE_CACHE_SIZE: u64 = 256;

/// Default number of memoised profile results.
pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// Result of sampling one point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Sample {
    Found(f32),
    /// No dataset covers the point, or the covering tile has no value there.
    NoData,
}

impl Sample {
    pub fn value(&self) -> Option<f32> {
        match self {
            Sample::Found(v) => Some(*v),
            Sample::NoData => None,
        }
    }

    /// The value with `0` standing in for no data.
    ///
    /// A real elevation of 0 m is indistinguishable from no data here.
    pub fn legacy_value(&self) -> f32 {
        self.value().unwrap_or(0.0)
    }
}

/// Tunables of a [`DsmEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub export_zoom: u8,
    pub sample_zoom: u8,
    /// Export pixel size in metres (EPSG:3857).
    pub export_resolution: f64,
    pub fetch_concurrency: usize,
    pub max_area_km2: f64,
    pub generation: GenerationConfig,
    pub tile_cache_size: u64,
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            export_zoom: DEFAULT_OUTPUT_ZOOM,
            sample_zoom: DEFAULT_OUTPUT_ZOOM,
            export_resolution: DEFAULT_EXPORT_RESOLUTION,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            max_area_km2: DEFAULT_MAX_AREA_KM2,
            generation: GenerationConfig::default(),
            tile_cache_size: DEFAULT_TILE_CACHE_SIZE,
            cache_ttl: DEFAULT_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(DsmError::InvalidConfig { reason });
        if self.export_zoom > MAX_ZOOM || self.sample_zoom > MAX_ZOOM {
            return invalid(format!("zoom must be at most {}", MAX_ZOOM));
        }
        if !(self.export_resolution > 0.0) {
            return invalid(format!(
                "export resolution must be positive, got {}",
                self.export_resolution
            ));
        }
        if self.fetch_concurrency == 0 {
            return invalid("fetch concurrency must be at least 1".to_string());
        }
        if !(self.max_area_km2 > 0.0) {
            return invalid(format!("maximum area must be positive, got {}", self.max_area_km2));
        }
        if self.generation.attempt_timeout.is_zero() {
            return invalid("generation timeout must be positive".to_string());
        }
        Ok(())
    }
}

/// An area-of-interest export request. Coordinates are WGS84 `(lon, lat)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    pub area: MultiPolygon<f64>,
    /// Pixel size in metres; the engine default when `None`.
    pub resolution: Option<f64>,
}

impl ExportRequest {
    pub fn new(area: impl Into<MultiPolygon<f64>>) -> Self {
        Self {
            area: area.into(),
            resolution: None,
        }
    }

    pub fn with_resolution(mut self, resolution: f64) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Geodesic area of the selection in km².
    pub fn area_km2(&self) -> f64 {
        self.area.chamberlain_duquette_unsigned_area() / 1_000_000.0
    }

    /// Reject empty, malformed or oversized selections.
    pub fn validate(&self, max_area_km2: f64) -> Result<()> {
        if self.area.0.is_empty() || self.area.iter().all(|p| p.exterior().0.is_empty()) {
            return Err(DsmError::InvalidArea {
                reason: "Selection empty".to_string(),
            });
        }
        validate_boundary(&self.area)?;

        let area = self.area_km2();
        if area > max_area_km2 {
            return Err(DsmError::InvalidArea {
                reason: format!(
                    "Maximum area exceeded: {:.2} km2 | limit {} km2",
                    area, max_area_km2
                ),
            });
        }
        if let Some(resolution) = self.resolution {
            if !(resolution > 0.0) {
                return Err(DsmError::InvalidArea {
                    reason: format!("Resolution must be positive, got {}", resolution),
                });
            }
        }
        Ok(())
    }
}

/// What an export did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportStats {
    pub tiles_total: usize,
    /// Tiles for which some dataset provided a raster.
    pub tiles_resolved: usize,
    /// Tiles no dataset intersects.
    pub tiles_no_coverage: usize,
    /// Tiles whose datasets had no points there.
    pub tiles_without_data: usize,
    /// Tiles lost to generation or store failures.
    pub tiles_failed: usize,
    /// Datasets used, in merge priority order.
    pub datasets: Vec<DatasetId>,
    pub pixels_written: usize,
    pub width: u32,
    pub height: u32,
    pub resolution: f64,
    pub elapsed_ms: u64,
}

/// A merged DSM and how it was produced.
#[derive(Debug, Clone)]
pub struct ExportResult {
    pub raster: DsmRaster,
    pub stats: ExportStats,
}

/// Cache and catalog counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub datasets: usize,
    pub tile_cache: CacheStats,
    pub result_cache: CacheStats,
}

/// Blob key of a stored export.
pub fn export_key(id: &str, resolution: f64) -> String {
    format!("exports/{:.2}/dsm-export-{}.tif", resolution, id)
}

fn validate_point(lat: f64, lon: f64) -> Result<()> {
    if !lat.is_finite() || !lon.is_finite() || !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(DsmError::InvalidGeometry {
            reason: format!("coordinate ({}, {}) outside WGS84 range", lat, lon),
        });
    }
    Ok(())
}

/// Generator used when none is configured: only already stored tiles exist.
struct StoredTilesOnly;

impl TileGenerator for StoredTilesOnly {
    fn generate(&self, _: &PointCloudDataset, _: TileCoord) -> Result<Option<DsmRaster>> {
        Ok(None)
    }
}

struct TileLookup {
    found: Option<(Arc<PointCloudDataset>, Arc<DsmRaster>)>,
    candidates: usize,
    failures: usize,
}

/// Stateless DSM orchestrator over a catalog, a tile store and a generator.
pub struct DsmEngine {
    catalog: Arc<dyn Catalog>,
    queue: TileGenerationQueue,
    results: ResultCache,
    /// Decoded tiles, keyed by (dataset, tile).
    tile_cache: Cache<TileKey, Arc<DsmRaster>>,
    tile_hits: AtomicU64,
    tile_misses: AtomicU64,
    pool: ThreadPool,
    config: EngineConfig,
}

impl std::fmt::Debug for DsmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DsmEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DsmEngine {
    /// Create a builder for more configuration options.
    pub fn builder() -> DsmEngineBuilder {
        DsmEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn tile_store(&self) -> &TileStore {
        self.queue.store()
    }

    /// Valid datasets intersecting `area`, most recent first.
    pub fn datasets_intersecting(&self, area: &Area) -> Vec<Arc<PointCloudDataset>> {
        self.catalog.datasets_intersecting(area)
    }

    /// Surface elevation at a WGS84 coordinate.
    ///
    /// Candidate datasets for the containing tile (at the sampling zoom) are
    /// tried in recency order; the first one with a tile answers.
    ///
    /// # Returns
    ///
    /// - `Ok(Sample::Found(elevation))` - elevation in metres
    /// - `Ok(Sample::NoData)` - no coverage or a no-data pixel
    /// - `Err(...)` - invalid coordinates or the tile store is unreachable
    pub fn sample_elevation(&self, lat: f64, lon: f64) -> Result<Sample> {
        let samples = self.sample_elevations(&[(lat, lon)])?;
        Ok(samples.into_iter().next().unwrap_or(Sample::NoData))
    }

    /// [`Self::sample_elevation`] with `0` for no data.
    pub fn sample_elevation_legacy(&self, lat: f64, lon: f64) -> Result<f32> {
        Ok(self.sample_elevation(lat, lon)?.legacy_value())
    }

    /// Sample many `(lat, lon)` coordinates.
    ///
    /// Coordinates are grouped by tile so each tile is resolved once; groups
    /// run on the engine's worker pool. Results keep input order.
    pub fn sample_elevations(&self, coords: &[(f64, f64)]) -> Result<Vec<Sample>> {
        for &(lat, lon) in coords {
            validate_point(lat, lon)?;
        }

        let mut groups: HashMap<TileCoord, Vec<usize>> = HashMap::new();
        for (i, &(lat, lon)) in coords.iter().enumerate() {
            let tile = point_to_tile(lat, lon, self.config.sample_zoom);
            groups.entry(tile).or_default().push(i);
        }
        let groups: Vec<(TileCoord, Vec<usize>)> = groups.into_iter().collect();

        let sampled: Vec<Result<Vec<(usize, Sample)>>> = self.pool.install(|| {
            groups
                .par_iter()
                .map(|(tile, indices)| self.sample_group(*tile, indices, coords))
                .collect()
        });

        let mut results = vec![Sample::NoData; coords.len()];
        for group in sampled {
            for (i, sample) in group? {
                results[i] = sample;
            }
        }
        Ok(results)
    }

    fn sample_group(
        &self,
        tile: TileCoord,
        indices: &[usize],
        coords: &[(f64, f64)],
    ) -> Result<Vec<(usize, Sample)>> {
        let lookup = self.lookup_tile(tile)?;
        let Some((dataset, raster)) = lookup.found else {
            return Ok(indices.iter().map(|&i| (i, Sample::NoData)).collect());
        };
        tracing::debug!(%tile, dataset = dataset.id, points = indices.len(), "Sampling tile");

        let to_native = CrsTransformer::new(EPSG_WGS84, raster.crs())?;
        indices
            .iter()
            .map(|&i| {
                let (lat, lon) = coords[i];
                let (x, y) = to_native.transform(lon, lat)?;
                let sample = raster.sample_at(x, y).map_or(Sample::NoData, Sample::Found);
                Ok((i, sample))
            })
            .collect()
    }

    /// DSM profile from `tx` to `rx` (`(lon, lat)` points), memoised.
    ///
    /// The cache key buckets both endpoints and anchors the area of interest
    /// at the south-west corner of the link's bounding box.
    pub fn surface_profile(&self, tx: Point<f64>, rx: Point<f64>, samples: usize) -> Result<SurfaceProfile> {
        if samples < 2 {
            return Err(DsmError::InvalidGeometry {
                reason: format!("a profile needs at least 2 samples, got {}", samples),
            });
        }
        validate_point(tx.y(), tx.x())?;
        validate_point(rx.y(), rx.x())?;

        let anchor = Point::new(tx.x().min(rx.x()), tx.y().min(rx.y()));
        let query_type = format!("{}/{}", QUERY_LIDAR, samples);
        let key = CacheKey::new(&query_type, tx, rx, anchor);

        self.results.get_or_compute(&key, || {
            let positions = sample_positions(tx, rx, samples);
            let coords: Vec<(f64, f64)> = positions.iter().map(|p| (p.y(), p.x())).collect();
            let elevations: Vec<Option<f32>> = self
                .sample_elevations(&coords)?
                .iter()
                .map(Sample::value)
                .collect();
            Ok(SurfaceProfile::from_samples(&positions, &elevations))
        })
    }

    /// Merge a DSM for the request's area.
    ///
    /// Each tile at the export zoom is resolved independently against the
    /// datasets intersecting that tile, concurrently on the worker pool.
    /// Resolved tiles are merged in dataset recency order, so the newest
    /// dataset wins wherever tiles overlap.
    ///
    /// # Errors
    ///
    /// - [`DsmError::InvalidArea`] / [`DsmError::InvalidGeometry`] for a
    ///   rejected selection
    /// - [`DsmError::NoTilesProduced`] when datasets cover the area but every
    ///   tile failed
    ///
    /// Missing coverage is not an error: those pixels stay no-data.
    pub fn export_dsm(&self, request: &ExportRequest) -> Result<ExportResult> {
        let started = Instant::now();
        request.validate(self.config.max_area_km2)?;

        let resolution = request.resolution.unwrap_or(self.config.export_resolution);
        let bounds = request.area.bounding_rect().ok_or_else(|| DsmError::InvalidArea {
            reason: "Selection empty".to_string(),
        })?;
        let grid = MosaicGrid::covering(bounds, resolution)?;
        let tiles = tiles_covering(&request.area, self.config.export_zoom);

        tracing::info!(
            tiles = tiles.len(),
            zoom = self.config.export_zoom,
            resolution,
            width = grid.width,
            height = grid.height,
            "Exporting DSM"
        );

        let lookups: Vec<(TileCoord, Result<TileLookup>)> = self.pool.install(|| {
            tiles
                .par_iter()
                .map(|tile| (*tile, self.lookup_tile(*tile)))
                .collect()
        });

        let mut stats = ExportStats {
            tiles_total: tiles.len(),
            resolution,
            ..Default::default()
        };
        let mut picks: Vec<(TileCoord, Arc<PointCloudDataset>, Arc<DsmRaster>)> = Vec::new();
        for (tile, lookup) in lookups {
            match lookup {
                Ok(TileLookup {
                    found: Some((dataset, raster)),
                    ..
                }) => {
                    stats.tiles_resolved += 1;
                    picks.push((tile, dataset, raster));
                }
                Ok(lookup) if lookup.candidates == 0 => stats.tiles_no_coverage += 1,
                Ok(lookup) if lookup.failures > 0 => stats.tiles_failed += 1,
                Ok(_) => stats.tiles_without_data += 1,
                Err(e) => {
                    tracing::warn!(%tile, error = %e, "Tile dropped from export");
                    stats.tiles_failed += 1;
                }
            }
        }

        if picks.is_empty() && stats.tiles_failed > 0 {
            return Err(DsmError::NoTilesProduced {
                failed: stats.tiles_failed,
            });
        }

        // Apply in priority order, not arrival order
        picks.sort_by(|a, b| recency_order(&a.1, &b.1).then_with(|| a.0.cmp(&b.0)));
        for (_, dataset, _) in &picks {
            if !stats.datasets.contains(&dataset.id) {
                stats.datasets.push(dataset.id);
            }
        }

        // Each tile owns its own bounds; generation buffers only fill seams
        let sources: Vec<MosaicSource<'_>> = picks
            .iter()
            .map(|(tile, _, raster)| MosaicSource::new(raster.as_ref()).clipped_to(tile.bounds()))
            .collect();
        let (raster, merged) = mosaic::merge_sources(&grid, &sources)?;

        stats.pixels_written = merged.pixels_written;
        stats.width = grid.width;
        stats.height = grid.height;
        stats.elapsed_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            resolved = stats.tiles_resolved,
            no_coverage = stats.tiles_no_coverage,
            failed = stats.tiles_failed,
            datasets = ?stats.datasets,
            elapsed_ms = stats.elapsed_ms,
            "DSM export finished"
        );
        Ok(ExportResult { raster, stats })
    }

    /// Write an export's GeoTIFF to the blob store under `key`.
    pub fn store_export(&self, key: &str, export: &ExportResult) -> Result<()> {
        let bytes = export.raster.to_geotiff()?;
        self.tile_store().blobs().put(key, &bytes)
    }

    /// Read a stored export's GeoTIFF bytes.
    pub fn load_export(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.tile_store().blobs().get(key)
    }

    /// Pre-generate every tile of a dataset at the export zoom.
    pub fn generate_dataset(&self, id: DatasetId) -> Result<GenerationReport> {
        let dataset = self.catalog.get(id)?;
        self.pool
            .install(|| self.queue.generate_dataset(&dataset, self.config.export_zoom))
    }

    pub fn stats(&self) -> EngineStats {
        self.tile_cache.run_pending_tasks();
        EngineStats {
            datasets: self.catalog.all_including_invalid().len(),
            tile_cache: CacheStats {
                entry_count: self.tile_cache.entry_count(),
                hit_count: self.tile_hits.load(Ordering::Relaxed),
                miss_count: self.tile_misses.load(Ordering::Relaxed),
                error_count: 0,
            },
            result_cache: self.results.stats(),
        }
    }

    /// Drop all decoded tiles from memory.
    pub fn clear_tile_cache(&self) {
        self.tile_cache.invalidate_all();
    }

    fn lookup_tile(&self, tile: TileCoord) -> Result<TileLookup> {
        let candidates = self.catalog.datasets_intersecting(&Area::Rect(tile.bounds()));
        let mut lookup = TileLookup {
            found: None,
            candidates: candidates.len(),
            failures: 0,
        };

        for dataset in candidates {
            match self.resolve_tile(&dataset, tile) {
                Ok(Some(raster)) => {
                    lookup.found = Some((dataset, raster));
                    break;
                }
                Ok(None) => {}
                Err(e @ (DsmError::GenerationFailed { .. } | DsmError::GenerationTimeout { .. })) => {
                    tracing::warn!(%tile, dataset = dataset.id, error = %e, "Tile unavailable, trying next dataset");
                    lookup.failures += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(lookup)
    }

    /// Fetch a tile, generating it if absent or corrupt.
    fn resolve_tile(&self, dataset: &Arc<PointCloudDataset>, tile: TileCoord) -> Result<Option<Arc<DsmRaster>>> {
        let key = TileKey::new(dataset.id, tile);
        if let Some(raster) = self.tile_cache.get(&key) {
            self.tile_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(raster));
        }
        self.tile_misses.fetch_add(1, Ordering::Relaxed);

        let raster = match self.tile_store().get(&key) {
            Ok(Some(raster)) => Some(raster),
            Ok(None) => self.generate_and_load(dataset, tile, false)?,
            Err(e @ (DsmError::InvalidRaster { .. } | DsmError::Tiff(_))) => {
                tracing::warn!(tile = %key, error = %e, "Stored tile is corrupt, regenerating");
                self.generate_and_load(dataset, tile, true)?
            }
            Err(e) => return Err(e),
        };

        Ok(raster.map(|raster| {
            let raster = Arc::new(raster);
            self.tile_cache.insert(key, raster.clone());
            raster
        }))
    }

    fn generate_and_load(
        &self,
        dataset: &Arc<PointCloudDataset>,
        tile: TileCoord,
        force: bool,
    ) -> Result<Option<DsmRaster>> {
        match self.queue.get_or_create(dataset, tile, force)? {
            GenerationOutcome::Generated | GenerationOutcome::AlreadyPresent => {
                self.tile_store().get(&TileKey::new(dataset.id, tile))
            }
            GenerationOutcome::NoData => Ok(None),
            GenerationOutcome::Failed(reason) => Err(DsmError::GenerationFailed {
                dataset: dataset.id,
                zoom: tile.zoom,
                x: tile.x,
                y: tile.y,
                reason,
            }),
        }
    }
}

/// Builder for creating [`DsmEngine`] with custom configuration.
///
/// ```ignore
/// use dsm::DsmEngineBuilder;
///
/// let engine = DsmEngineBuilder::new()
///     .data_dir("/data/dsm")
///     .export_zoom(17)
///     .fetch_concurrency(16)
///     .build()?;
/// ```
pub struct DsmEngineBuilder {
    data_dir: Option<PathBuf>,
    blob_store: Option<Arc<dyn BlobStore>>,
    catalog: Option<Arc<dyn Catalog>>,
    generator: Option<Arc<dyn TileGenerator>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    config: EngineConfig,
    #[cfg(feature = "download")]
    tile_source: Option<TileSourceConfig>,
}

impl Default for DsmEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparsable environment variable");
            default
        }),
        Err(_) => default,
    }
}

impl DsmEngineBuilder {
    /// A builder with default configuration, an in-memory blob store and an
    /// empty catalog.
    pub fn new() -> Self {
        Self {
            data_dir: None,
            blob_store: None,
            catalog: None,
            generator: None,
            cache_store: None,
            config: EngineConfig::default(),
            #[cfg(feature = "download")]
            tile_source: None,
        }
    }

    /// Create a builder configured from environment variables.
    ///
    /// # Environment Variables
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `DSM_DATA_DIR` | Blob store root directory | Required |
    /// | `DSM_EXPORT_ZOOM` | Slippy zoom of export tiles | 17 |
    /// | `DSM_SAMPLE_ZOOM` | Slippy zoom of sampling tiles | 17 |
    /// | `DSM_EXPORT_RESOLUTION` | Export pixel size (m) | 1.0 |
    /// | `DSM_FETCH_CONCURRENCY` | Tile worker threads | 8 |
    /// | `DSM_GENERATION_TIMEOUT_SECS` | Soft budget per generation attempt | 300 |
    /// | `DSM_GENERATION_RETRIES` | Retries after the first attempt | 3 |
    /// | `DSM_TILE_CACHE_SIZE` | Decoded tiles kept in memory | 256 |
    /// | `DSM_CACHE_TTL_SECS` | Profile cache TTL | 604800 |
    /// | `DSM_CACHE_CAPACITY` | Profile cache entries | 10000 |
    /// | `DSM_MAX_AREA_KM2` | Maximum export area | 100 |
    /// | `DSM_TILE_SOURCE_URL` | HTTP tile source URL template* | None |
    ///
    /// *Only used when the `download` feature is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if `DSM_DATA_DIR` is not set.
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("DSM_DATA_DIR").map_err(|_| DsmError::InvalidConfig {
            reason: "DSM_DATA_DIR environment variable not set".to_string(),
        })?;

        let defaults = EngineConfig::default();
        let config = EngineConfig {
            export_zoom: env_or("DSM_EXPORT_ZOOM", defaults.export_zoom),
            sample_zoom: env_or("DSM_SAMPLE_ZOOM", defaults.sample_zoom),
            export_resolution: env_or("DSM_EXPORT_RESOLUTION", defaults.export_resolution),
            fetch_concurrency: env_or("DSM_FETCH_CONCURRENCY", defaults.fetch_concurrency),
            max_area_km2: env_or("DSM_MAX_AREA_KM2", defaults.max_area_km2),
            generation: GenerationConfig {
                attempt_timeout: Duration::from_secs(env_or(
                    "DSM_GENERATION_TIMEOUT_SECS",
                    defaults.generation.attempt_timeout.as_secs(),
                )),
                retry: RetryPolicy::default().with_max_retries(env_or(
                    "DSM_GENERATION_RETRIES",
                    defaults.generation.retry.max_retries,
                )),
            },
            tile_cache_size: env_or("DSM_TILE_CACHE_SIZE", defaults.tile_cache_size),
            cache_ttl: Duration::from_secs(env_or("DSM_CACHE_TTL_SECS", defaults.cache_ttl.as_secs())),
            cache_capacity: env_or("DSM_CACHE_CAPACITY", defaults.cache_capacity),
        };

        Ok(Self {
            data_dir: Some(PathBuf::from(data_dir)),
            config,
            #[cfg(feature = "download")]
            tile_source: std::env::var("DSM_TILE_SOURCE_URL")
                .ok()
                .filter(|url| !url.is_empty())
                .map(TileSourceConfig::with_url_template),
            ..Self::new()
        })
    }

    /// Store tiles and exports on disk under `path`.
    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Use an explicit blob store; takes precedence over [`Self::data_dir`].
    pub fn blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Tile generator used for missing tiles. Without one, only tiles
    /// already in the store are used.
    pub fn generator(mut self, generator: Arc<dyn TileGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Backend of the profile cache. Defaults to an in-process moka cache.
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn export_zoom(mut self, zoom: u8) -> Self {
        self.config.export_zoom = zoom;
        self
    }

    pub fn sample_zoom(mut self, zoom: u8) -> Self {
        self.config.sample_zoom = zoom;
        self
    }

    pub fn export_resolution(mut self, metres: f64) -> Self {
        self.config.export_resolution = metres;
        self
    }

    pub fn fetch_concurrency(mut self, threads: usize) -> Self {
        self.config.fetch_concurrency = threads;
        self
    }

    pub fn max_area_km2(mut self, km2: f64) -> Self {
        self.config.max_area_km2 = km2;
        self
    }

    pub fn generation_timeout(mut self, timeout: Duration) -> Self {
        self.config.generation.attempt_timeout = timeout;
        self
    }

    pub fn generation_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.generation.retry = retry;
        self
    }

    pub fn tile_cache_size(mut self, tiles: u64) -> Self {
        self.config.tile_cache_size = tiles;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    pub fn cache_capacity(mut self, entries: u64) -> Self {
        self.config.cache_capacity = entries;
        self
    }

    /// Fetch missing tiles from an HTTP tile source.
    #[cfg(feature = "download")]
    pub fn tile_source(mut self, config: TileSourceConfig) -> Self {
        self.tile_source = Some(config);
        self
    }

    /// Build the [`DsmEngine`].
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration, an unusable data
    /// directory, or (with `download`) an HTTP client that cannot be created.
    pub fn build(self) -> Result<DsmEngine> {
        self.config.validate()?;

        let blobs: Arc<dyn BlobStore> = match (self.blob_store, self.data_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FsBlobStore::new(dir)?),
            (None, None) => Arc::new(MemoryBlobStore::new()),
        };

        let generator: Arc<dyn TileGenerator> = match self.generator {
            Some(generator) => generator,
            #[cfg(feature = "download")]
            None => match self.tile_source {
                Some(source) => Arc::new(HttpTileSource::new(source)?),
                None => Arc::new(StoredTilesOnly),
            },
            #[cfg(not(feature = "download"))]
            None => Arc::new(StoredTilesOnly),
        };

        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(InMemoryCatalog::new()));

        let results = match self.cache_store {
            Some(store) => ResultCache::new(store, self.config.cache_ttl),
            None => ResultCache::in_memory(self.config.cache_capacity, self.config.cache_ttl),
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.fetch_concurrency)
            .thread_name(|i| format!("dsm-fetch-{}", i))
            .build()
            .map_err(|e| DsmError::InvalidConfig {
                reason: format!("Failed to create worker pool: {}", e),
            })?;

        let store = TileStore::new(blobs);
        let queue = TileGenerationQueue::new(store, generator, self.config.generation);

        Ok(DsmEngine {
            catalog,
            queue,
            results,
            tile_cache: Cache::builder().max_capacity(self.config.tile_cache_size).build(),
            tile_hits: AtomicU64::new(0),
            tile_misses: AtomicU64::new(0),
            pool,
            config: self.config,
        })
    }
}
