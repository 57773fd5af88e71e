//! Lazy DSM tile generation.
//!
//! A tile for `(dataset, zoom, x, y)` is produced the first time something
//! asks for it and is never regenerated unless forced or the stored blob is
//! empty. [`TileGenerationQueue`] owns that get-or-create discipline: it
//! serialises concurrent requests for the same key, bounds each attempt with
//! a soft time budget, retries with backoff and writes through the store's
//! uniqueness check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use geo::{BoundingRect, Intersects};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;

use crate::crs::{CrsTransformer, EPSG_WGS84};
use crate::dataset::PointCloudDataset;
use crate::error::{DsmError, Result};
use crate::raster::{DsmRaster, GeoTransform};
use crate::retry::RetryPolicy;
use crate::slippy::{buffer_polygon, tile_to_polygon, tiles_covering, TileCoord, BUFFER_TILE};
use crate::tiles::{TileKey, TileStore};

/// Produces the DSM raster of one tile from one dataset.
pub trait TileGenerator: Send + Sync {
    /// Render `tile` from `dataset`.
    ///
    /// Returns `Ok(None)` when the dataset has no points inside the tile.
    fn generate(&self, dataset: &PointCloudDataset, tile: TileCoord) -> Result<Option<DsmRaster>>;
}

/// Empty raster a generator fills for `tile`.
///
/// The grid covers the tile bounds grown by [`BUFFER_TILE`], expressed in the
/// dataset's native CRS at `resolution` CRS units per pixel.
pub fn tile_canvas(dataset: &PointCloudDataset, tile: TileCoord, resolution: f64) -> Result<DsmRaster> {
    if !(resolution > 0.0) {
        return Err(DsmError::InvalidRaster {
            reason: format!("resolution must be positive, got {}", resolution),
        });
    }
    let bounds = tile_to_polygon(tile.x, tile.y, tile.zoom);
    let buffered = buffer_polygon(&bounds, BUFFER_TILE, EPSG_WGS84)?;
    let native = if dataset.srs == EPSG_WGS84 {
        buffered
    } else {
        CrsTransformer::new(EPSG_WGS84, dataset.srs)?.transform_polygon(&buffered)?
    };
    let rect = native.bounding_rect().ok_or_else(|| DsmError::InvalidGeometry {
        reason: format!("tile {} has no extent in EPSG:{}", tile, dataset.srs),
    })?;

    let width = (rect.width() / resolution).ceil().max(1.0) as u32;
    let height = (rect.height() / resolution).ceil().max(1.0) as u32;
    let transform = GeoTransform {
        origin_x: rect.min().x,
        origin_y: rect.max().y,
        pixel_width: resolution,
        pixel_height: resolution,
    };
    Ok(DsmRaster::new(width, height, transform, dataset.srs))
}

/// Result of one get-or-create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// This call rendered and stored the tile.
    Generated,
    /// A usable tile was already stored (possibly by a concurrent caller).
    AlreadyPresent,
    /// The dataset has no data for the tile; nothing was stored.
    NoData,
    /// Every attempt failed; the tile stays absent.
    Failed(String),
}

impl GenerationOutcome {
    /// Whether a tile is now stored for the key.
    pub fn has_tile(&self) -> bool {
        matches!(self, GenerationOutcome::Generated | GenerationOutcome::AlreadyPresent)
    }
}

/// Tally of a bulk generation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationReport {
    pub generated: usize,
    pub already_present: usize,
    pub no_data: usize,
    pub failed: usize,
    /// Tiles in the bounding box that the dataset boundary does not touch.
    pub skipped: usize,
    pub elapsed_ms: u64,
}

impl GenerationReport {
    fn record(&mut self, outcome: &GenerationOutcome) {
        match outcome {
            GenerationOutcome::Generated => self.generated += 1,
            GenerationOutcome::AlreadyPresent => self.already_present += 1,
            GenerationOutcome::NoData => self.no_data += 1,
            GenerationOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Budget for generation attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Soft limit for one attempt. The caller stops waiting after this long;
    /// the attempt itself is not cancelled.
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-key lock plus a count of tiles written while holding it.
#[derive(Default)]
struct KeySlot {
    lock: Mutex<()>,
    writes: AtomicU64,
}

/// Idempotent, per-key serialised tile generation.
pub struct TileGenerationQueue {
    store: TileStore,
    generator: Arc<dyn TileGenerator>,
    config: GenerationConfig,
    locks: DashMap<TileKey, Arc<KeySlot>>,
}

impl std::fmt::Debug for TileGenerationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileGenerationQueue")
            .field("config", &self.config)
            .field("in_flight", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl TileGenerationQueue {
    pub fn new(store: TileStore, generator: Arc<dyn TileGenerator>, config: GenerationConfig) -> Self {
        Self {
            store,
            generator,
            config,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &TileStore {
        &self.store
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Ensure a tile is stored for `(dataset, tile)`.
    ///
    /// Without `force`, a non-empty stored blob short-circuits to
    /// [`GenerationOutcome::AlreadyPresent`]. With `force`, the tile is
    /// rendered again and overwrites the stored blob, unless a caller queued
    /// ahead on the same key already stored a tile that decodes.
    ///
    /// # Errors
    ///
    /// Only store failures that outlast the store's retry policy are
    /// returned. Generator failures and timeouts become
    /// [`GenerationOutcome::Failed`].
    pub fn get_or_create(
        &self,
        dataset: &Arc<PointCloudDataset>,
        tile: TileCoord,
        force: bool,
    ) -> Result<GenerationOutcome> {
        let key = TileKey::new(dataset.id, tile);
        if !force && self.store.exists(&key)? {
            return Ok(GenerationOutcome::AlreadyPresent);
        }

        let slot = self.locks.entry(key).or_default().clone();
        let writes_seen = slot.writes.load(Ordering::Acquire);
        let outcome = {
            let _guard = slot.lock.lock();
            self.generate_locked(dataset, key, force, &slot, writes_seen)
        };
        // Drop the map entry unless another caller is queued on it
        self.locks.remove_if(&key, |_, l| Arc::strong_count(l) <= 2);
        outcome
    }

    fn generate_locked(
        &self,
        dataset: &Arc<PointCloudDataset>,
        key: TileKey,
        force: bool,
        slot: &KeySlot,
        writes_seen: u64,
    ) -> Result<GenerationOutcome> {
        // A caller queued on the same key may have finished the work
        if !force && self.store.exists(&key)? {
            return Ok(GenerationOutcome::AlreadyPresent);
        }
        if force && slot.writes.load(Ordering::Acquire) != writes_seen {
            match self.store.get(&key) {
                Ok(Some(_)) => {
                    tracing::debug!(tile = %key, "Tile replaced while waiting, skipping forced regeneration");
                    return Ok(GenerationOutcome::AlreadyPresent);
                }
                Ok(None) | Err(DsmError::InvalidRaster { .. }) | Err(DsmError::Tiff(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let started = Instant::now();
        let rendered = self
            .config
            .retry
            .run("tile generation", |attempt| self.attempt(dataset, key, attempt));

        let raster = match rendered {
            Ok(Some(raster)) => raster,
            Ok(None) => {
                tracing::debug!(tile = %key, "Dataset has no data for tile");
                return Ok(GenerationOutcome::NoData);
            }
            Err(e) => {
                tracing::warn!(tile = %key, error = %e, "Tile generation failed");
                return Ok(GenerationOutcome::Failed(e.to_string()));
            }
        };

        let written = if force {
            self.store.put(&key, &raster)?;
            true
        } else {
            self.store.put_if_absent(&key, &raster)?
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if written {
            slot.writes.fetch_add(1, Ordering::Release);
            tracing::info!(tile = %key, elapsed_ms, "Tile generated");
            Ok(GenerationOutcome::Generated)
        } else {
            tracing::debug!(tile = %key, "Tile written concurrently by another worker");
            Ok(GenerationOutcome::AlreadyPresent)
        }
    }

    fn attempt(
        &self,
        dataset: &Arc<PointCloudDataset>,
        key: TileKey,
        attempt: u32,
    ) -> Result<Option<DsmRaster>> {
        let (tx, rx) = mpsc::channel();
        let generator = Arc::clone(&self.generator);
        let worker_dataset = Arc::clone(dataset);
        let started = Instant::now();

        thread::Builder::new()
            .name(format!("dsm-gen-{}-{}", key.dataset, key.tile))
            .spawn(move || {
                let _ = tx.send(generator.generate(&worker_dataset, key.tile));
            })?;

        match rx.recv_timeout(self.config.attempt_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(tile = %key, attempt, elapsed_ms, "Tile generation attempt timed out");
                Err(DsmError::GenerationTimeout {
                    dataset: key.dataset,
                    zoom: key.tile.zoom,
                    x: key.tile.x,
                    y: key.tile.y,
                    elapsed_ms,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(DsmError::GenerationFailed {
                dataset: key.dataset,
                zoom: key.tile.zoom,
                x: key.tile.x,
                y: key.tile.y,
                reason: "generator panicked".to_string(),
            }),
        }
    }

    /// Generate every tile at `zoom` that the dataset boundary touches.
    ///
    /// Tiles already stored are left alone. Runs on the current rayon pool.
    pub fn generate_dataset(&self, dataset: &Arc<PointCloudDataset>, zoom: u8) -> Result<GenerationReport> {
        let started = Instant::now();
        let mut report = GenerationReport::default();

        let Some(boundary) = dataset.effective_boundary() else {
            tracing::warn!(dataset = dataset.id, "Dataset has no boundary, nothing to generate");
            return Ok(report);
        };

        let candidates = tiles_covering(boundary, zoom);
        let (inside, outside): (Vec<TileCoord>, Vec<TileCoord>) = candidates
            .into_iter()
            .partition(|tile| boundary.intersects(&tile.bounds()));
        report.skipped = outside.len();

        tracing::info!(
            dataset = dataset.id,
            zoom,
            tiles = inside.len(),
            skipped = report.skipped,
            "Generating dataset tiles"
        );

        let outcomes: Vec<Result<GenerationOutcome>> = inside
            .par_iter()
            .map(|tile| self.get_or_create(dataset, *tile, false))
            .collect();
        for outcome in outcomes {
            report.record(&outcome?);
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(dataset = dataset.id, ?report, "Dataset generation finished");
        Ok(report)
    }
}
