//! Point-cloud catalog.
//!
//! The catalog owns dataset metadata and answers one question for the engine:
//! which datasets intersect an area, most recent first. That ordering is the
//! tie-break used by every downstream consumer: when several datasets cover
//! the same tile, the first one in the list wins.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use geo::MultiPolygon;
use parking_lot::RwLock;

use crate::dataset::{recency_order, validate_boundary, Area, DatasetId, PointCloudDataset};
use crate::error::{DsmError, Result};

/// Queryable registry of point-cloud datasets.
///
/// Implementations are shared between threads and synchronise internally.
pub trait Catalog: Send + Sync {
    /// Valid datasets whose effective boundary intersects `area`, ordered by
    /// [`recency_order`]. An empty list means no elevation data is available.
    fn datasets_intersecting(&self, area: &Area) -> Vec<Arc<PointCloudDataset>>;

    /// Look up a dataset by id, including invalidated ones.
    fn get(&self, id: DatasetId) -> Result<Arc<PointCloudDataset>>;

    /// Every dataset, including invalidated ones, in recency order.
    fn all_including_invalid(&self) -> Vec<Arc<PointCloudDataset>>;

    /// Ingestion hook: register a newly discovered dataset.
    ///
    /// Registering an id that already exists leaves the stored record
    /// untouched and returns it.
    fn mark_dataset_added(&self, dataset: PointCloudDataset) -> Result<Arc<PointCloudDataset>>;

    /// Ingestion hook: attach an asynchronously computed high-resolution boundary.
    fn refine_boundary(&self, id: DatasetId, boundary: MultiPolygon<f64>) -> Result<()>;

    /// Mark a dataset valid or invalid.
    fn set_valid(&self, id: DatasetId, valid: bool) -> Result<()>;
}

/// In-process [`Catalog`] backed by a hash map.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    datasets: RwLock<HashMap<DatasetId, Arc<PointCloudDataset>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from already-validated datasets.
    pub fn with_datasets(datasets: impl IntoIterator<Item = PointCloudDataset>) -> Result<Self> {
        let catalog = Self::new();
        for dataset in datasets {
            catalog.mark_dataset_added(dataset)?;
        }
        Ok(catalog)
    }

    /// Number of datasets, including invalidated ones.
    pub fn len(&self) -> usize {
        self.datasets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.read().is_empty()
    }

    fn update(&self, id: DatasetId, f: impl FnOnce(&mut PointCloudDataset)) -> Result<()> {
        let mut datasets = self.datasets.write();
        let entry = datasets
            .get_mut(&id)
            .ok_or(DsmError::DatasetNotFound { dataset: id })?;
        let mut updated = PointCloudDataset::clone(entry);
        f(&mut updated);
        *entry = Arc::new(updated);
        Ok(())
    }
}

impl Catalog for InMemoryCatalog {
    fn datasets_intersecting(&self, area: &Area) -> Vec<Arc<PointCloudDataset>> {
        let mut matches: Vec<Arc<PointCloudDataset>> = self
            .datasets
            .read()
            .values()
            .filter(|d| d.valid && d.intersects(area))
            .cloned()
            .collect();
        matches.sort_by(|a, b| recency_order(a, b));
        matches
    }

    fn get(&self, id: DatasetId) -> Result<Arc<PointCloudDataset>> {
        self.datasets
            .read()
            .get(&id)
            .cloned()
            .ok_or(DsmError::DatasetNotFound { dataset: id })
    }

    fn all_including_invalid(&self) -> Vec<Arc<PointCloudDataset>> {
        let mut all: Vec<_> = self.datasets.read().values().cloned().collect();
        all.sort_by(|a, b| recency_order(a, b));
        all
    }

    fn mark_dataset_added(&self, mut dataset: PointCloudDataset) -> Result<Arc<PointCloudDataset>> {
        dataset.validate()?;

        let mut datasets = self.datasets.write();
        if let Some(existing) = datasets.get(&dataset.id) {
            tracing::debug!(dataset = dataset.id, "Dataset already registered");
            return Ok(existing.clone());
        }

        dataset.created = Utc::now();
        let dataset = Arc::new(dataset);
        datasets.insert(dataset.id, dataset.clone());
        tracing::info!(dataset = dataset.id, name = %dataset.name, srs = dataset.srs, "Dataset added");
        Ok(dataset)
    }

    fn refine_boundary(&self, id: DatasetId, boundary: MultiPolygon<f64>) -> Result<()> {
        validate_boundary(&boundary)?;
        self.update(id, |d| d.high_resolution_boundary = Some(boundary))?;
        tracing::info!(dataset = id, "High-resolution boundary attached");
        Ok(())
    }

    fn set_valid(&self, id: DatasetId, valid: bool) -> Result<()> {
        self.update(id, |d| d.valid = valid)
    }
}
