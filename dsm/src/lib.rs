//! # DSM - Slippy-tiled Digital Surface Model engine
//!
//! Builds and serves Digital Surface Models from a catalog of aerial
//! point-cloud datasets. Rasters are generated per dataset and per slippy
//! tile, stored once, and merged on demand with the most recent dataset on
//! top.
//!
//! ## Features
//!
//! - **Recency priority**: the newest collection wins wherever datasets overlap
//! - **Generate once**: concurrent requests for the same tile share a single generation
//! - **Any CRS**: tiles stay in their dataset's native CRS; exports are Web Mercator
//! - **Memoised profiles**: line-of-sight profiles are cached by bucketed endpoints
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use dsm::{DsmEngine, ExportRequest, InMemoryCatalog, PointCloudDataset, Sample};
//!
//! let catalog = InMemoryCatalog::with_datasets([
//!     PointCloudDataset::new(1, "CA_SanFranCoast_2010", 26910).with_boundary(boundary),
//! ])?;
//!
//! let engine = DsmEngine::builder()
//!     .data_dir("/data/dsm")
//!     .catalog(Arc::new(catalog))
//!     .build()?;
//!
//! if let Sample::Found(elevation) = engine.sample_elevation(37.7749, -122.4194)? {
//!     println!("Surface: {}m", elevation);
//! }
//! ```
//!
//! ## Tile Layout
//!
//! Tiles are single-band `f32` GeoTIFFs stored under
//! `{dataset}/{zoom}/{x}/{y}.tif` in a [`BlobStore`]. Pixels without points
//! carry [`NO_DATA`] (`-9999`).
//!
//! ## Cargo Features
//!
//! - `download`: fetch missing tiles from an HTTP tile server ([`download`])
//! - `geojson`: GeoJSON areas, catalogs and elevation enrichment ([`geojson`])

pub mod cache;
pub mod catalog;
pub mod crs;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod generate;
pub mod mosaic;
pub mod profile;
pub mod raster;
pub mod retry;
pub mod slippy;
pub mod store;
pub mod tiles;

#[cfg(feature = "download")]
pub mod download;

#[cfg(feature = "geojson")]
pub mod geojson;

// Re-export main types at crate root for convenience
pub use cache::{CacheKey, CacheStats, CacheStore, MokaCacheStore, ResultCache};
pub use catalog::{Catalog, InMemoryCatalog};
pub use dataset::{recency_order, Area, DatasetId, PointCloudDataset};
pub use engine::{
    export_key, DsmEngine, DsmEngineBuilder, EngineConfig, EngineStats, ExportRequest, ExportResult,
    ExportStats, Sample,
};
pub use error::{DsmError, Result};
pub use generate::{GenerationConfig, GenerationOutcome, GenerationReport, TileGenerationQueue, TileGenerator};
pub use profile::{LineOfSight, ProfilePoint, SurfaceProfile, DEFAULT_PROFILE_SAMPLES};
pub use raster::{DsmRaster, GeoTransform, NO_DATA};
pub use retry::RetryPolicy;
pub use slippy::{point_to_tile, TileCoord, DEFAULT_OUTPUT_ZOOM};
pub use store::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use tiles::{TileKey, TileStore};

#[cfg(feature = "download")]
pub use download::{Compression, HttpTileSource, TileSourceConfig};
