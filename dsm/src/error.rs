//! Error types for the DSM library.

use thiserror::Error;

/// Errors that can occur while resolving, generating or merging DSM tiles.
#[derive(Error, Debug)]
pub enum DsmError {
    /// IO error when reading or writing files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The GeoTIFF codec rejected a raster.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// Raster bytes decoded but do not describe a usable single-band grid.
    #[error("Invalid raster: {reason}")]
    InvalidRaster { reason: String },

    /// A dataset id was requested explicitly but is not in the catalog.
    #[error("Dataset not found: {dataset}")]
    DatasetNotFound { dataset: u64 },

    /// A tile was requested explicitly but the store has no blob for it.
    #[error("Tile not found: dataset={dataset} z={zoom} x={x} y={y}")]
    TileNotFound {
        dataset: u64,
        zoom: u8,
        x: u32,
        y: u32,
    },

    /// A single generation attempt exceeded its soft time budget.
    #[error("Tile generation timed out after {elapsed_ms}ms: dataset={dataset} z={zoom} x={x} y={y}")]
    GenerationTimeout {
        dataset: u64,
        zoom: u8,
        x: u32,
        y: u32,
        elapsed_ms: u64,
    },

    /// The generator reported a failure for a tile.
    #[error("Tile generation failed: dataset={dataset} z={zoom} x={x} y={y}: {reason}")]
    GenerationFailed {
        dataset: u64,
        zoom: u8,
        x: u32,
        y: u32,
        reason: String,
    },

    /// Transient blob-store failure.
    #[error("Blob store unavailable for key {key}: {reason}")]
    StoreUnavailable { key: String, reason: String },

    /// A blob key cannot address an object in the store.
    #[error("Invalid blob key {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Datasets covered the export area but not a single tile could be produced.
    #[error("No tiles could be produced for the requested area ({failed} failed)")]
    NoTilesProduced { failed: usize },

    /// A geometry could not be interpreted.
    #[error("Invalid geometry: {reason}")]
    InvalidGeometry { reason: String },

    /// The area of interest was rejected before any work started.
    #[error("{reason}")]
    InvalidArea { reason: String },

    /// Coordinate transformation failed.
    #[error("Projection error EPSG:{source_epsg} -> EPSG:{target_epsg}: {reason}")]
    Projection {
        source_epsg: u32,
        target_epsg: u32,
        reason: String,
    },

    /// No projection definition is known for the EPSG code.
    #[error("Unsupported CRS: EPSG:{epsg}")]
    UnsupportedCrs { epsg: u32 },

    /// Engine configuration is unusable.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Failed to download a tile from a remote source.
    #[cfg(feature = "download")]
    #[error("Failed to download {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    /// A cached value or catalog record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DsmError {
    /// Whether a retry policy may try the failed operation again.
    pub fn is_transient(&self) -> bool {
        match self {
            DsmError::StoreUnavailable { .. }
            | DsmError::GenerationTimeout { .. }
            | DsmError::Io(_) => true,
            #[cfg(feature = "download")]
            DsmError::DownloadFailed { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias using [`DsmError`].
pub type Result<T> = std::result::Result<T, DsmError>;
