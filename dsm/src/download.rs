//! HTTP tile source.
//!
//! Fetches pre-rendered DSM tiles from a remote server. Only available when
//! the `download` feature is enabled.
//!
//! # URL Templates
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `{dataset}` | dataset id |
//! | `{name}` | dataset name |
//! | `{z}` | zoom |
//! | `{x}` | tile column |
//! | `{y}` | tile row |
//!
//! Templates ending in `.gz` are gunzipped after download.

use std::io::Read;
use std::time::Duration;

use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::StatusCode;

use crate::dataset::PointCloudDataset;
use crate::error::{DsmError, Result};
use crate::generate::TileGenerator;
use crate::raster::DsmRaster;
use crate::slippy::TileCoord;

/// Compression format of downloaded tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Raw GeoTIFF
    #[default]
    None,
    /// Gzipped GeoTIFF (`.tif.gz`)
    Gzip,
}

impl Compression {
    /// Detect compression from a URL or filename suffix.
    pub fn from_url(url: &str) -> Self {
        if url.to_lowercase().ends_with(".gz") {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

/// Default timeout for HTTP requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Configuration for [`HttpTileSource`].
#[derive(Debug, Clone)]
pub struct TileSourceConfig {
    pub url_template: String,
    pub compression: Compression,
    pub timeout_secs: u64,
}

impl TileSourceConfig {
    /// Configuration for a URL template; compression is auto-detected.
    ///
    /// ```ignore
    /// use dsm::download::TileSourceConfig;
    ///
    /// let config = TileSourceConfig::with_url_template(
    ///     "https://tiles.example.com/dsm/{dataset}/{z}/{x}/{y}.tif.gz",
    /// );
    /// ```
    pub fn with_url_template(url_template: impl Into<String>) -> Self {
        let url_template = url_template.into();
        let compression = Compression::from_url(&url_template);
        Self {
            url_template,
            compression,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// [`TileGenerator`] that downloads tiles rendered elsewhere.
///
/// A 404 means the server has no tile for that dataset and is reported as
/// "no data", not as a failure.
pub struct HttpTileSource {
    client: Client,
    config: TileSourceConfig,
}

impl HttpTileSource {
    pub fn new(config: TileSourceConfig) -> Result<Self> {
        if config.url_template.is_empty() {
            return Err(DsmError::DownloadFailed {
                url: String::new(),
                reason: "No tile URL template configured".to_string(),
            });
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DsmError::DownloadFailed {
                url: config.url_template.clone(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TileSourceConfig {
        &self.config
    }

    /// Expand the URL template for one tile.
    pub fn build_url(&self, dataset: &PointCloudDataset, tile: TileCoord) -> String {
        self.config
            .url_template
            .replace("{dataset}", &dataset.id.to_string())
            .replace("{name}", &dataset.name)
            .replace("{z}", &tile.zoom.to_string())
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &tile.y.to_string())
    }

    fn download(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let failed = |reason: String| DsmError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let response = self.client.get(url).send().map_err(|e| failed(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }
        let bytes = response.bytes().map_err(|e| failed(e.to_string()))?;

        let data = match self.config.compression {
            Compression::None => bytes.to_vec(),
            Compression::Gzip => {
                let mut decoder = GzDecoder::new(&bytes[..]);
                let mut data = Vec::new();
                decoder
                    .read_to_end(&mut data)
                    .map_err(|e| failed(format!("Failed to decompress gzip: {}", e)))?;
                data
            }
        };
        Ok(Some(data))
    }
}

impl TileGenerator for HttpTileSource {
    fn generate(&self, dataset: &PointCloudDataset, tile: TileCoord) -> Result<Option<DsmRaster>> {
        let url = self.build_url(dataset, tile);
        tracing::debug!(%url, dataset = dataset.id, %tile, "Downloading tile");

        let Some(bytes) = self.download(&url)? else {
            return Ok(None);
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        let raster = DsmRaster::from_geotiff(&bytes)?;
        if raster.valid_pixel_count() == 0 {
            return Ok(None);
        }
        Ok(Some(raster))
    }
}
