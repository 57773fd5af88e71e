pub mod datasets;
pub mod export;
pub mod profile;
pub mod sample;
pub mod tiles;

use anyhow::{bail, Context, Result};
use dsm::{DsmEngine, DsmEngineBuilder, InMemoryCatalog, TileSourceConfig};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Global arguments every command builds its engine from.
pub struct EngineArgs {
    pub data_dir: Option<PathBuf>,
    pub catalog: Option<PathBuf>,
    pub tile_source: Option<String>,
}

impl EngineArgs {
    pub fn build(&self) -> Result<DsmEngine> {
        let mut builder = match &self.data_dir {
            Some(dir) => DsmEngine::builder().data_dir(dir),
            None => DsmEngineBuilder::from_env().context(
                "DSM_DATA_DIR environment variable not set. Use --data-dir or set DSM_DATA_DIR",
            )?,
        };

        if let Some(path) = &self.catalog {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read catalog {}", path.display()))?;
            let catalog = InMemoryCatalog::from_geojson(&text).context("Failed to parse catalog")?;
            builder = builder.catalog(Arc::new(catalog));
        }

        if let Some(url) = &self.tile_source {
            builder = builder.tile_source(TileSourceConfig::with_url_template(url.as_str()));
        }

        builder.build().context("Failed to create DSM engine")
    }
}

/// A `lat,lon` pair given on the command line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn point(&self) -> geo::Point<f64> {
        geo::Point::new(self.lon, self.lat)
    }
}

impl FromStr for LatLon {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((lat, lon)) = s.split_once(',') else {
            bail!("Expected lat,lon but got '{}'", s);
        };
        Ok(Self {
            lat: lat.trim().parse().with_context(|| format!("Invalid latitude '{}'", lat))?,
            lon: lon.trim().parse().with_context(|| format!("Invalid longitude '{}'", lon))?,
        })
    }
}
