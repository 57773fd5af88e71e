//! Tile store client.
//!
//! Maps `(dataset, zoom, x, y)` to blob keys, decodes the stored GeoTIFFs and
//! retries transient store failures.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dataset::DatasetId;
use crate::error::{DsmError, Result};
use crate::raster::DsmRaster;
use crate::retry::RetryPolicy;
use crate::slippy::TileCoord;
use crate::store::BlobStore;

/// Identity of one generated DSM tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub dataset: DatasetId,
    pub tile: TileCoord,
}

impl TileKey {
    pub fn new(dataset: DatasetId, tile: TileCoord) -> Self {
        Self { dataset, tile }
    }

    /// Blob key: `{dataset}/{zoom}/{x}/{y}.tif`.
    pub fn blob_key(&self) -> String {
        format!(
            "{}/{}/{}/{}.tif",
            self.dataset, self.tile.zoom, self.tile.x, self.tile.y
        )
    }

    /// Parse a blob key produced by [`Self::blob_key`].
    pub fn parse(key: &str) -> Option<Self> {
        let stem = key.strip_suffix(".tif")?;
        let mut parts = stem.split('/');
        let dataset = parts.next()?.parse().ok()?;
        let zoom = parts.next()?.parse().ok()?;
        let x = parts.next()?.parse().ok()?;
        let y = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(dataset, TileCoord::new(x, y, zoom)))
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.blob_key())
    }
}

/// Typed access to DSM tiles kept in a [`BlobStore`].
#[derive(Clone)]
pub struct TileStore {
    blobs: Arc<dyn BlobStore>,
    retry: RetryPolicy,
}

impl fmt::Debug for TileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileStore")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl TileStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The underlying blob store, shared with export output.
    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Fetch and decode a tile.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(raster))` - the tile exists and decodes
    /// - `Ok(None)` - no blob, or an empty blob
    /// - `Err(InvalidRaster | Tiff)` - the blob is corrupt
    /// - `Err(StoreUnavailable)` - the store kept failing after retries
    pub fn get(&self, key: &TileKey) -> Result<Option<DsmRaster>> {
        let blob_key = key.blob_key();
        let bytes = self.retry.run("tile get", |_| self.blobs.get(&blob_key))?;
        match bytes {
            Some(bytes) if !bytes.is_empty() => DsmRaster::from_geotiff(&bytes).map(Some),
            _ => Ok(None),
        }
    }

    /// Fetch a tile that must exist.
    pub fn fetch(&self, key: &TileKey) -> Result<DsmRaster> {
        self.get(key)?.ok_or(DsmError::TileNotFound {
            dataset: key.dataset,
            zoom: key.tile.zoom,
            x: key.tile.x,
            y: key.tile.y,
        })
    }

    /// Whether a non-empty blob is stored for `key`.
    pub fn exists(&self, key: &TileKey) -> Result<bool> {
        let blob_key = key.blob_key();
        let size = self.retry.run("tile size", |_| self.blobs.size(&blob_key))?;
        Ok(size.unwrap_or(0) > 0)
    }

    /// Store a tile, replacing any previous blob.
    pub fn put(&self, key: &TileKey, raster: &DsmRaster) -> Result<()> {
        let bytes = raster.to_geotiff()?;
        let blob_key = key.blob_key();
        self.retry.run("tile put", |_| self.blobs.put(&blob_key, &bytes))
    }

    /// Store a tile unless a non-empty blob already exists.
    ///
    /// Returns `true` if this call wrote the tile.
    pub fn put_if_absent(&self, key: &TileKey, raster: &DsmRaster) -> Result<bool> {
        let bytes = raster.to_geotiff()?;
        let blob_key = key.blob_key();
        self.retry
            .run("tile put_if_absent", |_| self.blobs.put_if_absent(&blob_key, &bytes))
    }

    /// Every stored tile of a dataset.
    pub fn list_tiles(&self, dataset: DatasetId) -> Result<Vec<TileCoord>> {
        let prefix = format!("{}/", dataset);
        let keys = self.retry.run("tile list", |_| self.blobs.list(&prefix))?;
        let mut tiles: Vec<TileCoord> = keys
            .iter()
            .filter_map(|k| TileKey::parse(k))
            .filter(|k| k.dataset == dataset)
            .map(|k| k.tile)
            .collect();
        tiles.sort();
        Ok(tiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{GeoTransform, NO_DATA};
    use crate::store::{FsBlobStore, MemoryBlobStore};

    fn raster() -> DsmRaster {
        let transform = GeoTransform {
            origin_x: 0.0,
            origin_y: 10.0,
            pixel_width: 1.0,
            pixel_height: 1.0,
        };
        DsmRaster::from_data(2, 2, transform, 3857, NO_DATA, vec![1.0, 2.0, 3.0, 4.0]).unwrap()
    }

    #[test]
    fn test_blob_key_format() {
        let key = TileKey::new(42, TileCoord::new(20971, 50657, 17));
        assert_eq!(key.blob_key(), "42/17/20971/50657.tif");
        assert_eq!(TileKey::parse(&key.blob_key()), Some(key));
        assert_eq!(TileKey::parse("42/17/1.tif"), None);
        assert_eq!(TileKey::parse("42/17/1/2/3.tif"), None);
        assert_eq!(TileKey::parse("exports/1.00/dsm-export-x.tif"), None);
    }

    #[test]
    fn test_put_get_exists() {
        let store = TileStore::new(Arc::new(MemoryBlobStore::new()));
        let key = TileKey::new(1, TileCoord::new(10, 20, 17));

        assert!(!store.exists(&key).unwrap());
        assert!(store.get(&key).unwrap().is_none());
        assert!(matches!(store.fetch(&key), Err(DsmError::TileNotFound { x: 10, .. })));

        store.put(&key, &raster()).unwrap();
        assert!(store.exists(&key).unwrap());
        assert_eq!(store.fetch(&key).unwrap(), raster());
    }

    #[test]
    fn test_fs_store_roundtrip_decodes() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = TileStore::new(Arc::new(FsBlobStore::new(dir.path()).unwrap()));
        let key = TileKey::new(3, TileCoord::new(20971, 50657, 17));

        assert!(store.put_if_absent(&key, &raster()).unwrap());
        assert!(!store.put_if_absent(&key, &raster()).unwrap());

        let decoded = store.fetch(&key).unwrap();
        assert_eq!(decoded.transform(), raster().transform());
        assert_eq!(decoded.crs(), 3857);
        assert_eq!(decoded.get(1, 1), Some(4.0));
    }

    #[test]
    fn test_empty_blob_is_absent() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = TileStore::new(blobs.clone());
        let key = TileKey::new(1, TileCoord::new(0, 0, 17));
        blobs.put(&key.blob_key(), b"").unwrap();

        assert!(!store.exists(&key).unwrap());
        assert!(store.get(&key).unwrap().is_none());
        assert!(store.put_if_absent(&key, &raster()).unwrap());
    }

    #[test]
    fn test_corrupt_blob_is_error() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = TileStore::new(blobs.clone());
        let key = TileKey::new(1, TileCoord::new(0, 0, 17));
        blobs.put(&key.blob_key(), b"garbage").unwrap();
        assert!(store.get(&key).is_err());
    }

    #[test]
    fn test_list_tiles_per_dataset() {
        let store = TileStore::new(Arc::new(MemoryBlobStore::new()));
        store.put(&TileKey::new(1, TileCoord::new(11, 20, 17)), &raster()).unwrap();
        store.put(&TileKey::new(1, TileCoord::new(10, 20, 17)), &raster()).unwrap();
        store.put(&TileKey::new(12, TileCoord::new(1, 1, 17)), &raster()).unwrap();

        assert_eq!(
            store.list_tiles(1).unwrap(),
            vec![TileCoord::new(10, 20, 17), TileCoord::new(11, 20, 17)]
        );
        assert_eq!(store.list_tiles(12).unwrap().len(), 1);
        assert!(store.list_tiles(2).unwrap().is_empty());
    }
}
