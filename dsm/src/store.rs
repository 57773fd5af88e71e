//! Key → blob stores.
//!
//! The engine never touches object storage directly. It sees a [`BlobStore`]:
//! `get`/`put`/`list` plus a `put_if_absent` that acts as the uniqueness
//! constraint for tile generation.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::{DsmError, Result};

/// Minimal blob store contract.
///
/// Keys are `/`-separated relative paths. A blob of size 0 is treated as
/// absent by [`BlobStore::put_if_absent`].
pub trait BlobStore: Send + Sync {
    /// Fetch a blob, `None` if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a blob, replacing any existing value.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Write a blob only if the key is absent or holds an empty blob.
    ///
    /// Returns `true` if this call wrote the blob. Two racing callers for the
    /// same key see exactly one `true`.
    fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool>;

    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Size of a blob in bytes, `None` if absent.
    fn size(&self, key: &str) -> Result<Option<u64>>;
}

/// In-memory [`BlobStore`], used by tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes since creation.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs.write().insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        let mut blobs = self.blobs.write();
        match blobs.get(key) {
            Some(existing) if !existing.is_empty() => Ok(false),
            _ => {
                blobs.insert(key.to_string(), bytes.to_vec());
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.blobs.read().get(key).map(|b| b.len() as u64))
    }
}

const TEMP_SUFFIX: &str = ".partial";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// [`BlobStore`] rooted at a directory on the local filesystem.
///
/// Writes go to a temporary sibling first and are then moved into place, so
/// readers never observe a partially written blob. `put_if_absent` links the
/// temporary file to its final name, which fails if another writer got there
/// first.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of a key. Rejects absolute keys and `..` components.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(DsmError::InvalidKey {
                key: key.to_string(),
                reason: "must be a non-empty relative path inside the store".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    fn write_temp(&self, key: &str, path: &Path, bytes: &[u8]) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| unavailable(key, e))?;
        }
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut temp = path.as_os_str().to_os_string();
        temp.push(format!(".{}.{}{}", std::process::id(), n, TEMP_SUFFIX));
        let temp = PathBuf::from(temp);

        let mut file = File::create(&temp).map_err(|e| unavailable(key, e))?;
        file.write_all(bytes).map_err(|e| unavailable(key, e))?;
        file.sync_all().map_err(|e| unavailable(key, e))?;
        Ok(temp)
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.collect_keys(&path, out)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.ends_with(TEMP_SUFFIX) {
                    out.push(key);
                }
            }
        }
        Ok(())
    }
}

fn unavailable(key: &str, e: io::Error) -> DsmError {
    DsmError::StoreUnavailable {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

impl BlobStore for FsBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(key, e)),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let temp = self.write_temp(key, &path, bytes)?;
        fs::rename(&temp, &path).map_err(|e| {
            let _ = fs::remove_file(&temp);
            unavailable(key, e)
        })
    }

    fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        let path = self.path_for(key)?;
        if let Some(0) = self.size(key)? {
            // Empty blobs count as absent
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(unavailable(key, e)),
            }
        }

        let temp = self.write_temp(key, &path, bytes)?;
        let linked = fs::hard_link(&temp, &path);
        let _ = fs::remove_file(&temp);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(unavailable(key, e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)
            .map_err(|e| unavailable(prefix, e))?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        let path = self.path_for(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn exercise(store: &dyn BlobStore) {
        assert_eq!(store.get("1/17/0/0.tif").unwrap(), None);
        assert_eq!(store.size("1/17/0/0.tif").unwrap(), None);

        store.put("1/17/0/0.tif", b"abc").unwrap();
        assert_eq!(store.get("1/17/0/0.tif").unwrap(), Some(b"abc".to_vec()));
        assert_eq!(store.size("1/17/0/0.tif").unwrap(), Some(3));

        assert!(!store.put_if_absent("1/17/0/0.tif", b"zzz").unwrap());
        assert_eq!(store.get("1/17/0/0.tif").unwrap(), Some(b"abc".to_vec()));

        store.put("1/17/0/1.tif", b"").unwrap();
        assert!(store.put_if_absent("1/17/0/1.tif", b"xyz").unwrap());
        assert_eq!(store.size("1/17/0/1.tif").unwrap(), Some(3));

        store.put("2/17/5/5.tif", b"q").unwrap();
        assert_eq!(
            store.list("1/").unwrap(),
            vec!["1/17/0/0.tif".to_string(), "1/17/0/1.tif".to_string()]
        );
        assert_eq!(store.list("").unwrap().len(), 3);
    }

    #[test]
    fn test_memory_store_contract() {
        exercise(&MemoryBlobStore::new());
    }

    #[test]
    fn test_fs_store_contract() {
        let dir = TempDir::new().unwrap();
        exercise(&FsBlobStore::new(dir.path()).unwrap());
    }

    #[test]
    fn test_fs_store_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        assert!(store.put("../outside", b"x").is_err());
        assert!(store.put("/etc/passwd", b"x").is_err());
        assert!(store.get("").is_err());
    }

    #[test]
    fn test_fs_store_invalid_key_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        for key in ["../x", "/abs.tif", "a/../../b.tif", ""] {
            let err = store.get(key).unwrap_err();
            assert!(matches!(err, DsmError::InvalidKey { .. }), "{}: {:?}", key, err);
            assert!(!err.is_transient());
        }
    }

    #[test]
    fn test_fs_store_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        store.put("a/b.tif", b"1").unwrap();
        store.put_if_absent("a/c.tif", b"2").unwrap();
        store.put_if_absent("a/c.tif", b"3").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path().join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 2, "unexpected files: {:?}", names);
    }

    #[test]
    fn test_put_if_absent_single_winner() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsBlobStore::new(dir.path()).unwrap());

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.put_if_absent("race.tif", &[i + 1]).unwrap())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_memory_write_count() {
        let store = MemoryBlobStore::new();
        store.put_if_absent("k", b"1").unwrap();
        store.put_if_absent("k", b"2").unwrap();
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.len(), 1);
    }
}
