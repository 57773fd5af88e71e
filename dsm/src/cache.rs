//! Result cache for expensive line-of-sight and elevation queries.
//!
//! Keys are precision-bucketed fingerprints of a query, so requests that
//! differ only by floating-point jitter share one entry. Values are stored as
//! JSON in a [`CacheStore`] with a TTL. The cache is best-effort: any store
//! or decoding failure is logged and treated as a miss.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use geo::Point;
use moka::sync::Cache;
use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DsmError, Result};

/// Decimal places kept for transmitter/receiver coordinates.
pub const POINT_PRECISION: usize = 7;

/// Decimal places kept for the area-of-interest anchor.
pub const AOI_PRECISION: usize = 3;

/// Default time-to-live: 7 days.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Query type tag for surface-profile results.
pub const QUERY_LIDAR: &str = "lidar";

/// Round `value` to `precision` decimals, folding `-0` into `0`.
fn bucket(value: f64, precision: usize) -> f64 {
    let factor = 10f64.powi(precision as i32);
    let rounded = (value * factor).round() / factor;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Bucketed fingerprint of a `(query type, tx, rx, aoi anchor)` query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key with the default precisions.
    pub fn new(query_type: &str, tx: Point<f64>, rx: Point<f64>, aoi_anchor: Point<f64>) -> Self {
        Self::with_precision(query_type, tx, rx, aoi_anchor, POINT_PRECISION, AOI_PRECISION)
    }

    pub fn with_precision(
        query_type: &str,
        tx: Point<f64>,
        rx: Point<f64>,
        aoi_anchor: Point<f64>,
        point_precision: usize,
        aoi_precision: usize,
    ) -> Self {
        let p = point_precision;
        let a = aoi_precision;
        Self(format!(
            "{}:{:.p$}:{:.p$}:{:.p$}:{:.p$}:{:.a$}:{:.a$}",
            query_type,
            bucket(tx.x(), p),
            bucket(tx.y(), p),
            bucket(rx.x(), p),
            bucket(rx.y(), p),
            bucket(aoi_anchor.x(), a),
            bucket(aoi_anchor.y(), a),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key/value store with per-entry TTL.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` with a fresh expiration, replacing any previous value.
    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Approximate number of live entries.
    fn entry_count(&self) -> u64;
}

#[derive(Clone)]
struct Entry {
    value: Arc<str>,
    ttl: Duration,
}

struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// In-process [`CacheStore`] on a bounded moka cache.
pub struct MokaCacheStore {
    cache: Cache<String, Entry>,
    capacity: u64,
}

impl MokaCacheStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .expire_after(EntryExpiry)
                .build(),
            capacity,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

impl fmt::Debug for MokaCacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MokaCacheStore")
            .field("capacity", &self.capacity)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl CacheStore for MokaCacheStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.get(key).map(|e| e.value.to_string()))
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.cache.insert(
            key.to_string(),
            Entry {
                value: value.into(),
                ttl,
            },
        );
        Ok(())
    }

    fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Number of live entries.
    pub entry_count: u64,
    /// Lookups answered from the cache.
    pub hit_count: u64,
    /// Lookups that had to be computed.
    pub miss_count: u64,
    /// Store or decoding failures treated as misses.
    pub error_count: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0).
    ///
    /// Returns 0.0 if no lookups have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// Typed, best-effort memoisation over a [`CacheStore`].
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    error_count: AtomicU64,
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    /// In-memory cache with the given capacity and TTL.
    pub fn in_memory(capacity: u64, ttl: Duration) -> Self {
        Self::new(Arc::new(MokaCacheStore::new(capacity)), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached value for `key`, or `None` on miss, expiry or any failure.
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = match self.store.get(key.as_str()) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                self.error_count.fetch_add(1, Ordering::Relaxed);
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cached value undecodable, treating as miss");
                self.error_count.fetch_add(1, Ordering::Relaxed);
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `value` under `key` with a fresh TTL. Failures are logged only.
    pub fn set<T: Serialize>(&self, key: &CacheKey, value: &T) {
        let result = serde_json::to_string(value)
            .map_err(DsmError::from)
            .and_then(|json| self.store.set(key.as_str(), json, self.ttl));
        if let Err(e) = result {
            tracing::warn!(key = %key, error = %e, "Cache write failed");
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Return the cached value or compute, store and return it.
    ///
    /// Errors from `compute` are returned and not cached.
    pub fn get_or_compute<T, F>(&self, key: &CacheKey, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.get(key) {
            tracing::debug!(key = %key, "Result cache hit");
            return Ok(value);
        }
        let value = compute()?;
        self.set(key, &value);
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.store.entry_count(),
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}
