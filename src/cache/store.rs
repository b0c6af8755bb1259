//! Cache store: typed entries over the backing store.
//!
//! The plain `get`/`set`/`delete*` methods never fail; backing-store and
//! payload problems are logged and reported as a miss, `false` or `0`. The
//! `try_*` variants surface [`CacheError`] for callers that need to decide
//! on a fallback themselves.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::backend::{KeyTtl, SharedBackend};
use super::config::CacheConfig;
use super::entry::{CACHE_FORMAT_VERSION, CacheEntry, now_millis};
use super::error::CacheError;
use super::keys::{KeyBuilder, null_key};
use super::stats::{CacheStatistics, Operation, StatsConfig, StatsSnapshot};

pub(crate) const METRIC_CACHE_HIT_TOTAL: &str = "whisper_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS_TOTAL: &str = "whisper_cache_miss_total";
const METRIC_CACHE_GET_MS: &str = "whisper_cache_get_ms";
const DELETE_BATCH: usize = 500;
const NULL_MARKER: &str = "1";
const MIN_TTL: Duration = Duration::from_millis(1);

#[derive(Clone)]
pub struct CacheStore {
    backend: SharedBackend,
    keys: KeyBuilder,
    config: Arc<CacheConfig>,
    stats: Arc<CacheStatistics>,
}

impl CacheStore {
    pub fn new(backend: SharedBackend, config: CacheConfig) -> Self {
        let keys = KeyBuilder::new(config.service.clone());
        Self::with_keys(backend, config, keys)
    }

    /// Build a store that shares `keys` (and so its module versions).
    pub fn with_keys(backend: SharedBackend, config: CacheConfig, keys: KeyBuilder) -> Self {
        let stats = CacheStatistics::new(StatsConfig {
            sample_rate: config.stats_sample_rate,
            persist_every: config.stats_persist_every,
            hot_keys: config.stats_hot_keys,
            deterministic: config.deterministic,
        });
        Self {
            backend,
            keys,
            config: Arc::new(config),
            stats: Arc::new(stats),
        }
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn stats(&self) -> &CacheStatistics {
        &self.stats
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write `data` under `key`. A zero `ttl` stores without expiry.
    pub async fn try_set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        data: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = CacheEntry::new(data, ttl).encode(key)?;
        self.backend.set(key, &raw, self.apply_jitter(ttl)).await?;
        self.stats.record(Operation::Set);
        debug!(key, ttl_ms = ttl.as_millis() as u64, "Cache set");
        Ok(())
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Duration) -> bool {
        match self.try_set(key, data, ttl).await {
            Ok(()) => true,
            Err(error) => {
                self.stats.record(Operation::Error);
                warn!(key, %error, "Cache set failed");
                false
            }
        }
    }

    /// Rewrite an entry under its original TTL, but only while `key` still
    /// holds `expected_raw`. Returns whether the write happened.
    pub async fn try_rewrite_if_unchanged(
        &self,
        key: &str,
        expected_raw: &str,
        entry: &CacheEntry<Value>,
    ) -> Result<bool, CacheError> {
        let ttl = entry.original_ttl().unwrap_or(Duration::ZERO);
        let rewritten = CacheEntry {
            data: &entry.data,
            stored_at: now_millis(),
            version: CACHE_FORMAT_VERSION,
            hit_count: entry.hit_count,
            ttl_ms: entry.ttl_ms,
        };
        let raw = rewritten.encode(key)?;
        let written = self
            .backend
            .set_if_eq(key, expected_raw, &raw, self.apply_jitter(ttl))
            .await?;
        Ok(written)
    }

    /// Offset a non-zero TTL by a random amount within ±min(ratio·ttl, cap).
    ///
    /// Returns `None` for a zero TTL, meaning no expiry.
    pub fn apply_jitter(&self, ttl: Duration) -> Option<Duration> {
        if ttl.is_zero() {
            return None;
        }
        let ratio = self.config.jitter_ratio;
        if self.config.deterministic || ratio <= 0.0 {
            return Some(ttl);
        }

        let bound = ttl.mul_f64(ratio.min(1.0)).min(self.config.jitter_cap);
        let bound_ms = i64::try_from(bound.as_millis()).unwrap_or(i64::MAX);
        if bound_ms == 0 {
            return Some(ttl);
        }
        let offset = rand::thread_rng().gen_range(-bound_ms..=bound_ms);
        let base_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let jittered = base_ms.saturating_add(offset).max(1);
        Some(Duration::from_millis(jittered.unsigned_abs()).max(MIN_TTL))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read the raw envelope without touching statistics or hit counts.
    pub async fn try_get_entry(&self, key: &str) -> Result<Option<CacheEntry<Value>>, CacheError> {
        Ok(self.try_get_stored(key).await?.map(|(_, entry)| entry))
    }

    /// Like [`try_get_entry`](Self::try_get_entry), also returning the stored
    /// payload for conditional writes.
    pub async fn try_get_stored(
        &self,
        key: &str,
    ) -> Result<Option<(String, CacheEntry<Value>)>, CacheError> {
        match self.backend.get(key).await? {
            Some(raw) => {
                let entry = CacheEntry::decode(key, &raw)?;
                Ok(Some((raw, entry)))
            }
            None => Ok(None),
        }
    }

    pub async fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let started_at = Instant::now();
        let result = self.read_and_count(key).await;
        let hit = matches!(result, Ok(Some(_)));
        self.record_get(key, hit, started_at.elapsed()).await;
        result
    }

    /// Typed read. Corrupt payloads and backing-store failures read as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.try_get(key).await {
            Ok(value) => value,
            Err(error) => {
                self.stats.record(Operation::Error);
                warn!(key, %error, "Cache get failed, treating as miss");
                None
            }
        }
    }

    async fn read_and_count<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let Some((raw, mut entry)) = self.try_get_stored(key).await? else {
            return Ok(None);
        };
        // A payload of the wrong shape is a miss and is not counted.
        let data = entry.data_as(key)?;

        entry.hit_count = entry.hit_count.saturating_add(1);
        match entry.encode(key) {
            // Only the payload just read is overwritten; a concurrent delete or set wins.
            Ok(counted) => match self.backend.replace_if_eq(key, &raw, &counted).await {
                Ok(true) => {}
                Ok(false) => debug!(key, "Cache entry changed since read, hit not counted"),
                Err(error) => debug!(key, %error, "Failed to update cache hit count"),
            },
            Err(error) => debug!(key, %error, "Failed to encode cache hit count"),
        }

        Ok(Some(data))
    }

    async fn record_get(&self, key: &str, hit: bool, latency: Duration) {
        let module = self.keys.module_of(key);
        let label = module.map(|module| module.as_str()).unwrap_or("unknown");
        if hit {
            counter!(METRIC_CACHE_HIT_TOTAL, "module" => label).increment(1);
            debug!(key, "Cache hit");
        } else {
            counter!(METRIC_CACHE_MISS_TOTAL, "module" => label).increment(1);
            debug!(key, "Cache miss");
        }
        histogram!(METRIC_CACHE_GET_MS).record(latency.as_secs_f64() * 1000.0);

        if self.stats.record_get(key, module, hit, latency) {
            self.flush_statistics().await;
        }
    }

    pub async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError> {
        Ok(self.backend.ttl(key).await?)
    }

    pub async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        Ok(self.backend.scan(pattern).await?)
    }

    // ------------------------------------------------------------------
    // Null markers
    // ------------------------------------------------------------------

    /// Record that `key` has no data at the source, for the null-value TTL.
    pub async fn try_mark_absent(&self, key: &str) -> Result<(), CacheError> {
        self.backend
            .set(&null_key(key), NULL_MARKER, Some(self.config.ttl.null_value))
            .await?;
        debug!(key, "Cache null marker set");
        Ok(())
    }

    pub async fn mark_absent(&self, key: &str) -> bool {
        match self.try_mark_absent(key).await {
            Ok(()) => true,
            Err(error) => {
                self.stats.record(Operation::Error);
                warn!(key, %error, "Failed to write cache null marker");
                false
            }
        }
    }

    pub async fn try_is_marked_absent(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.backend.exists(&null_key(key)).await?)
    }

    pub async fn is_marked_absent(&self, key: &str) -> bool {
        match self.try_is_marked_absent(key).await {
            Ok(marked) => marked,
            Err(error) => {
                self.stats.record(Operation::Error);
                warn!(key, %error, "Failed to read cache null marker");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Deletes
    // ------------------------------------------------------------------

    /// Keys no delete path may remove.
    pub fn is_protected(&self, key: &str) -> bool {
        key == self.keys.format_version_key() || key == self.keys.statistics_key()
    }

    pub async fn try_delete_keys(&self, keys: &[String]) -> Result<u64, CacheError> {
        let deletable: Vec<String> = keys
            .iter()
            .filter(|key| !self.is_protected(key))
            .cloned()
            .collect();
        let removed = self.backend.delete(&deletable).await?;
        self.stats.record_deletes(removed);
        Ok(removed)
    }

    pub async fn delete_keys(&self, keys: &[String]) -> u64 {
        match self.try_delete_keys(keys).await {
            Ok(removed) => removed,
            Err(error) => {
                self.stats.record(Operation::Error);
                warn!(count = keys.len(), %error, "Cache delete failed");
                0
            }
        }
    }

    /// Delete `key` only while it still holds `expected_raw`.
    pub async fn try_delete_if_unchanged(
        &self,
        key: &str,
        expected_raw: &str,
    ) -> Result<bool, CacheError> {
        let removed = self.backend.delete_if_eq(key, expected_raw).await?;
        if removed {
            self.stats.record_deletes(1);
        }
        Ok(removed)
    }

    pub async fn try_delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.try_delete_keys(&[key.to_string()]).await? > 0)
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.delete_keys(&[key.to_string()]).await > 0
    }

    /// Delete every key matching `pattern` except protected keys.
    ///
    /// Batches that fail are logged and skipped; the count covers only
    /// confirmed deletions.
    pub async fn try_delete_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let keys: Vec<String> = self
            .backend
            .scan(pattern)
            .await?
            .into_iter()
            .filter(|key| !self.is_protected(key))
            .collect();

        let mut removed = 0;
        for batch in keys.chunks(DELETE_BATCH) {
            match self.backend.delete(batch).await {
                Ok(count) => removed += count,
                Err(error) => {
                    self.stats.record(Operation::Error);
                    warn!(pattern, batch = batch.len(), %error, "Cache pattern delete batch failed");
                }
            }
        }
        self.stats.record_deletes(removed);
        debug!(pattern, removed, "Cache pattern delete");
        Ok(removed)
    }

    pub async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        match self.try_delete_by_pattern(pattern).await {
            Ok(removed) => removed,
            Err(error) => {
                self.stats.record(Operation::Error);
                warn!(pattern, %error, "Cache pattern delete failed");
                0
            }
        }
    }

    /// Remove every entry in the service namespace, null markers and the
    /// dependency index included. Protected keys survive.
    pub async fn clear_all(&self) -> u64 {
        let removed = self.delete_by_pattern(&self.keys.service_pattern()).await;
        info!(service = self.keys.service(), removed, "Cleared cache namespace");
        removed
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    /// Make sure the namespace was written with the current entry layout.
    ///
    /// A marker from another layout version clears the namespace first.
    /// Returns whether anything was cleared.
    pub async fn ensure_format_version(&self) -> Result<bool, CacheError> {
        let key = self.keys.format_version_key();
        let expected = CACHE_FORMAT_VERSION.to_string();
        let current = self.backend.get(&key).await?;

        let cleared = match current.as_deref() {
            Some(found) if found == expected => return Ok(false),
            Some(found) => {
                let removed = self.try_delete_by_pattern(&self.keys.service_pattern()).await?;
                info!(
                    found,
                    expected = expected.as_str(),
                    removed,
                    "Cache format version changed, cleared namespace"
                );
                true
            }
            None => false,
        };

        self.backend.set(&key, &expected, None).await?;
        Ok(cleared)
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Snapshot last written to the statistics key, possibly by another process.
    pub async fn persisted_statistics(&self) -> Option<StatsSnapshot> {
        let key = self.keys.statistics_key();
        match self.try_get_entry(&key).await {
            Ok(Some(entry)) => match entry.into_typed::<StatsSnapshot>(&key) {
                Ok(entry) => Some(entry.data),
                Err(error) => {
                    warn!(%error, "Persisted cache statistics are unreadable");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(%error, "Failed to read persisted cache statistics");
                None
            }
        }
    }

    /// Persist the current snapshot under the statistics key.
    pub async fn flush_statistics(&self) -> bool {
        let key = self.keys.statistics_key();
        let ttl = self.config.ttl.medium;
        let snapshot = self.stats.snapshot();
        let result = match CacheEntry::new(&snapshot, ttl).encode(&key) {
            Ok(raw) => self
                .backend
                .set(&key, &raw, self.apply_jitter(ttl))
                .await
                .map_err(CacheError::from),
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => {
                debug!(requests = snapshot.requests, "Persisted cache statistics");
                true
            }
            Err(error) => {
                warn!(%error, "Failed to persist cache statistics");
                false
            }
        }
    }
}
