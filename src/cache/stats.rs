//! In-process cache statistics.
//!
//! Counters are always maintained; latency, per-module and hot-key
//! accounting is sampled to bound overhead on the read path. The store
//! persists [`StatsSnapshot`] under the statistics key.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::entry::now_millis;
use super::keys::Module;

/// Hot-key map size that triggers pruning to the tracked window.
const HOT_KEY_WINDOW_FACTOR: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Set,
    Delete,
    Error,
    Fetch,
    NullHit,
    LockWait,
    Refresh,
}

#[derive(Debug, Default)]
struct ModuleCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotKey {
    pub key: String,
    pub hits: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationCounts {
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub fetches: u64,
    pub null_hits: u64,
    pub lock_waits: u64,
    pub refreshes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub requests: u64,
    pub hit_rate: f64,
    pub per_module_hit_rate: BTreeMap<String, f64>,
    pub hot_keys: Vec<HotKey>,
    pub operation_counts: OperationCounts,
    pub avg_latency_us: f64,
    pub sampled: u64,
    pub captured_at: i64,
}

/// Sampling parameters for [`CacheStatistics`].
#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub sample_rate: f64,
    pub persist_every: u64,
    pub hot_keys: usize,
    pub deterministic: bool,
}

#[derive(Debug)]
pub struct CacheStatistics {
    config: StatsConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    fetches: AtomicU64,
    null_hits: AtomicU64,
    lock_waits: AtomicU64,
    refreshes: AtomicU64,
    sampled: AtomicU64,
    latency_us_total: AtomicU64,
    since_persist: AtomicU64,
    modules: DashMap<Module, ModuleCounters>,
    hot: DashMap<String, u64>,
}

impl CacheStatistics {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            null_hits: AtomicU64::new(0),
            lock_waits: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            sampled: AtomicU64::new(0),
            latency_us_total: AtomicU64::new(0),
            since_persist: AtomicU64::new(0),
            modules: DashMap::new(),
            hot: DashMap::new(),
        }
    }

    /// Record the outcome of one `get`.
    ///
    /// Returns `true` when enough samples accumulated that the snapshot
    /// should be persisted; the counter restarts at that point.
    pub fn record_get(
        &self,
        key: &str,
        module: Option<Module>,
        hit: bool,
        latency: Duration,
    ) -> bool {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        if !self.should_sample() {
            return false;
        }

        self.sampled.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_us_total.fetch_add(micros, Ordering::Relaxed);

        if let Some(module) = module.filter(|module| !module.is_internal()) {
            let counters = self.modules.entry(module).or_default();
            if hit {
                counters.hits.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.misses.fetch_add(1, Ordering::Relaxed);
            }
        }

        if hit {
            *self.hot.entry(key.to_string()).or_insert(0) += 1;
            self.prune_hot_keys();
        }

        let pending = self.since_persist.fetch_add(1, Ordering::AcqRel) + 1;
        if pending >= self.config.persist_every {
            self.since_persist.store(0, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn record(&self, operation: Operation) {
        let counter = match operation {
            Operation::Set => &self.sets,
            Operation::Delete => &self.deletes,
            Operation::Error => &self.errors,
            Operation::Fetch => &self.fetches,
            Operation::NullHit => &self.null_hits,
            Operation::LockWait => &self.lock_waits,
            Operation::Refresh => &self.refreshes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deletes(&self, count: u64) {
        self.deletes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let requests = hits + misses;
        let sampled = self.sampled.load(Ordering::Relaxed);

        let per_module_hit_rate = self
            .modules
            .iter()
            .map(|entry| {
                let hits = entry.value().hits.load(Ordering::Relaxed);
                let misses = entry.value().misses.load(Ordering::Relaxed);
                (entry.key().as_str().to_string(), ratio(hits, hits + misses))
            })
            .collect();

        let mut hot_keys: Vec<HotKey> = self
            .hot
            .iter()
            .map(|entry| HotKey {
                key: entry.key().clone(),
                hits: *entry.value(),
            })
            .collect();
        hot_keys.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.key.cmp(&b.key)));
        hot_keys.truncate(self.config.hot_keys);

        let avg_latency_us = if sampled == 0 {
            0.0
        } else {
            self.latency_us_total.load(Ordering::Relaxed) as f64 / sampled as f64
        };

        StatsSnapshot {
            hits,
            misses,
            requests,
            hit_rate: ratio(hits, requests),
            per_module_hit_rate,
            hot_keys,
            operation_counts: OperationCounts {
                gets: requests,
                sets: self.sets.load(Ordering::Relaxed),
                deletes: self.deletes.load(Ordering::Relaxed),
                errors: self.errors.load(Ordering::Relaxed),
                fetches: self.fetches.load(Ordering::Relaxed),
                null_hits: self.null_hits.load(Ordering::Relaxed),
                lock_waits: self.lock_waits.load(Ordering::Relaxed),
                refreshes: self.refreshes.load(Ordering::Relaxed),
            },
            avg_latency_us,
            sampled,
            captured_at: now_millis(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.sets,
            &self.deletes,
            &self.errors,
            &self.fetches,
            &self.null_hits,
            &self.lock_waits,
            &self.refreshes,
            &self.sampled,
            &self.latency_us_total,
            &self.since_persist,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.modules.clear();
        self.hot.clear();
    }

    fn should_sample(&self) -> bool {
        let rate = self.config.sample_rate;
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 || self.config.deterministic {
            return true;
        }
        rand::thread_rng().gen_bool(rate.clamp(0.0, 1.0))
    }

    fn prune_hot_keys(&self) {
        let window = self.config.hot_keys.max(1) * HOT_KEY_WINDOW_FACTOR;
        if self.hot.len() <= window * 2 {
            return;
        }
        let mut counts: Vec<u64> = self.hot.iter().map(|entry| *entry.value()).collect();
        counts.sort_unstable_by(|a, b| b.cmp(a));
        let floor = counts.get(window).copied().unwrap_or(0);
        self.hot.retain(|_, hits| *hits > floor);
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(sample_rate: f64, persist_every: u64) -> CacheStatistics {
        CacheStatistics::new(StatsConfig {
            sample_rate,
            persist_every,
            hot_keys: 2,
            deterministic: true,
        })
    }

    #[test]
    fn counts_hits_and_misses() {
        let stats = stats(1.0, 100);
        stats.record_get("a", Some(Module::User), true, Duration::from_micros(10));
        stats.record_get("a", Some(Module::User), true, Duration::from_micros(30));
        stats.record_get("b", Some(Module::Chat), false, Duration::from_micros(20));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.requests, 3);
        assert!((snapshot.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.per_module_hit_rate.get("user"), Some(&1.0));
        assert_eq!(snapshot.per_module_hit_rate.get("chat"), Some(&0.0));
        assert_eq!(snapshot.hot_keys[0], HotKey { key: "a".into(), hits: 2 });
        assert!((snapshot.avg_latency_us - 20.0).abs() < 1e-9);
    }

    #[test]
    fn zero_sample_rate_still_counts() {
        let stats = stats(0.0, 1);
        assert!(!stats.record_get("a", Some(Module::User), true, Duration::ZERO));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.sampled, 0);
        assert!(snapshot.hot_keys.is_empty());
    }

    #[test]
    fn signals_persist_every_n_samples() {
        let stats = stats(1.0, 3);
        let due: Vec<bool> = (0..6)
            .map(|_| stats.record_get("a", None, false, Duration::ZERO))
            .collect();
        assert_eq!(due, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn internal_modules_are_not_tracked_per_module() {
        let stats = stats(1.0, 100);
        stats.record_get("s", Some(Module::Statistics), true, Duration::ZERO);
        assert!(stats.snapshot().per_module_hit_rate.is_empty());
    }

    #[test]
    fn reset_clears_everything() {
        let stats = stats(1.0, 100);
        stats.record_get("a", Some(Module::User), true, Duration::ZERO);
        stats.record(Operation::Set);
        stats.reset();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.operation_counts.sets, 0);
        assert!(snapshot.hot_keys.is_empty());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let stats = stats(1.0, 100);
        stats.record_get("a", Some(Module::User), true, Duration::ZERO);
        let json = serde_json::to_value(stats.snapshot()).expect("json");
        assert!(json.get("hitRate").is_some());
        assert!(json.get("perModuleHitRate").is_some());
        assert!(json["operationCounts"].get("nullHits").is_some());
    }
}
