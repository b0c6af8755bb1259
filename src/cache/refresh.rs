//! Background refresh of hot entries nearing expiry.
//!
//! Each cycle scans the service namespace and picks entries that have been
//! read often enough and have used up most of their TTL. An entry with a
//! registered fetcher is reloaded from the source; any other entry is
//! rewritten as-is under its original TTL.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::{StreamExt, stream};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::backend::KeyTtl;
use super::config::RefreshConfig;
use super::entry::CacheEntry;
use super::fetchers::FetcherRegistry;
use super::stats::Operation;
use super::store::CacheStore;

pub(crate) const METRIC_CACHE_REFRESH_TOTAL: &str = "whisper_cache_refresh_total";
const METRIC_CACHE_REFRESH_CYCLE_MS: &str = "whisper_cache_refresh_cycle_ms";
const METRIC_CACHE_FETCHERS: &str = "whisper_cache_fetchers";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Keys enumerated from the backing store.
    pub scanned: usize,
    pub candidates: usize,
    /// Entries rewritten under their original TTL.
    pub refreshed: usize,
    /// Entries reloaded through a registered fetcher.
    pub revalidated: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Extended,
    Revalidated,
    Skipped,
    Failed,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Extended => "extended",
            Outcome::Revalidated => "revalidated",
            Outcome::Skipped => "skipped",
            Outcome::Failed => "failed",
        }
    }
}

/// Entry as scanned. Writes for it go through only while the key still holds
/// the same write.
struct Candidate {
    key: String,
    entry: CacheEntry<Value>,
}

/// Whether `current` is still the write that `scanned` was read from. Hit
/// counting only bumps `hitCount`, so it does not start a new write.
fn same_write(scanned: &CacheEntry<Value>, current: &CacheEntry<Value>) -> bool {
    scanned.stored_at == current.stored_at
        && scanned.version == current.version
        && scanned.ttl_ms == current.ttl_ms
        && scanned.data == current.data
}

#[derive(Clone)]
pub struct RefreshManager {
    store: CacheStore,
    fetchers: Arc<FetcherRegistry>,
    config: RefreshConfig,
}

/// Running scheduler; dropping it leaves the task running.
pub struct RefreshHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Signal the scheduler and wait for the current cycle to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(error) = self.task.await {
            warn!(%error, "Cache refresh task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl RefreshManager {
    pub fn new(store: CacheStore, fetchers: Arc<FetcherRegistry>, config: RefreshConfig) -> Self {
        Self {
            store,
            fetchers,
            config,
        }
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Run [`run_cycle`](Self::run_cycle) every configured interval until stopped.
    pub fn spawn(&self) -> RefreshHandle {
        let (stop, mut stopped) = watch::channel(false);
        let manager = self.clone();
        let period = self.config.interval;

        let task = tokio::spawn(async move {
            info!(interval_s = period.as_secs(), "Cache refresh scheduler started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await; // Skip the first immediate tick
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.run_cycle().await;
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Cache refresh scheduler stopped");
        });

        RefreshHandle { stop, task }
    }

    /// One scheduled pass over the namespace.
    pub async fn run_cycle(&self) -> RefreshReport {
        let started_at = Instant::now();
        let keys = match self.store.scan(&self.store.keys().service_pattern()).await {
            Ok(keys) => keys,
            Err(error) => {
                warn!(%error, "Cache refresh scan failed, skipping cycle");
                return RefreshReport::default();
            }
        };

        if !self.fetchers.is_empty() {
            let live: HashSet<&str> = keys.iter().map(String::as_str).collect();
            let pruned = self.fetchers.retain(|key| live.contains(key));
            if pruned > 0 {
                debug!(pruned, "Dropped fetchers for keys no longer cached");
            }
        }
        gauge!(METRIC_CACHE_FETCHERS).set(self.fetchers.len() as f64);

        let scanned = keys.len();
        let eligible: Vec<String> = keys
            .into_iter()
            .filter(|key| !self.store.keys().is_internal_key(key))
            .collect();
        let evaluated: Vec<Option<Candidate>> = stream::iter(eligible)
            .map(|key| self.evaluate(key))
            .buffer_unordered(self.config.parallelism.get())
            .collect()
            .await;
        let mut candidates: Vec<Candidate> = evaluated.into_iter().flatten().collect();

        candidates.sort_by(|a, b| {
            b.entry
                .hit_count
                .cmp(&a.entry.hit_count)
                .then_with(|| a.key.cmp(&b.key))
        });
        candidates.truncate(self.config.max_candidates);

        let mut report = self.process(candidates).await;
        report.scanned = scanned;

        match self.store.backend().purge_expired().await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "Purged expired keys from the backing store"),
            Err(error) => debug!(%error, "Failed to purge expired keys"),
        }
        self.store.flush_statistics().await;
        histogram!(METRIC_CACHE_REFRESH_CYCLE_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        info!(
            scanned = report.scanned,
            candidates = report.candidates,
            refreshed = report.refreshed,
            revalidated = report.revalidated,
            failed = report.failed,
            "Cache refresh cycle complete"
        );
        report
    }

    /// Refresh every non-internal entry matching `pattern`, ignoring thresholds.
    pub async fn refresh_pattern(&self, pattern: &str) -> RefreshReport {
        let keys = match self.store.scan(pattern).await {
            Ok(keys) => keys,
            Err(error) => {
                warn!(pattern, %error, "Cache refresh scan failed");
                return RefreshReport::default();
            }
        };
        let scanned = keys.len();

        let mut candidates = Vec::new();
        for key in keys {
            if self.store.keys().is_internal_key(&key) {
                continue;
            }
            if let Some((_, entry)) = self.read_entry(&key).await {
                candidates.push(Candidate { key, entry });
            }
        }

        let mut report = self.process(candidates).await;
        report.scanned = scanned;
        info!(
            pattern,
            refreshed = report.refreshed,
            revalidated = report.revalidated,
            failed = report.failed,
            "Manual cache refresh complete"
        );
        report
    }

    async fn process(&self, candidates: Vec<Candidate>) -> RefreshReport {
        let mut report = RefreshReport {
            candidates: candidates.len(),
            ..RefreshReport::default()
        };

        let outcomes: Vec<Outcome> = stream::iter(candidates)
            .map(|candidate| self.refresh_one(candidate))
            .buffer_unordered(self.config.parallelism.get())
            .collect()
            .await;

        for outcome in outcomes {
            counter!(METRIC_CACHE_REFRESH_TOTAL, "outcome" => outcome.label()).increment(1);
            match outcome {
                Outcome::Extended => report.refreshed += 1,
                Outcome::Revalidated => report.revalidated += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Skipped => {}
            }
        }
        report
    }

    async fn evaluate(&self, key: String) -> Option<Candidate> {
        let (_, entry) = self.read_entry(&key).await?;
        if entry.hit_count < self.config.hit_threshold {
            return None;
        }
        let original = entry.original_ttl()?;
        let remaining = match self.store.ttl(&key).await {
            Ok(KeyTtl::Expires(remaining)) => remaining,
            Ok(_) => return None,
            Err(error) => {
                debug!(key = %key, %error, "Failed to read cache TTL");
                return None;
            }
        };

        let ratio = remaining.as_secs_f64() / original.as_secs_f64();
        (ratio <= self.config.remaining_ratio_limit()).then_some(Candidate { key, entry })
    }

    async fn read_entry(&self, key: &str) -> Option<(String, CacheEntry<Value>)> {
        match self.store.try_get_stored(key).await {
            Ok(stored) => stored,
            Err(error) => {
                debug!(key, %error, "Skipping unreadable cache entry");
                None
            }
        }
    }

    /// Re-read `key` and return it only if it is still the scanned write.
    async fn unchanged_since_scan(&self, candidate: &Candidate) -> Option<(String, CacheEntry<Value>)> {
        match self.read_entry(&candidate.key).await {
            Some((raw, current)) if same_write(&candidate.entry, &current) => Some((raw, current)),
            _ => {
                debug!(key = %candidate.key, "Cache entry changed during refresh, leaving it");
                None
            }
        }
    }

    async fn refresh_one(&self, candidate: Candidate) -> Outcome {
        let key = candidate.key.clone();

        let outcome = match self.fetchers.get(&key) {
            Some(fetcher) => match fetcher.fetch().await {
                Ok(Some(value)) => {
                    let Some((raw, mut current)) = self.unchanged_since_scan(&candidate).await else {
                        return Outcome::Skipped;
                    };
                    current.data = value;
                    current.ttl_ms = u64::try_from(fetcher.ttl().as_millis()).unwrap_or(u64::MAX);
                    self.write_back(&key, &raw, &current, Outcome::Revalidated).await
                }
                Ok(None) => {
                    let Some((raw, _)) = self.unchanged_since_scan(&candidate).await else {
                        return Outcome::Skipped;
                    };
                    match self.store.try_delete_if_unchanged(&key, &raw).await {
                        Ok(true) => {
                            if self.store.config().penetration_protection {
                                self.store.mark_absent(&key).await;
                            }
                            self.fetchers.remove(&key);
                            Outcome::Revalidated
                        }
                        Ok(false) => Outcome::Skipped,
                        Err(error) => {
                            warn!(key = %key, %error, "Failed to drop cache entry gone at source");
                            Outcome::Failed
                        }
                    }
                }
                Err(error) => {
                    warn!(key = %key, %error, "Cache revalidation fetch failed, keeping cached value");
                    Outcome::Failed
                }
            },
            None => match self.unchanged_since_scan(&candidate).await {
                Some((raw, current)) => self.write_back(&key, &raw, &current, Outcome::Extended).await,
                None => Outcome::Skipped,
            },
        };

        if matches!(outcome, Outcome::Extended | Outcome::Revalidated) {
            self.store.stats().record(Operation::Refresh);
            debug!(key = %key, outcome = outcome.label(), "Refreshed cache entry");
        }
        outcome
    }

    /// Write `entry` only while `key` still holds `expected_raw`.
    async fn write_back(
        &self,
        key: &str,
        expected_raw: &str,
        entry: &CacheEntry<Value>,
        success: Outcome,
    ) -> Outcome {
        match self.store.try_rewrite_if_unchanged(key, expected_raw, entry).await {
            Ok(true) => success,
            Ok(false) => {
                debug!(key, "Cache entry changed before refresh write, leaving it");
                Outcome::Skipped
            }
            Err(error) => {
                warn!(key, %error, "Failed to rewrite refreshed cache entry");
                Outcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;
    use serde_json::json;

    use super::*;
    use crate::cache::backend::{KvBackend, MemoryBackend};
    use crate::cache::config::CacheConfig;
    use crate::cache::fetchers::BoxError;
    use crate::cache::keys::{Module, Resource};

    fn manager(config: RefreshConfig) -> (RefreshManager, CacheStore) {
        let store = CacheStore::new(Arc::new(MemoryBackend::new()), CacheConfig::deterministic());
        let manager = RefreshManager::new(store.clone(), Arc::new(FetcherRegistry::new()), config);
        (manager, store)
    }

    async fn read_n_times(store: &CacheStore, key: &str, n: usize) {
        for _ in 0..n {
            store.get::<Value>(key).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hot_entry_near_expiry_is_extended() {
        let (manager, store) = manager(RefreshConfig::default());
        let key = store.keys().user_profile("hot");
        store.set(&key, &json!({"n": 1}), Duration::from_secs(100)).await;
        read_n_times(&store, &key, 10).await;

        tokio::time::sleep(Duration::from_secs(85)).await;
        let report = manager.run_cycle().await;
        assert_eq!(report.candidates, 1);
        assert_eq!(report.refreshed, 1);

        match store.backend().ttl(&key).await.expect("ttl") {
            KeyTtl::Expires(left) => assert!(left > Duration::from_secs(90)),
            other => panic!("unexpected ttl {other:?}"),
        }
        let entry = store.try_get_entry(&key).await.expect("read").expect("present");
        assert_eq!(entry.hit_count, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cold_or_fresh_entries_are_left_alone() {
        let (manager, store) = manager(RefreshConfig::default());
        let cold = store.keys().user_profile("cold");
        let fresh = store.keys().user_profile("fresh");
        let forever = store.keys().user_profile("forever");
        store.set(&cold, &1, Duration::from_secs(100)).await;
        store.set(&fresh, &2, Duration::from_secs(1_000)).await;
        store.set(&forever, &3, Duration::ZERO).await;
        read_n_times(&store, &cold, 3).await;
        read_n_times(&store, &fresh, 20).await;
        read_n_times(&store, &forever, 20).await;

        tokio::time::sleep(Duration::from_secs(90)).await;
        let report = manager.run_cycle().await;
        assert_eq!(report.candidates, 0);
        assert!(report.scanned >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn registered_fetcher_revalidates() {
        let (manager, store) = manager(RefreshConfig::default());
        let key = store.keys().user_status("7");
        store.set(&key, &json!("away"), Duration::from_secs(100)).await;
        read_n_times(&store, &key, 12).await;
        manager.fetchers.register(
            key.clone(),
            Arc::new(|| async { Ok::<_, BoxError>(Some(json!("online"))) }.boxed()),
            Duration::from_secs(100),
        );

        tokio::time::sleep(Duration::from_secs(90)).await;
        let report = manager.run_cycle().await;
        assert_eq!(report.revalidated, 1);
        assert_eq!(store.get::<String>(&key).await.as_deref(), Some("online"));
    }

    #[tokio::test]
    async fn manual_pattern_refresh_ignores_thresholds() {
        let (manager, store) = manager(RefreshConfig::default());
        let keys = store.keys().clone();
        store.set(&keys.confession_list(1, 10), &json!([]), Duration::from_secs(600)).await;
        store.set(&keys.confession_list(2, 10), &json!([]), Duration::from_secs(600)).await;
        store.set(&keys.user_profile("1"), &json!({}), Duration::from_secs(600)).await;

        let report = manager
            .refresh_pattern(&keys.resource_pattern(Module::Confession, &Resource::List))
            .await;
        assert_eq!(report.scanned, 2);
        assert_eq!(report.refreshed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_stops_scheduler() {
        let config = RefreshConfig {
            interval: Duration::from_secs(1),
            ..RefreshConfig::default()
        };
        let (manager, _) = manager(config);
        let handle = manager.spawn();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!handle.is_finished());
        handle.stop().await;
    }
}
