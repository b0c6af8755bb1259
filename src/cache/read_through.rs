//! Read-through adapter.
//!
//! `get_or_fetch` consults the store, then the null marker, then takes the
//! per-key lock so concurrent misses for one key collapse into a single call
//! to the source. Fetch-and-populate runs on its own task: a caller that
//! gives up waiting does not cancel it, and the lock is released there even
//! when the fetch fails or panics.

use std::future::Future;
use std::panic::{AssertUnwindSafe, resume_unwind};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::config::TtlHint;
use super::error::CacheError;
use super::fetchers::{BoxError, ErasedFetch, FetcherRegistry};
use super::key_lock::{KeyLock, LockGuard};
use super::stats::Operation;
use super::store::CacheStore;

pub(crate) const METRIC_CACHE_FETCH_TOTAL: &str = "whisper_cache_fetch_total";

enum Lookup<T> {
    Hit(T),
    Absent,
    Locked(LockGuard),
    Contended,
}

#[derive(Clone)]
pub struct ReadThrough {
    store: CacheStore,
    lock: KeyLock,
    fetchers: Arc<FetcherRegistry>,
}

impl ReadThrough {
    pub fn new(store: CacheStore) -> Self {
        Self::with_fetchers(store, Arc::new(FetcherRegistry::new()))
    }

    pub fn with_fetchers(store: CacheStore, fetchers: Arc<FetcherRegistry>) -> Self {
        let lock = KeyLock::new(store.backend().clone(), store.config().ttl.lock);
        Self {
            store,
            lock,
            fetchers,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn fetchers(&self) -> &Arc<FetcherRegistry> {
        &self.fetchers
    }

    /// Return the cached value for `key`, loading it through `fetch` on a miss.
    ///
    /// `fetch` resolves to `Ok(None)` when the record does not exist at the
    /// source; that answer is remembered for the null-value TTL. Errors from
    /// `fetch` are returned unchanged and never cached. Cache failures only
    /// cost caching: the value still comes from `fetch`.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from `fetch` on the calling task.
    pub async fn get_or_fetch<T, E, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        ttl: impl Into<TtlHint>,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
    {
        let ttl = ttl.into().resolve(&self.store.config().ttl);

        match self.lookup::<T>(key).await {
            Ok(Lookup::Hit(value)) => Ok(Some(value)),
            Ok(Lookup::Absent) => Ok(None),
            Ok(Lookup::Locked(guard)) => self.populate(key, guard, fetch, ttl).await,
            Ok(Lookup::Contended) => {
                warn!(
                    key,
                    retries = self.store.config().lock_retries,
                    "Cache lock still held after retries, fetching without caching"
                );
                self.fetch_direct(key, fetch).await
            }
            Err(error) => {
                self.store.stats().record(Operation::Error);
                warn!(key, %error, "Cache unavailable, fetching from source");
                self.fetch_direct(key, fetch).await
            }
        }
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch), and keeps `fetch` so the
    /// refresh scheduler can reload `key` from the source later.
    pub async fn get_or_fetch_registered<T, E, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        ttl: impl Into<TtlHint>,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: Into<BoxError> + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
    {
        let hint = ttl.into();
        let fetch = Arc::new(fetch);
        self.fetchers.register(
            key,
            erase::<T, E, F, Fut>(Arc::clone(&fetch)),
            hint.resolve(&self.store.config().ttl),
        );
        self.get_or_fetch(key, move || (*fetch)(), hint).await
    }

    async fn lookup<T>(&self, key: &str) -> Result<Lookup<T>, CacheError>
    where
        T: DeserializeOwned,
    {
        let config = self.store.config();
        for attempt in 0..=config.lock_retries {
            if let Some(value) = self.cached::<T>(key).await? {
                return Ok(Lookup::Hit(value));
            }
            if self.marked_absent(key).await? {
                return Ok(Lookup::Absent);
            }

            if let Some(guard) = self.lock.try_acquire(key).await? {
                // Another holder may have populated the key just before we got the lock.
                return match self.recheck::<T>(key).await {
                    Ok(None) => Ok(Lookup::Locked(guard)),
                    Ok(Some(found)) => {
                        self.release(guard).await;
                        Ok(found)
                    }
                    Err(error) => {
                        self.release(guard).await;
                        Err(error)
                    }
                };
            }

            if attempt < config.lock_retries {
                self.store.stats().record(Operation::LockWait);
                debug!(key, attempt, "Cache key locked by another caller, waiting");
                tokio::time::sleep(config.lock_wait).await;
            }
        }
        Ok(Lookup::Contended)
    }

    /// Read `key`, treating an unreadable payload as a miss so it gets replaced.
    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.store.try_get::<T>(key).await {
            Err(CacheError::Deserialize { .. }) => Ok(None),
            other => other,
        }
    }

    async fn marked_absent(&self, key: &str) -> Result<bool, CacheError> {
        if !self.store.config().penetration_protection {
            return Ok(false);
        }
        let marked = self.store.try_is_marked_absent(key).await?;
        if marked {
            self.store.stats().record(Operation::NullHit);
            debug!(key, "Cache null marker hit");
        }
        Ok(marked)
    }

    async fn recheck<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Lookup<T>>, CacheError> {
        let value = match self.store.try_get_entry(key).await {
            Ok(Some(entry)) => entry.into_typed::<T>(key).ok().map(|entry| entry.data),
            Ok(None) | Err(CacheError::Deserialize { .. }) => None,
            Err(error) => return Err(error),
        };
        if let Some(value) = value {
            return Ok(Some(Lookup::Hit(value)));
        }
        if self.marked_absent(key).await? {
            return Ok(Some(Lookup::Absent));
        }
        Ok(None)
    }

    async fn populate<T, E, F, Fut>(
        &self,
        key: &str,
        guard: LockGuard,
        fetch: F,
        ttl: Duration,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
    {
        let this = self.clone();
        let key = key.to_string();
        self.count_fetch("populate");

        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(fetch()).catch_unwind().await;
            let result = match outcome {
                Ok(Ok(Some(value))) => {
                    this.store.set(&key, &value, ttl).await;
                    Ok(Ok(Some(value)))
                }
                Ok(Ok(None)) => {
                    if this.store.config().penetration_protection {
                        this.store.mark_absent(&key).await;
                    }
                    Ok(Ok(None))
                }
                Ok(Err(error)) => {
                    debug!(key = %key, "Source fetch failed, nothing cached");
                    Ok(Err(error))
                }
                Err(panic) => Err(panic),
            };
            this.release(guard).await;
            result
        });

        match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => resume_unwind(panic),
            Err(join_error) => match join_error.try_into_panic() {
                Ok(panic) => resume_unwind(panic),
                // Only reachable while the runtime shuts down.
                Err(join_error) => resume_unwind(Box::new(join_error.to_string())),
            },
        }
    }

    async fn fetch_direct<T, E, F, Fut>(&self, key: &str, fetch: F) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        debug!(key, "Fetching from source without caching");
        self.count_fetch("direct");
        fetch().await
    }

    fn count_fetch(&self, path: &'static str) {
        self.store.stats().record(Operation::Fetch);
        counter!(METRIC_CACHE_FETCH_TOTAL, "path" => path).increment(1);
    }

    async fn release(&self, guard: LockGuard) {
        let lock = guard.key().to_string();
        if let Err(error) = self.lock.release(guard).await {
            warn!(lock = %lock, %error, "Failed to release cache key lock");
        }
    }
}

fn erase<T, E, F, Fut>(fetch: Arc<F>) -> ErasedFetch
where
    T: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
{
    Arc::new(move || {
        let pending = (*fetch)();
        async move {
            match pending.await {
                Ok(Some(value)) => serde_json::to_value(value)
                    .map(Some)
                    .map_err(|err| Box::new(err) as BoxError),
                Ok(None) => Ok(None),
                Err(error) => Err(error.into()),
            }
        }
        .boxed()
    })
}
