//! Registered fetchers for background revalidation.
//!
//! A call site that populates a key through
//! [`ReadThrough::get_or_fetch_registered`](super::ReadThrough::get_or_fetch_registered)
//! leaves its fetcher here so the refresh scheduler can reload the value
//! from the source instead of only extending its lifetime.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased fetcher producing the JSON form of a value.
pub type ErasedFetch = Arc<dyn Fn() -> BoxFuture<'static, Result<Option<Value>, BoxError>> + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredFetcher {
    fetch: ErasedFetch,
    ttl: Duration,
}

impl RegisteredFetcher {
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn fetch(&self) -> Result<Option<Value>, BoxError> {
        (self.fetch)().await
    }
}

impl fmt::Debug for RegisteredFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFetcher")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct FetcherRegistry {
    fetchers: DashMap<String, RegisteredFetcher>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the fetcher for `key`.
    pub fn register(&self, key: impl Into<String>, fetch: ErasedFetch, ttl: Duration) {
        self.fetchers
            .insert(key.into(), RegisteredFetcher { fetch, ttl });
    }

    pub fn get(&self, key: &str) -> Option<RegisteredFetcher> {
        self.fetchers.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fetchers.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.fetchers.remove(key).is_some()
    }

    /// Drop registrations for which `keep` returns false, returning how many went.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let before = self.fetchers.len();
        self.fetchers.retain(|key, _| keep(key));
        before.saturating_sub(self.fetchers.len())
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use serde_json::json;

    use super::*;

    fn constant(value: Value) -> ErasedFetch {
        Arc::new(move || {
            let value = value.clone();
            async move { Ok::<_, BoxError>(Some(value)) }.boxed()
        })
    }

    #[tokio::test]
    async fn registered_fetcher_can_be_called_repeatedly() {
        let registry = FetcherRegistry::new();
        registry.register("k", constant(json!(7)), Duration::from_secs(5));

        let fetcher = registry.get("k").expect("registered");
        assert_eq!(fetcher.ttl(), Duration::from_secs(5));
        assert_eq!(fetcher.fetch().await.expect("fetch"), Some(json!(7)));
        assert_eq!(fetcher.fetch().await.expect("fetch"), Some(json!(7)));
    }

    #[test]
    fn retain_prunes_unknown_keys() {
        let registry = FetcherRegistry::new();
        registry.register("a", constant(json!(1)), Duration::ZERO);
        registry.register("b", constant(json!(2)), Duration::ZERO);
        assert_eq!(registry.retain(|key| key == "a"), 1);
        assert!(registry.contains("a"));
        assert!(!registry.contains("b"));
    }
}
