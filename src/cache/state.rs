//! Wiring of the cache components around one backing store.

use std::sync::Arc;

use super::backend::{SharedBackend, connect_backend};
use super::config::{CacheConfig, RefreshConfig};
use super::fetchers::FetcherRegistry;
use super::invalidation::InvalidationManager;
use super::read_through::ReadThrough;
use super::refresh::RefreshManager;
use super::store::CacheStore;

/// Store, read-through adapter, invalidation and refresh sharing one
/// backing store, one key builder and one fetcher registry.
#[derive(Clone)]
pub struct CacheState {
    pub store: CacheStore,
    pub read_through: ReadThrough,
    pub invalidation: InvalidationManager,
    pub refresh: RefreshManager,
}

impl CacheState {
    pub fn new(backend: SharedBackend, cache: CacheConfig, refresh: RefreshConfig) -> Self {
        let store = CacheStore::new(backend, cache);
        let fetchers = Arc::new(FetcherRegistry::new());
        Self {
            read_through: ReadThrough::with_fetchers(store.clone(), fetchers.clone()),
            invalidation: InvalidationManager::from_store(store.clone()),
            refresh: RefreshManager::new(store.clone(), fetchers, refresh),
            store,
        }
    }

    /// Connect the configured backing store and build every component on it.
    pub async fn connect(settings: &crate::config::Settings) -> Self {
        let backend = connect_backend(&settings.backend).await;
        Self::new(
            backend,
            CacheConfig::from(&settings.cache),
            RefreshConfig::from(&settings.refresh),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::backend::MemoryBackend;

    #[tokio::test]
    async fn components_share_keys_and_fetchers() {
        let state = CacheState::new(
            Arc::new(MemoryBackend::new()),
            CacheConfig::deterministic(),
            RefreshConfig::default(),
        );
        let before = state.store.keys().user_profile("1");
        state.invalidation.bump_module_version(crate::cache::Module::User);
        assert_ne!(state.read_through.store().keys().user_profile("1"), before);

        state
            .read_through
            .get_or_fetch_registered(
                &before,
                || async { Ok::<_, std::io::Error>(Some(1u8)) },
                Duration::from_secs(60),
            )
            .await
            .expect("fetch");
        assert!(state.read_through.fetchers().contains(&before));
    }
}
