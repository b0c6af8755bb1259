//! Invalidation manager.
//!
//! Nothing here observes writes on its own: a write path calls the helper
//! for the entity it changed once the write has committed.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, info, warn};

use super::backend::BackendError;
use super::deps::{SharedDependencyGraph, dependency_graph};
use super::keys::{Module, Resource, null_key};
use super::store::CacheStore;

#[derive(Clone)]
pub struct InvalidationManager {
    store: CacheStore,
    graph: SharedDependencyGraph,
}

impl InvalidationManager {
    pub fn new(store: CacheStore, graph: SharedDependencyGraph) -> Self {
        Self { store, graph }
    }

    /// Use the dependency graph selected by the store's configuration.
    pub fn from_store(store: CacheStore) -> Self {
        let graph = dependency_graph(
            store.config().dependency_scope,
            store.backend().clone(),
            store.keys().clone(),
        );
        Self::new(store, graph)
    }

    pub fn graph(&self) -> &SharedDependencyGraph {
        &self.graph
    }

    pub async fn try_register_dependency(
        &self,
        key: &str,
        parents: &[String],
    ) -> Result<(), BackendError> {
        self.graph.add(key, parents).await?;
        debug!(key, parents = parents.len(), "Registered cache dependency");
        Ok(())
    }

    /// Make `key` stale whenever any of `parents` is invalidated.
    pub async fn register_dependency(&self, key: &str, parents: &[String]) -> bool {
        match self.try_register_dependency(key, parents).await {
            Ok(()) => true,
            Err(error) => {
                warn!(key, %error, "Failed to register cache dependency");
                false
            }
        }
    }

    /// Clear the service namespace and every dependency edge. Returns how
    /// many keys were deleted.
    pub async fn clear_all(&self) -> u64 {
        let removed = self.store.clear_all().await;
        if let Err(error) = self.graph.clear().await {
            warn!(%error, "Failed to clear cache dependency graph");
        }
        removed
    }

    /// Delete `key` and everything that transitively depends on it.
    ///
    /// Null markers of every visited key go too, and all edges touching a
    /// visited key are dropped. Returns how many entries were deleted.
    pub async fn invalidate(&self, key: &str) -> u64 {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([key.to_string()]);
        let mut doomed = Vec::new();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            match self.graph.dependents(&current).await {
                Ok(children) => queue.extend(
                    children
                        .into_iter()
                        .filter(|child| !visited.contains(child)),
                ),
                Err(error) => {
                    warn!(key = %current, %error, "Failed to read cache dependents");
                }
            }
            doomed.push(current);
        }

        let markers: Vec<String> = doomed.iter().map(|key| null_key(key)).collect();
        let removed = self.store.delete_keys(&doomed).await;
        self.store.delete_keys(&markers).await;

        for touched in &doomed {
            if let Err(error) = self.graph.remove_key(touched).await {
                warn!(key = %touched, %error, "Failed to drop cache dependency edges");
            }
        }

        info!(
            key,
            cascaded = doomed.len().saturating_sub(1),
            removed,
            "Invalidated cache key"
        );
        removed
    }

    pub async fn invalidate_by_pattern(&self, pattern: &str) -> u64 {
        let removed = self.store.delete_by_pattern(pattern).await;
        info!(pattern, removed, "Invalidated cache pattern");
        removed
    }

    /// Delete every entry in `module` and move the module to a new version,
    /// so keys generated from now on cannot collide with anything older.
    pub async fn invalidate_module(&self, module: Module) -> u64 {
        let removed = self
            .store
            .delete_by_pattern(&self.store.keys().module_pattern(module))
            .await;
        let version = self.bump_module_version(module);
        info!(module = %module, removed, version, "Invalidated cache module");
        removed
    }

    pub async fn invalidate_resource(&self, module: Module, resource: &Resource) -> u64 {
        let pattern = self.store.keys().resource_pattern(module, resource);
        let removed = self.store.delete_by_pattern(&pattern).await;
        info!(module = %module, resource = %resource, removed, "Invalidated cache resource");
        removed
    }

    /// Returns the new version. Existing keys are left in place.
    pub fn bump_module_version(&self, module: Module) -> u64 {
        self.store.keys().versions().bump(module)
    }

    // ------------------------------------------------------------------
    // Entity helpers
    // ------------------------------------------------------------------

    pub async fn invalidate_user_cache(&self, user_id: &str) -> u64 {
        let keys = self.store.keys();
        self.invalidate(&keys.user_profile(user_id)).await
            + self.invalidate(&keys.user_status(user_id)).await
    }

    /// Detail entry plus every cached list page, since any page may hold it.
    pub async fn invalidate_confession_cache(&self, confession_id: &str) -> u64 {
        let detail = self.store.keys().confession_detail(confession_id);
        self.invalidate(&detail).await
            + self
                .invalidate_resource(Module::Confession, &Resource::List)
                .await
    }

    /// Private conversation between two users plus both users' chat lists.
    pub async fn invalidate_chat_cache(&self, user_a: &str, user_b: &str) -> u64 {
        let keys = self.store.keys();
        self.invalidate(&keys.chat_private(user_a, user_b)).await
            + self.invalidate(&keys.chat_list(user_a)).await
            + self.invalidate(&keys.chat_list(user_b)).await
    }

    pub async fn invalidate_group_chat_cache(&self, group_id: &str) -> u64 {
        let keys = self.store.keys();
        self.invalidate(&keys.chat_group(group_id)).await
            + self.invalidate(&keys.chat_members(group_id)).await
    }

    pub async fn invalidate_notification_cache(&self, user_id: &str) -> u64 {
        self.invalidate(&self.store.keys().notification_list(user_id))
            .await
    }
}
