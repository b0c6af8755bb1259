//! Dependency graph seam.
//!
//! Edges say "when the parent changes, the child is stale". [`LocalGraph`]
//! keeps them in this process; [`SharedGraph`] keeps them as sets in the
//! backing store so an invalidation issued by any process reaches
//! dependents registered by every other process.
//!
//! [`LocalGraph`]: super::registry::LocalGraph

use std::sync::Arc;

use async_trait::async_trait;

use super::backend::{BackendError, SharedBackend};
use super::config::DependencyScope;
use super::keys::KeyBuilder;
use super::registry::LocalGraph;

pub type SharedDependencyGraph = Arc<dyn DependencyGraph>;

#[async_trait]
pub trait DependencyGraph: Send + Sync {
    fn scope(&self) -> DependencyScope;

    /// Record that `child` depends on every key in `parents`.
    async fn add(&self, child: &str, parents: &[String]) -> Result<(), BackendError>;

    async fn dependents(&self, parent: &str) -> Result<Vec<String>, BackendError>;

    /// Remove every edge that touches `key`, in either direction.
    async fn remove_key(&self, key: &str) -> Result<(), BackendError>;

    /// Drop every edge.
    async fn clear(&self) -> Result<(), BackendError>;
}

/// Build the graph selected by `scope`.
pub fn dependency_graph(
    scope: DependencyScope,
    backend: SharedBackend,
    keys: KeyBuilder,
) -> SharedDependencyGraph {
    match scope {
        DependencyScope::Local => Arc::new(LocalGraph::new()),
        DependencyScope::Shared => Arc::new(SharedGraph::new(backend, keys)),
    }
}

/// Reverse-index sets in the backing store:
/// `{service}:system:deps:{parent}` and `{service}:system:parents:{child}`.
#[derive(Clone)]
pub struct SharedGraph {
    backend: SharedBackend,
    keys: KeyBuilder,
}

impl SharedGraph {
    pub fn new(backend: SharedBackend, keys: KeyBuilder) -> Self {
        Self { backend, keys }
    }
}

#[async_trait]
impl DependencyGraph for SharedGraph {
    fn scope(&self) -> DependencyScope {
        DependencyScope::Shared
    }

    async fn add(&self, child: &str, parents: &[String]) -> Result<(), BackendError> {
        let child_member = [child.to_string()];
        for parent in parents {
            self.backend
                .set_add(&self.keys.dependents_key(parent), &child_member)
                .await?;
        }
        self.backend
            .set_add(&self.keys.parents_key(child), parents)
            .await
    }

    async fn dependents(&self, parent: &str) -> Result<Vec<String>, BackendError> {
        self.backend
            .set_members(&self.keys.dependents_key(parent))
            .await
    }

    async fn remove_key(&self, key: &str) -> Result<(), BackendError> {
        let member = [key.to_string()];
        let dependents_key = self.keys.dependents_key(key);
        let parents_key = self.keys.parents_key(key);

        for parent in self.backend.set_members(&parents_key).await? {
            self.backend
                .set_remove(&self.keys.dependents_key(&parent), &member)
                .await?;
        }
        for child in self.backend.set_members(&dependents_key).await? {
            self.backend
                .set_remove(&self.keys.parents_key(&child), &member)
                .await?;
        }
        self.backend.delete(&[dependents_key, parents_key]).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        for pattern in [self.keys.dependents_key("*"), self.keys.parents_key("*")] {
            let keys = self.backend.scan(&pattern).await?;
            self.backend.delete(&keys).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::{KvBackend, MemoryBackend};

    fn shared() -> (SharedGraph, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let graph = SharedGraph::new(backend.clone(), KeyBuilder::new("whisper"));
        (graph, backend)
    }

    #[tokio::test]
    async fn edges_are_visible_through_another_handle() {
        let (graph, backend) = shared();
        graph
            .add("child", &["parent".to_string()])
            .await
            .expect("add");

        let other = SharedGraph::new(backend.clone(), KeyBuilder::new("whisper"));
        assert_eq!(other.dependents("parent").await.expect("deps"), vec!["child"]);
        assert_eq!(
            backend
                .set_members("whisper:system:parents:child")
                .await
                .expect("members"),
            vec!["parent"]
        );
        assert!(backend
            .exists("whisper:system:deps:parent")
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn remove_key_drops_both_directions() {
        let (graph, backend) = shared();
        graph.add("mid", &["root".to_string()]).await.expect("add");
        graph.add("leaf", &["mid".to_string()]).await.expect("add");

        graph.remove_key("mid").await.expect("remove");
        assert!(graph.dependents("root").await.expect("deps").is_empty());
        assert!(backend
            .set_members("whisper:system:parents:leaf")
            .await
            .expect("members")
            .is_empty());
        assert!(backend.scan("whisper:system:*").await.expect("scan").is_empty());
    }

    #[tokio::test]
    async fn clear_leaves_format_marker() {
        let (graph, backend) = shared();
        backend
            .set("whisper:system:cache_version", "1", None)
            .await
            .expect("set");
        graph.add("a", &["b".to_string()]).await.expect("add");

        graph.clear().await.expect("clear");
        assert_eq!(
            backend.scan("whisper:system:*").await.expect("scan"),
            vec!["whisper:system:cache_version".to_string()]
        );
    }

    #[tokio::test]
    async fn factory_honours_scope() {
        let backend: SharedBackend = Arc::new(MemoryBackend::new());
        let keys = KeyBuilder::new("whisper");
        let local = dependency_graph(DependencyScope::Local, backend.clone(), keys.clone());
        let shared = dependency_graph(DependencyScope::Shared, backend, keys);
        assert_eq!(local.scope(), DependencyScope::Local);
        assert_eq!(shared.scope(), DependencyScope::Shared);
    }
}
