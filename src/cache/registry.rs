//! Process-local dependency graph.
//!
//! Tracks parent → dependents and dependent → parents so invalidating a
//! parent finds everything built from it, and dropping a key cleans up both
//! directions. Edges live only as long as the process.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use super::backend::BackendError;
use super::config::DependencyScope;
use super::deps::DependencyGraph;
use super::lock::{rw_read, rw_write};

const TARGET: &str = "cache::registry";

#[derive(Debug, Default)]
struct Edges {
    /// parent → keys derived from it
    dependents: HashMap<String, HashSet<String>>,
    /// key → parents it was derived from
    parents: HashMap<String, HashSet<String>>,
}

#[derive(Debug, Default)]
pub struct LocalGraph {
    edges: RwLock<Edges>,
}

impl LocalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, child: &str, parents: &[String]) {
        let mut edges = rw_write(&self.edges, TARGET, "register");
        for parent in parents {
            edges
                .dependents
                .entry(parent.clone())
                .or_default()
                .insert(child.to_string());
        }
        edges
            .parents
            .entry(child.to_string())
            .or_default()
            .extend(parents.iter().cloned());
    }

    pub fn dependents_of(&self, parent: &str) -> HashSet<String> {
        rw_read(&self.edges, TARGET, "dependents_of")
            .dependents
            .get(parent)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove every edge that touches `key`, in either direction.
    pub fn unregister(&self, key: &str) {
        let mut edges = rw_write(&self.edges, TARGET, "unregister");

        if let Some(parents) = edges.parents.remove(key) {
            for parent in parents {
                if let Some(children) = edges.dependents.get_mut(&parent) {
                    children.remove(key);
                    if children.is_empty() {
                        edges.dependents.remove(&parent);
                    }
                }
            }
        }

        if let Some(children) = edges.dependents.remove(key) {
            for child in children {
                if let Some(parents) = edges.parents.get_mut(&child) {
                    parents.remove(key);
                    if parents.is_empty() {
                        edges.parents.remove(&child);
                    }
                }
            }
        }
    }

    pub fn clear(&self) {
        let mut edges = rw_write(&self.edges, TARGET, "clear");
        edges.dependents.clear();
        edges.parents.clear();
    }
}

#[async_trait]
impl DependencyGraph for LocalGraph {
    fn scope(&self) -> DependencyScope {
        DependencyScope::Local
    }

    async fn add(&self, child: &str, parents: &[String]) -> Result<(), BackendError> {
        self.register(child, parents);
        Ok(())
    }

    async fn dependents(&self, parent: &str) -> Result<Vec<String>, BackendError> {
        Ok(self.dependents_of(parent).into_iter().collect())
    }

    async fn remove_key(&self, key: &str) -> Result<(), BackendError> {
        self.unregister(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        LocalGraph::clear(self);
        Ok(())
    }
}
