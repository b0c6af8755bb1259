//! Backing key-value store seam.
//!
//! Every operation touches a single key (or a single set), so the store can
//! be shared by any number of readers and writers without transactions.

mod glob;
mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use glob::glob_match;
pub use memory::MemoryBackend;
pub use redis_store::{RedisBackend, connect_backend};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backing store connection unavailable: {0}")]
    Pool(String),
    #[error("backing store command `{command}` failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },
    #[error("key `{0}` holds a value of the wrong type")]
    WrongType(String),
}

impl BackendError {
    pub fn command(command: &'static str, message: impl Into<String>) -> Self {
        Self::Command {
            command,
            message: message.into(),
        }
    }
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

pub type SharedBackend = Arc<dyn KvBackend>;

#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Short label used in logs (`memory`, `redis`).
    fn kind(&self) -> &'static str;

    async fn ping(&self) -> Result<(), BackendError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Write `value`; `None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
    -> Result<(), BackendError>;

    /// Write only when the key is absent. Returns whether the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackendError>;

    /// Overwrite `key` only while it still holds `expected`, keeping its
    /// remaining TTL.
    async fn replace_if_eq(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, BackendError>;

    /// Overwrite `key` with a fresh TTL only while it still holds `expected`.
    async fn set_if_eq(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError>;

    /// Remove keys, returning how many actually existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, BackendError>;

    /// Remove `key` only while it still holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, BackendError>;

    async fn exists(&self, key: &str) -> Result<bool, BackendError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, BackendError>;

    /// Enumerate keys matching a glob (`*`, `?`, `[...]`).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BackendError>;

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), BackendError>;

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), BackendError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BackendError>;

    /// Drop expired keys the store does not reclaim on its own. Returns how
    /// many were removed.
    async fn purge_expired(&self) -> Result<usize, BackendError> {
        Ok(0)
    }
}
