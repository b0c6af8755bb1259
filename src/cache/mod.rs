//! Whisper read-through cache.
//!
//! A shared key-value tier in front of the authoritative data source:
//!
//! - **Store**: typed entries with TTL jitter, null markers and statistics
//! - **Read-through**: `get_or_fetch` with per-key locking so concurrent
//!   misses reach the source once
//! - **Invalidation**: dependency cascades, pattern and module invalidation
//! - **Refresh**: background extension or revalidation of hot entries
//!
//! ## Configuration
//!
//! Behaviour is controlled via `whisper.toml`:
//!
//! ```toml
//! [cache]
//! service = "whisper"
//! dependency_scope = "shared"
//!
//! [cache.ttl]
//! short = 300
//! medium = 1800
//!
//! [refresh]
//! interval_seconds = 300
//! # ... see config/mod.rs for all options
//! ```

pub mod backend;
mod config;
pub mod deps;
mod entry;
mod error;
mod fetchers;
mod invalidation;
mod key_lock;
mod keys;
mod lock;
mod read_through;
mod refresh;
mod registry;
mod state;
mod stats;
mod store;

pub use backend::{
    BackendError, KeyTtl, KvBackend, MemoryBackend, RedisBackend, SharedBackend, connect_backend,
};
pub use self::config::{CacheConfig, DependencyScope, RefreshConfig, TtlHint, TtlTier, TtlTiers};
pub use deps::{DependencyGraph, SharedDependencyGraph, SharedGraph};
pub use entry::{CACHE_FORMAT_VERSION, CacheEntry};
pub use error::CacheError;
pub use fetchers::{BoxError, FetcherRegistry, RegisteredFetcher};
pub use invalidation::InvalidationManager;
pub use key_lock::{KeyLock, LockGuard};
pub use keys::{
    KeyBuilder, Module, ModuleVersions, Resource, UnknownModule, is_lock_key, is_null_key,
    lock_key, null_key, pair_id, versioned_key,
};
pub use read_through::ReadThrough;
pub use refresh::{RefreshHandle, RefreshManager, RefreshReport};
pub use registry::LocalGraph;
pub use state::CacheState;
pub use stats::{CacheStatistics, HotKey, OperationCounts, StatsSnapshot};
pub use store::CacheStore;
