//! Process-local backing store on `DashMap`.
//!
//! Expiry is lazy: an expired key is dropped the next time it is touched or
//! when `purge_expired` runs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::{BackendError, KeyTtl, KvBackend, glob_match};

#[derive(Debug, Clone)]
enum Slot {
    Text(String),
    Members(HashSet<String>),
}

#[derive(Debug, Clone)]
struct StoredValue {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn text(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            slot: Slot::Text(value.to_string()),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, including not-yet-purged expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compare and swap under the entry's shard lock. `expires_at` of `None`
    /// keeps the current expiry.
    fn swap_if_eq(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        expires_at: Option<Option<Instant>>,
    ) -> Result<bool, BackendError> {
        let now = Instant::now();
        if let Some(mut stored) = self.entries.get_mut(key)
            && !stored.is_expired(now)
        {
            let stored = &mut *stored;
            return match &mut stored.slot {
                Slot::Text(text) if text.as_str() == expected => {
                    *text = value.to_string();
                    if let Some(expires_at) = expires_at {
                        stored.expires_at = expires_at;
                    }
                    Ok(true)
                }
                Slot::Text(_) => Ok(false),
                Slot::Members(_) => Err(BackendError::WrongType(key.to_string())),
            };
        }
        self.drop_if_expired(key, now);
        Ok(false)
    }

    fn drop_if_expired(&self, key: &str, now: Instant) {
        self.entries.remove_if(key, |_, value| value.is_expired(now));
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let now = Instant::now();
        if let Some(value) = self.entries.get(key)
            && !value.is_expired(now)
        {
            return match &value.slot {
                Slot::Text(text) => Ok(Some(text.clone())),
                Slot::Members(_) => Err(BackendError::WrongType(key.to_string())),
            };
        }
        self.drop_if_expired(key, now);
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        self.entries
            .insert(key.to_string(), StoredValue::text(value, ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackendError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue::text(value, Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::text(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn replace_if_eq(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, BackendError> {
        self.swap_if_eq(key, expected, value, None)
    }

    async fn set_if_eq(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.swap_if_eq(key, expected, value, Some(expires_at))
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, BackendError> {
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some((_, value)) = self.entries.remove(key)
                && !value.is_expired(now)
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, BackendError> {
        let now = Instant::now();
        let removed = self.entries.remove_if(key, |_, value| {
            !value.is_expired(now) && matches!(&value.slot, Slot::Text(text) if text == expected)
        });
        Ok(removed.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        Ok(!matches!(self.ttl(key).await?, KeyTtl::Missing))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, BackendError> {
        let now = Instant::now();
        let ttl = match self.entries.get(key) {
            Some(value) if !value.is_expired(now) => match value.expires_at {
                Some(at) => KeyTtl::Expires(at.saturating_duration_since(now)),
                None => KeyTtl::Persistent,
            },
            _ => KeyTtl::Missing,
        };
        if ttl == KeyTtl::Missing {
            self.drop_if_expired(key, now);
        }
        Ok(ttl)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let now = Instant::now();
        let keys = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now) && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        Ok(keys)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), BackendError> {
        let now = Instant::now();
        let mut stored = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue {
                slot: Slot::Members(HashSet::new()),
                expires_at: None,
            });
        if stored.is_expired(now) {
            *stored = StoredValue {
                slot: Slot::Members(HashSet::new()),
                expires_at: None,
            };
        }
        match &mut stored.slot {
            Slot::Members(set) => {
                set.extend(members.iter().cloned());
                Ok(())
            }
            Slot::Text(_) => Err(BackendError::WrongType(key.to_string())),
        }
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), BackendError> {
        let emptied = match self.entries.get_mut(key) {
            Some(mut stored) => match &mut stored.slot {
                Slot::Members(set) => {
                    for member in members {
                        set.remove(member);
                    }
                    set.is_empty()
                }
                Slot::Text(_) => return Err(BackendError::WrongType(key.to_string())),
            },
            None => false,
        };
        if emptied {
            self.entries
                .remove_if(key, |_, value| matches!(&value.slot, Slot::Members(set) if set.is_empty()));
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BackendError> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(value) if !value.is_expired(now) => match &value.slot {
                Slot::Members(set) => Ok(set.iter().cloned().collect()),
                Slot::Text(_) => Err(BackendError::WrongType(key.to_string())),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn purge_expired(&self) -> Result<usize, BackendError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, value| !value.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}
