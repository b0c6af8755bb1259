//! Stored envelope around every cached value.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::error::CacheError;

/// Layout version of [`CacheEntry`]. Changing the envelope bumps this and
/// the store clears entries written under the old layout.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// JSON layout: `{data, storedAt, version, hitCount, ttlMs}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub data: T,
    /// Unix milliseconds at write time.
    pub stored_at: i64,
    pub version: u32,
    #[serde(default)]
    pub hit_count: u64,
    /// TTL the entry was written with, before jitter. Zero means no expiry.
    #[serde(default)]
    pub ttl_ms: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, ttl: Duration) -> Self {
        Self {
            data,
            stored_at: now_millis(),
            version: CACHE_FORMAT_VERSION,
            hit_count: 0,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Original TTL, or `None` for entries without expiry.
    pub fn original_ttl(&self) -> Option<Duration> {
        (self.ttl_ms > 0).then(|| Duration::from_millis(self.ttl_ms))
    }
}

impl<T: Serialize> CacheEntry<T> {
    pub fn encode(&self, key: &str) -> Result<String, CacheError> {
        serde_json::to_string(self).map_err(|err| CacheError::serialize(key, err))
    }
}

impl CacheEntry<Value> {
    pub fn decode(key: &str, raw: &str) -> Result<Self, CacheError> {
        serde_json::from_str(raw).map_err(|err| CacheError::deserialize(key, err))
    }

    /// Deserialize the payload as `T` without consuming the envelope.
    pub fn data_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, CacheError> {
        T::deserialize(&self.data).map_err(|err| CacheError::deserialize(key, err))
    }

    /// Convert the untyped payload into `T`, keeping the envelope fields.
    pub fn into_typed<T: DeserializeOwned>(self, key: &str) -> Result<CacheEntry<T>, CacheError> {
        let data = serde_json::from_value(self.data).map_err(|err| CacheError::deserialize(key, err))?;
        Ok(CacheEntry {
            data,
            stored_at: self.stored_at,
            version: self.version,
            hit_count: self.hit_count,
            ttl_ms: self.ttl_ms,
        })
    }
}

pub(crate) fn now_millis() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serializes_camel_case_fields() {
        let entry = CacheEntry::new(json!({"name": "ada"}), Duration::from_secs(60));
        let encoded: Value = serde_json::from_str(&entry.encode("k").expect("encode")).expect("json");
        assert_eq!(encoded["data"]["name"], "ada");
        assert_eq!(encoded["version"], CACHE_FORMAT_VERSION);
        assert_eq!(encoded["hitCount"], 0);
        assert_eq!(encoded["ttlMs"], 60_000);
        assert!(encoded["storedAt"].as_i64().expect("storedAt") > 0);
    }

    #[test]
    fn decodes_entries_without_optional_fields() {
        let raw = r#"{"data":[1,2],"storedAt":1,"version":1}"#;
        let entry = CacheEntry::decode("k", raw).expect("decode");
        assert_eq!(entry.hit_count, 0);
        assert_eq!(entry.original_ttl(), None);
        let typed: CacheEntry<Vec<u8>> = entry.into_typed("k").expect("typed");
        assert_eq!(typed.data, vec![1, 2]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            CacheEntry::decode("k", "not json"),
            Err(CacheError::Deserialize { .. })
        ));
        let entry = CacheEntry::decode("k", r#"{"data":"x","storedAt":1,"version":1}"#).expect("decode");
        assert!(entry.data_as::<u32>("k").is_err());
        assert_eq!(entry.data_as::<String>("k").expect("typed"), "x");
        assert!(entry.into_typed::<u32>("k").is_err());
    }
}
