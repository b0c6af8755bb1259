//! Redis-backed store on a `deadpool-redis` pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::Script;
use tracing::{info, warn};

use crate::config::{BackendKind, BackendSettings};

use super::{BackendError, KeyTtl, KvBackend, MemoryBackend, SharedBackend};

const SCAN_BATCH: usize = 500;

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const COMPARE_AND_REPLACE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("SET", KEYS[1], ARGV[2], "KEEPTTL")
    return 1
else
    return 0
end
"#;

// ARGV[3] is a TTL in milliseconds; 0 writes the key without expiry.
const COMPARE_AND_SET: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    if tonumber(ARGV[3]) > 0 then
        redis.call("SET", KEYS[1], ARGV[2], "PX", ARGV[3])
    else
        redis.call("SET", KEYS[1], ARGV[2])
    end
    return 1
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    release_script: Arc<Script>,
    replace_script: Arc<Script>,
    swap_script: Arc<Script>,
}

impl RedisBackend {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            release_script: Arc::new(Script::new(COMPARE_AND_DELETE)),
            replace_script: Arc::new(Script::new(COMPARE_AND_REPLACE)),
            swap_script: Arc::new(Script::new(COMPARE_AND_SET)),
        }
    }

    /// Build a pool from connection settings without connecting yet.
    pub fn from_settings(settings: &BackendSettings) -> Result<Self, BackendError> {
        let mut config = Config::from_url(settings.url.as_str());
        let timeout = Some(settings.timeout);
        if let Some(pool) = config.pool.as_mut() {
            pool.max_size = settings.pool_size;
            pool.timeouts.wait = timeout;
            pool.timeouts.create = timeout;
            pool.timeouts.recycle = timeout;
        } else {
            let mut pool = deadpool_redis::PoolConfig::new(settings.pool_size);
            pool.timeouts.wait = timeout;
            pool.timeouts.create = timeout;
            pool.timeouts.recycle = timeout;
            config.pool = Some(pool);
        }

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| BackendError::Pool(err.to_string()))?;
        Ok(Self::new(pool))
    }

    async fn connection(&self) -> Result<Connection, BackendError> {
        self.pool
            .get()
            .await
            .map_err(|err| BackendError::Pool(err.to_string()))
    }
}

fn command_error(command: &'static str) -> impl FnOnce(redis::RedisError) -> BackendError {
    move |err| BackendError::command(command, err.to_string())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KvBackend for RedisBackend {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(command_error("PING"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("GET"))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(command_error("SET"))?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackendError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(command_error("SET NX"))?;
        Ok(reply.is_some())
    }

    async fn replace_if_eq(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, BackendError> {
        let mut conn = self.connection().await?;
        let replaced: i64 = self
            .replace_script
            .key(key)
            .arg(expected)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error("EVALSHA"))?;
        Ok(replaced > 0)
    }

    async fn set_if_eq(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let mut conn = self.connection().await?;
        let written: i64 = self
            .swap_script
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl.map_or(0, millis))
            .invoke_async(&mut conn)
            .await
            .map_err(command_error("EVALSHA"))?;
        Ok(written > 0)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, BackendError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key.as_str());
        }
        cmd.query_async(&mut conn)
            .await
            .map_err(command_error("DEL"))
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, BackendError> {
        let mut conn = self.connection().await?;
        let removed: i64 = self
            .release_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error("EVALSHA"))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.connection().await?;
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("EXISTS"))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, BackendError> {
        let mut conn = self.connection().await?;
        let remaining: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("PTTL"))?;
        Ok(match remaining {
            -2 => KeyTtl::Missing,
            ms if ms < 0 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.unsigned_abs())),
        })
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(command_error("SCAN"))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once across iterations.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), BackendError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key);
        for member in members {
            cmd.arg(member.as_str());
        }
        let _: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(command_error("SADD"))?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), BackendError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key);
        for member in members {
            cmd.arg(member.as_str());
        }
        let _: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(command_error("SREM"))?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BackendError> {
        let mut conn = self.connection().await?;
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("SMEMBERS"))
    }
}

/// Connect the configured backing store.
///
/// A Redis store that cannot be reached at startup degrades to the
/// process-local store so the application keeps serving, only uncoordinated.
pub async fn connect_backend(settings: &BackendSettings) -> SharedBackend {
    match settings.kind {
        BackendKind::Memory => {
            info!(backend = "memory", "Using process-local cache backend");
            Arc::new(MemoryBackend::new())
        }
        BackendKind::Redis => {
            info!(backend = "redis", url = %settings.url, "Connecting cache backend");
            let redis = match RedisBackend::from_settings(settings) {
                Ok(redis) => redis,
                Err(error) => {
                    warn!(%error, "Failed to build Redis pool, falling back to memory backend");
                    return Arc::new(MemoryBackend::new());
                }
            };
            match redis.ping().await {
                Ok(()) => {
                    info!(backend = "redis", "Connected cache backend");
                    Arc::new(redis)
                }
                Err(error) => {
                    warn!(%error, "Redis unreachable, falling back to memory backend");
                    Arc::new(MemoryBackend::new())
                }
            }
        }
    }
}
