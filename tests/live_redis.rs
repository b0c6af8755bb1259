//! Backend contract against a running Redis.
//!
//! - Marked `#[ignore]`; run with `cargo test -- --ignored`.
//! - Reads the server address from `WHISPER_TEST_REDIS_URL`
//!   (default `redis://127.0.0.1:6379`).
//! - Every test works under a fresh service prefix and cleans it up.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use uuid::Uuid;
use whisper_cache::cache::{
    CacheConfig, CacheStore, InvalidationManager, KeyTtl, KvBackend, ReadThrough, RedisBackend,
    SharedBackend,
};
use whisper_cache::config::{BackendKind, BackendSettings};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

fn redis_url() -> String {
    std::env::var("WHISPER_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn connect() -> TestResult<Arc<RedisBackend>> {
    let backend = RedisBackend::from_settings(&BackendSettings {
        kind: BackendKind::Redis,
        url: redis_url(),
        pool_size: 8,
        timeout: Duration::from_secs(2),
    })?;
    backend.ping().await?;
    Ok(Arc::new(backend))
}

fn service() -> String {
    format!("whisper-test-{}", Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore]
async fn live_backend_primitives() -> TestResult<()> {
    let backend = connect().await?;
    let prefix = service();
    let key = format!("{prefix}:user:profile:1:v1");

    backend.set(&key, "a", Some(Duration::from_secs(30))).await?;
    assert_eq!(backend.get(&key).await?.as_deref(), Some("a"));
    assert!(!backend.set_nx(&key, "b", Duration::from_secs(30)).await?);

    assert!(!backend.replace_if_eq(&key, "stale", "c").await?);
    assert!(backend.replace_if_eq(&key, "a", "c").await?);
    assert!(matches!(backend.ttl(&key).await?, KeyTtl::Expires(_)));
    assert!(!backend.replace_if_eq(&format!("{prefix}:missing"), "a", "x").await?);

    assert!(backend.set_if_eq(&key, "c", "d", None).await?);
    assert_eq!(backend.ttl(&key).await?, KeyTtl::Persistent);
    assert!(backend.set_if_eq(&key, "d", "c", Some(Duration::from_secs(30))).await?);
    assert!(matches!(backend.ttl(&key).await?, KeyTtl::Expires(_)));
    assert!(!backend.set_if_eq(&key, "d", "e", None).await?);

    assert!(!backend.delete_if_eq(&key, "a").await?);
    assert!(backend.delete_if_eq(&key, "c").await?);
    assert_eq!(backend.ttl(&key).await?, KeyTtl::Missing);

    let set = format!("{prefix}:system:deps:x");
    backend
        .set_add(&set, &["m1".to_string(), "m2".to_string()])
        .await?;
    backend.set_remove(&set, &["m1".to_string()]).await?;
    assert_eq!(backend.set_members(&set).await?, vec!["m2".to_string()]);

    let keys = backend.scan(&format!("{prefix}:*")).await?;
    assert_eq!(keys, vec![set.clone()]);
    backend.delete(&keys).await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn live_read_through_collapses_misses() -> TestResult<()> {
    let backend: SharedBackend = connect().await?;
    let config = CacheConfig::deterministic().with_service(service());
    let store = CacheStore::new(backend, config);
    let cache = ReadThrough::new(store.clone());
    let key = store.keys().user_profile("42");
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let key = key.clone();
        let calls = calls.clone();
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_fetch(
                    &key,
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, std::io::Error>(Some(42u64))
                    },
                    Duration::from_secs(30),
                )
                .await
        }));
    }
    for task in tasks {
        assert_eq!(task.await??, Some(42));
    }
    assert!(calls.load(Ordering::SeqCst) <= 2);

    store.clear_all().await;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn live_cascade_across_handles() -> TestResult<()> {
    let backend: SharedBackend = connect().await?;
    let config = CacheConfig::deterministic().with_service(service());
    let store = CacheStore::new(backend.clone(), config.clone());
    let first = InvalidationManager::from_store(store.clone());
    let second = InvalidationManager::from_store(CacheStore::new(backend, config));

    let parent = store.keys().user_profile("1");
    let child = store.keys().chat_list("1");
    store.set(&parent, &"p", Duration::from_secs(30)).await;
    store.set(&child, &"c", Duration::from_secs(30)).await;
    first.register_dependency(&child, &[parent.clone()]).await;

    assert_eq!(second.invalidate(&parent).await, 2);
    assert_eq!(store.get::<String>(&child).await, None);

    store.clear_all().await;
    Ok(())
}
