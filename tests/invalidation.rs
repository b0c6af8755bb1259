//! Invalidation across handles that share one backing store.

use std::sync::Arc;
use std::time::Duration;

use whisper_cache::cache::{
    CacheConfig, CacheStore, DependencyScope, InvalidationManager, KeyBuilder, MemoryBackend,
    Module, ModuleVersions, SharedBackend,
};

const TTL: Duration = Duration::from_secs(60);

fn manager_on(backend: SharedBackend, scope: DependencyScope) -> InvalidationManager {
    let config = CacheConfig::deterministic().with_dependency_scope(scope);
    InvalidationManager::from_store(CacheStore::new(backend, config))
}

fn setup(scope: DependencyScope) -> (InvalidationManager, CacheStore) {
    let backend: SharedBackend = Arc::new(MemoryBackend::new());
    let config = CacheConfig::deterministic().with_dependency_scope(scope);
    let store = CacheStore::new(backend, config);
    (InvalidationManager::from_store(store.clone()), store)
}

#[tokio::test]
async fn invalidating_a_user_cascades_to_derived_lists() {
    let (manager, store) = setup(DependencyScope::Shared);
    let keys = store.keys().clone();
    let profile = keys.user_profile("u1");
    let chats = keys.chat_list("u1");
    let members = keys.chat_members("g1");

    for key in [&profile, &chats, &members] {
        store.set(key, &"v", TTL).await;
    }
    manager.register_dependency(&chats, &[profile.clone()]).await;
    manager.register_dependency(&members, &[chats.clone()]).await;

    assert_eq!(manager.invalidate_user_cache("u1").await, 3);
    for key in [&profile, &chats, &members] {
        assert_eq!(store.get::<String>(key).await, None);
    }
}

#[tokio::test]
async fn shared_edges_reach_other_processes() {
    let backend: SharedBackend = Arc::new(MemoryBackend::new());
    let writer = manager_on(backend.clone(), DependencyScope::Shared);
    let invalidator = manager_on(backend.clone(), DependencyScope::Shared);
    let store = CacheStore::new(backend, CacheConfig::deterministic());

    store.set("whisper:user:profile:1:v1", &"a", TTL).await;
    store.set("whisper:chat:list:1:v1", &"b", TTL).await;
    writer
        .register_dependency(
            "whisper:chat:list:1:v1",
            &["whisper:user:profile:1:v1".to_string()],
        )
        .await;

    assert_eq!(invalidator.invalidate("whisper:user:profile:1:v1").await, 2);
    assert_eq!(store.get::<String>("whisper:chat:list:1:v1").await, None);
}

#[tokio::test]
async fn local_edges_stay_in_process() {
    let backend: SharedBackend = Arc::new(MemoryBackend::new());
    let writer = manager_on(backend.clone(), DependencyScope::Local);
    let invalidator = manager_on(backend.clone(), DependencyScope::Local);
    let store = CacheStore::new(backend, CacheConfig::deterministic());

    store.set("parent", &"a", TTL).await;
    store.set("child", &"b", TTL).await;
    writer
        .register_dependency("child", &["parent".to_string()])
        .await;

    assert_eq!(invalidator.invalidate("parent").await, 1);
    assert!(store.get::<String>("child").await.is_some());
}

#[tokio::test]
async fn module_bump_leaves_old_keys_readable() {
    let (manager, store) = setup(DependencyScope::Local);
    let keys = store.keys().clone();
    let old = keys.confession_detail("c1");
    store.set(&old, &"old", TTL).await;

    let version = manager.bump_module_version(Module::Confession);
    assert_eq!(version, 2);

    let new = keys.confession_detail("c1");
    assert!(new.ends_with(":v2"));
    store.set(&new, &"new", TTL).await;

    assert_eq!(store.get::<String>(&old).await.as_deref(), Some("old"));
    assert_eq!(store.get::<String>(&new).await.as_deref(), Some("new"));
}

#[tokio::test]
async fn module_versions_can_be_shared_between_builders() {
    let versions = Arc::new(ModuleVersions::new());
    let a = KeyBuilder::with_versions("whisper", versions.clone());
    let b = KeyBuilder::with_versions("whisper", versions);

    let backend: SharedBackend = Arc::new(MemoryBackend::new());
    let store = CacheStore::with_keys(backend, CacheConfig::deterministic(), a.clone());
    let manager = InvalidationManager::from_store(store);

    manager.invalidate_module(Module::Notification).await;
    assert_eq!(a.notification_list("u1"), b.notification_list("u1"));
    assert!(b.notification_list("u1").ends_with(":v2"));
}

#[tokio::test]
async fn group_and_notification_helpers() {
    let (manager, store) = setup(DependencyScope::Shared);
    let keys = store.keys().clone();
    store.set(&keys.chat_group("g1"), &"g", TTL).await;
    store.set(&keys.chat_members("g1"), &"m", TTL).await;
    store.set(&keys.notification_list("u1"), &"n", TTL).await;

    assert_eq!(manager.invalidate_group_chat_cache("g1").await, 2);
    assert_eq!(manager.invalidate_notification_cache("u1").await, 1);
}
