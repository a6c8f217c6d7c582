//! Cache-aside behavior seen through the store: writers invalidate before
//! returning, and a cache outage never fails a read or a write.

use fleet_core::{DeviceChanges, EntityType, NamespaceChanges, SystemSettingsChanges};
use fleet_storage::{Collection, Executor, Expr, InMemoryEngine, Store, StoreConfig, UpdateSpec};
use fleet_test_utils::assertions::*;
use fleet_test_utils::fixtures::*;
use std::sync::Arc;

fn rename(name: &str) -> NamespaceChanges {
    NamespaceChanges {
        name: Some(name.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_update_invalidates_before_returning() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    assert_eq!(t.store.namespace_get_cached(&ns.tenant_id).await.unwrap().name, "acme");

    // A write behind the store's back is invisible while the entry lives.
    t.engine
        .update_one(
            Collection::Namespaces,
            &Expr::eq("tenant_id", ns.tenant_id.as_str()),
            &UpdateSpec::new().set("max_devices", 3),
        )
        .await
        .unwrap();
    let cached = t.store.namespace_get_cached(&ns.tenant_id).await.unwrap();
    assert_eq!(cached.max_devices, -1);

    t.store
        .namespace_update(&ns.tenant_id, &rename("acme-corp"))
        .await
        .unwrap();
    let fresh = t.store.namespace_get_cached(&ns.tenant_id).await.unwrap();
    assert_eq!(fresh.name, "acme-corp");
    assert_eq!(fresh.max_devices, 3);
}

#[tokio::test]
async fn test_device_write_invalidates_cached_device() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let d = t.seed_device(&ns.tenant_id, "web").await;
    assert_eq!(t.store.device_get_cached(&d.uid).await.unwrap().namespace, "acme");

    let changes = DeviceChanges {
        name: Some("web-01".to_string()),
        ..Default::default()
    };
    t.store
        .device_update(&ns.tenant_id, &d.uid, &changes)
        .await
        .unwrap();
    assert_eq!(t.store.device_get_cached(&d.uid).await.unwrap().name, "web-01");

    t.store.device_delete(&ns.tenant_id, &d.uid).await.unwrap();
    assert_not_found(&t.store.device_get_cached(&d.uid).await, EntityType::Device);
}

#[tokio::test]
async fn test_namespace_rename_reaches_cached_devices() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let d = t.seed_device(&ns.tenant_id, "web").await;
    assert_eq!(t.store.device_get_cached(&d.uid).await.unwrap().namespace, "acme");

    t.store
        .namespace_update(&ns.tenant_id, &rename("renamed"))
        .await
        .unwrap();
    let device = t.store.device_get_cached(&d.uid).await.unwrap();
    assert_eq!(device.namespace, "renamed");
    assert_eq!(device.name, "web");
}

#[tokio::test]
async fn test_missing_entity_is_not_found_but_no_op_is_ok() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;

    assert_not_found(
        &t.store.namespace_update("missing", &rename("x")).await,
        EntityType::Namespace,
    );
    // Matching a document without changing it is a success.
    assert_ok(&t.store.namespace_update(&ns.tenant_id, &rename("acme")).await);
}

#[tokio::test]
async fn test_cache_outage_degrades_to_store_reads() {
    fleet_test_utils::init_tracing();
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    t.store.namespace_get_cached(&ns.tenant_id).await.unwrap();

    t.cache.set_available(false);
    t.store
        .namespace_update(&ns.tenant_id, &rename("during-outage"))
        .await
        .unwrap();
    let read = t.store.namespace_get_cached(&ns.tenant_id).await.unwrap();
    assert_eq!(read.name, "during-outage");

    let settings = SystemSettingsChanges {
        signup_enabled: Some(false),
        ..Default::default()
    };
    t.store.system_update(&settings).await.unwrap();
    assert!(!t.store.system_get().await.unwrap().signup_enabled);
    assert_eq!(t.store.cache().stats().await.hits, 0);
}

#[tokio::test]
async fn test_lmdb_cache_backend_serves_reads() {
    let dir = tempfile::tempdir().unwrap();
    let engine = InMemoryEngine::new();
    let config = StoreConfig::default().with_cache_dir(dir.path());
    let store = Store::from_config(Arc::new(engine), config).unwrap();
    store.ensure_indexes().await.unwrap();

    let owner = user("ann", store.now());
    let ns = fleet_core::Namespace::new("acme", owner.id, store.now());
    store.namespace_create(&ns).await.unwrap();

    store.namespace_get_cached(&ns.tenant_id).await.unwrap();
    store.namespace_get_cached(&ns.tenant_id).await.unwrap();
    assert_eq!(store.cache().stats().await.hits, 1);

    store
        .namespace_update(&ns.tenant_id, &rename("acme-corp"))
        .await
        .unwrap();
    assert_eq!(
        store.namespace_get_cached(&ns.tenant_id).await.unwrap().name,
        "acme-corp"
    );
}

#[tokio::test]
async fn test_unusable_cache_dir_falls_back_to_memory() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"x").unwrap();

    let config = StoreConfig::default().with_cache_dir(&file);
    let store = Store::from_config(Arc::new(InMemoryEngine::new()), config).unwrap();
    store.ensure_indexes().await.unwrap();
    assert_ok(&store.health_check().await);
}
