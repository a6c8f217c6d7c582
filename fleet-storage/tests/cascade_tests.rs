//! Cross-collection cascades: all-or-nothing deletes and renames.

use fleet_core::{DeviceStatus, EntityType, MemberRole};
use fleet_storage::{Collection, Document, Executor, Operation};
use fleet_test_utils::assertions::*;
use fleet_test_utils::fixtures::*;
use serde_json::{json, Value};

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

// ============================================================================
// NAMESPACE DELETE
// ============================================================================

async fn populated() -> (TestStore, String) {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let web = t.seed_device(&ns.tenant_id, "web").await;
    t.seed_device(&ns.tenant_id, "db").await;
    t.store
        .session_create(&session("s1", &web, t.now()))
        .await
        .unwrap();
    t.store
        .firewall_rule_create(&firewall_rule(&ns.tenant_id, 1, &["prod"]))
        .await
        .unwrap();
    t.store
        .public_key_create(&public_key(&ns.tenant_id, "fp1", &["prod"], t.now()))
        .await
        .unwrap();
    (t, ns.tenant_id)
}

#[tokio::test]
async fn test_namespace_delete_removes_tenant_data() {
    let (t, tenant_id) = populated().await;
    let (_, other) = t.seed_namespace("globex").await;
    t.seed_device(&other.tenant_id, "web").await;

    t.store.namespace_delete(&tenant_id).await.unwrap();

    assert_not_found(
        &t.store.namespace_get_cached(&tenant_id).await,
        EntityType::Namespace,
    );
    assert_eq!(t.count(Collection::Devices), 1);
    assert_eq!(t.count(Collection::Sessions), 0);
    assert_eq!(t.count(Collection::ActiveSessions), 0);
    assert_eq!(t.count(Collection::FirewallRules), 0);
    assert_eq!(t.count(Collection::PublicKeys), 0);
}

#[tokio::test]
async fn test_namespace_delete_rolls_back_on_mid_cascade_failure() {
    fleet_test_utils::init_tracing();
    let (t, tenant_id) = populated().await;

    t.engine.fail_next(Collection::Sessions, Operation::Delete);
    let result = t.store.namespace_delete(&tenant_id).await;
    assert_aborted_at(&result, "delete sessions");

    let ns = t.store.namespace_get_cached(&tenant_id).await.unwrap();
    assert_device_counts(&ns, [2, 0, 0, 0]);
    assert_eq!(t.count(Collection::Devices), 2);
    assert_eq!(t.count(Collection::Sessions), 1);
    assert_eq!(t.count(Collection::FirewallRules), 1);

    t.store.namespace_delete(&tenant_id).await.unwrap();
    assert_eq!(t.count(Collection::Devices), 0);
}

#[tokio::test]
async fn test_deleting_missing_namespace_is_not_found() {
    let t = TestStore::new().await;
    let result = t.store.namespace_delete("no-such-tenant").await;
    assert_not_found(&result, EntityType::Namespace);
    assert!(!result.unwrap_err().is_transaction_aborted());
}

// ============================================================================
// DEVICES AND COUNTERS
// ============================================================================

#[tokio::test]
async fn test_status_transitions_keep_counters_in_sync() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let a = t.seed_device(&ns.tenant_id, "a").await;
    let b = t.seed_device(&ns.tenant_id, "b").await;

    t.store
        .device_update_status(&ns.tenant_id, &a.uid, DeviceStatus::Accepted)
        .await
        .unwrap();
    t.store
        .device_update_status(&ns.tenant_id, &b.uid, DeviceStatus::Rejected)
        .await
        .unwrap();
    let cached = t.store.namespace_get_cached(&ns.tenant_id).await.unwrap();
    assert_device_counts(&cached, [0, 1, 1, 0]);

    t.store.device_delete(&ns.tenant_id, &a.uid).await.unwrap();
    let cached = t.store.namespace_get_cached(&ns.tenant_id).await.unwrap();
    assert_device_counts(&cached, [0, 0, 1, 0]);

    t.store.namespace_sync_device_counts(&ns.tenant_id).await.unwrap();
    let synced = t.store.namespace_get_cached(&ns.tenant_id).await.unwrap();
    assert_eq!(synced, cached);
}

#[tokio::test]
async fn test_failed_status_change_leaves_counters_alone() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let d = t.seed_device(&ns.tenant_id, "a").await;

    t.engine.fail_next(Collection::Namespaces, Operation::Update);
    let result = t
        .store
        .device_update_status(&ns.tenant_id, &d.uid, DeviceStatus::Accepted)
        .await;
    assert!(result.unwrap_err().is_transaction_aborted());

    let device = t.store.device_get_cached(&d.uid).await.unwrap();
    assert_eq!(device.status, DeviceStatus::Pending);
    let cached = t.store.namespace_get_cached(&ns.tenant_id).await.unwrap();
    assert_device_counts(&cached, [1, 0, 0, 0]);
}

#[tokio::test]
async fn test_device_delete_leaves_other_tenants_rows_alone() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let (_, other) = t.seed_namespace("globex").await;
    let d = t.seed_device(&ns.tenant_id, "web").await;
    t.store
        .session_create(&session("s1", &d, t.now()))
        .await
        .unwrap();

    for tenant in [&ns.tenant_id, &other.tenant_id] {
        let frame = json!({"uid": "s1", "tenant_id": tenant, "message": "{}", "time": t.now()});
        t.engine
            .insert_one(Collection::RecordedSessions, doc(frame))
            .await
            .unwrap();
    }
    let marker = json!({
        "uid": d.uid,
        "tenant_id": other.tenant_id,
        "status": "pending",
        "last_seen": t.now(),
    });
    t.engine
        .insert_one(Collection::ConnectedDevices, doc(marker))
        .await
        .unwrap();

    t.store.device_delete(&ns.tenant_id, &d.uid).await.unwrap();

    let frames = t.engine.dump(Collection::RecordedSessions).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["tenant_id"], json!(other.tenant_id));
    let markers = t.engine.dump(Collection::ConnectedDevices).unwrap();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0]["tenant_id"], json!(other.tenant_id));
    assert_eq!(t.count(Collection::ActiveSessions), 0);
}

#[tokio::test]
async fn test_presence_writes_are_scoped_to_the_callers_tenant() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let (_, other) = t.seed_namespace("globex").await;
    let d = t.seed_device(&ns.tenant_id, "web").await;
    t.store.device_touch(&ns.tenant_id, &d.uid).await.unwrap();

    assert_not_found(
        &t.store.device_touch(&other.tenant_id, &d.uid).await,
        EntityType::Device,
    );
    assert_not_found(
        &t.store
            .device_mark_disconnected(&other.tenant_id, &d.uid)
            .await,
        EntityType::Device,
    );
    let markers = t.engine.dump(Collection::ConnectedDevices).unwrap();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0]["tenant_id"], json!(ns.tenant_id));
    assert!(t.store.device_get_cached(&d.uid).await.unwrap().online);
}

// ============================================================================
// TAGS
// ============================================================================

#[tokio::test]
async fn test_tag_rename_spans_devices_rules_and_keys() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let tenant = ns.tenant_id.as_str();
    for name in ["web", "db"] {
        let d = t.seed_device(tenant, name).await;
        t.store.device_push_tag(tenant, &d.uid, "prod").await.unwrap();
    }
    t.store
        .firewall_rule_create(&firewall_rule(tenant, 1, &["prod", "eu"]))
        .await
        .unwrap();
    t.store
        .public_key_create(&public_key(tenant, "fp1", &["prod"], t.now()))
        .await
        .unwrap();

    assert_eq!(t.store.tag_rename(tenant, "prod", "production").await.unwrap(), 4);
    assert_eq!(t.store.tag_rename(tenant, "prod", "production").await.unwrap(), 0);
    assert_eq!(
        t.store.tag_list(tenant).await.unwrap(),
        vec!["eu".to_string(), "production".to_string()]
    );

    assert_eq!(t.store.tag_delete(tenant, "production").await.unwrap(), 4);
    assert_eq!(t.store.tag_list(tenant).await.unwrap(), vec!["eu".to_string()]);
}

#[tokio::test]
async fn test_tag_rename_rejects_empty_target() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    assert_validation_error(&t.store.tag_rename(&ns.tenant_id, "prod", " ").await);
}

// ============================================================================
// MEMBERSHIP AND USERS
// ============================================================================

#[tokio::test]
async fn test_removed_member_loses_preferred_namespace() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let carol = user("carol", t.now());
    t.store.user_create(&carol).await.unwrap();
    t.store
        .namespace_add_member(&ns.tenant_id, &member(carol.id, MemberRole::Operator, t.now()))
        .await
        .unwrap();
    t.store
        .user_update(
            carol.id,
            &fleet_core::UserChanges {
                preferred_namespace: Some(Some(ns.tenant_id.clone())),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    t.store
        .namespace_remove_member(&ns.tenant_id, carol.id)
        .await
        .unwrap();

    let carol = t
        .store
        .user_resolve(&fleet_storage::UserResolver::Id(carol.id), &[])
        .await
        .unwrap();
    assert_eq!(carol.preferred_namespace, None);
}

#[tokio::test]
async fn test_duplicate_member_is_a_conflict() {
    let t = TestStore::new().await;
    let (owner, ns) = t.seed_namespace("acme").await;
    let result = t
        .store
        .namespace_add_member(&ns.tenant_id, &member(owner.id, MemberRole::Operator, t.now()))
        .await;
    assert_conflict(&result, &["user_id"]);
}
