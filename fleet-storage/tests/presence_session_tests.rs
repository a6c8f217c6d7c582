//! Derived presence and the session lifecycle, driven by a manual clock.

use chrono::Duration;
use fleet_core::EntityType;
use fleet_storage::{Collection, QueryOption, SessionResolver};
use fleet_test_utils::assertions::*;
use fleet_test_utils::fixtures::*;

#[tokio::test]
async fn test_online_follows_last_seen_window() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let d = t.seed_device(&ns.tenant_id, "web").await;
    assert!(t.store.device_get_cached(&d.uid).await.unwrap().online);

    t.advance(Duration::seconds(90));
    assert!(t.store.device_get_cached(&d.uid).await.unwrap().online);

    t.advance(Duration::seconds(90));
    assert!(!t.store.device_get_cached(&d.uid).await.unwrap().online);
    let (listed, _) = t
        .store
        .device_list(&[QueryOption::match_tenant(ns.tenant_id.clone())])
        .await
        .unwrap();
    assert!(!listed[0].online);

    t.store.device_touch(&ns.tenant_id, &d.uid).await.unwrap();
    assert!(t.store.device_get_cached(&d.uid).await.unwrap().online);
    assert_eq!(t.count(Collection::ConnectedDevices), 1);
}

#[tokio::test]
async fn test_disconnect_is_offline_regardless_of_last_seen() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let d = t.seed_device(&ns.tenant_id, "web").await;
    t.store.device_touch(&ns.tenant_id, &d.uid).await.unwrap();

    t.store
        .device_mark_disconnected(&ns.tenant_id, &d.uid)
        .await
        .unwrap();
    let device = t.store.device_get_cached(&d.uid).await.unwrap();
    assert!(!device.online);
    assert_eq!(device.disconnected_at, Some(t.now()));
    assert_eq!(t.count(Collection::ConnectedDevices), 0);
}

#[tokio::test]
async fn test_session_lifecycle() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let d = t.seed_device(&ns.tenant_id, "web").await;
    t.store
        .session_create(&session("s1", &d, t.now()))
        .await
        .unwrap();
    assert!(t.store.session_is_active("s1").await.unwrap());

    t.store.session_set_recorded("s1", true).await.unwrap();
    t.store
        .session_record_event("s1", &event("pty-req", 0, t.now()))
        .await
        .unwrap();
    t.store
        .session_record_event("s1", &event("pty-req", 1, t.now()))
        .await
        .unwrap();

    let s = t
        .store
        .session_resolve(&SessionResolver::Uid("s1".into()), &[])
        .await
        .unwrap();
    assert_eq!(s.events.types.len(), 1);
    assert_eq!(s.events.seats.len(), 2);
    assert_eq!(t.store.session_list_frames("s1").await.unwrap().len(), 2);

    t.store.session_close("s1").await.unwrap();
    assert!(!t.store.session_is_active("s1").await.unwrap());
    assert_not_found(
        &t.store.session_update_last_seen("s1").await,
        EntityType::Session,
    );
    let (history, total) = t.store.session_list(&[]).await.unwrap();
    assert_eq!(total, 1);
    assert!(history[0].closed);
}

#[tokio::test]
async fn test_expired_active_sessions_are_reaped() {
    let t = TestStore::new().await;
    let (_, ns) = t.seed_namespace("acme").await;
    let d = t.seed_device(&ns.tenant_id, "web").await;
    t.store
        .session_create(&session("stale", &d, t.now()))
        .await
        .unwrap();
    t.advance(Duration::minutes(10));
    t.store
        .session_create(&session("live", &d, t.now()))
        .await
        .unwrap();

    let reaped = t
        .store
        .active_session_delete_expired(t.now() - Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(reaped, 1);
    assert!(!t.store.session_is_active("stale").await.unwrap());
    assert!(t.store.session_is_active("live").await.unwrap());
    assert_eq!(t.count(Collection::Sessions), 2);
}
