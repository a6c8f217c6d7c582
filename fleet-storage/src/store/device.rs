//! Device operations.
//!
//! `online` is computed by the read pipeline from `last_seen` and
//! `disconnected_at` and `namespace` is joined from the namespaces
//! collection; neither is ever written. Status transitions adjust the
//! namespace counters in the same transaction as the status write.

use super::{
    count_matching, delete_collecting, delete_where, find_one, insert_document, tenant_scope,
    timestamp_value, Store,
};
use crate::cache::CacheAside;
use crate::cascade::Cascade;
use crate::document::{from_document, to_document, to_value};
use crate::engine::{
    Collection, Computed, Document, Executor, Expr, SortKey, SortOrder, Stage, TxnOptions,
    UpdateSpec,
};
use crate::presence::{counter_transition, online_stage, refresh_online};
use crate::query::{Query, QueryOption};
use crate::resolver::DeviceResolver;
use fleet_core::{
    ConnectedDevice, Device, DeviceChanges, DeviceStatus, EntityType, FleetError, FleetResult,
    TenantId, Timestamp, ValidationError,
};
use serde_json::Value;

/// Fields computed at read time.
const DERIVED_FIELDS: &[&str] = &["online", "namespace"];

impl Store {
    fn device_query(&self) -> Query {
        Query::new()
            .derive(online_stage(self.now(), self.config.online_window_chrono()))
            .default_sort(SortKey::new("last_seen", SortOrder::Desc))
            .tiebreak("uid")
            .join(Stage::Lookup {
                from: Collection::Namespaces,
                local_field: "tenant_id".to_string(),
                foreign_field: "tenant_id".to_string(),
                as_field: "namespace_docs".to_string(),
            })
            .join(Stage::Set {
                field: "namespace".to_string(),
                value: Computed::FirstOf {
                    array: "namespace_docs".to_string(),
                    sub_field: "name".to_string(),
                },
            })
            .join(Stage::Unset(vec!["namespace_docs".to_string()]))
    }

    /// List devices with `online` computed against the store clock.
    pub async fn device_list(&self, options: &[QueryOption]) -> FleetResult<(Vec<Device>, u64)> {
        self.list_with(Collection::Devices, self.device_query(), options)
            .await
    }

    pub async fn device_resolve(
        &self,
        resolver: &DeviceResolver,
        options: &[QueryOption],
    ) -> FleetResult<Device> {
        self.resolve_with(Collection::Devices, self.device_query(), resolver, options)
            .await
    }

    /// Cache-aside read by UID. `online` is recomputed on every call and
    /// `namespace` is taken from the namespace cache entry, which every
    /// namespace write invalidates.
    pub async fn device_get_cached(&self, uid: &str) -> FleetResult<Device> {
        let key = CacheAside::key_for::<Device>(uid);
        let resolver = DeviceResolver::Uid(uid.to_string());
        let mut device: Device = self
            .cache
            .get_or_load(&key, self.config.cache_ttl, || {
                self.device_resolve(&resolver, &[])
            })
            .await?;
        refresh_online(&mut device, self.now(), self.config.online_window_chrono());
        device.namespace = match self.namespace_get_cached(&device.tenant_id).await {
            Ok(namespace) => namespace.name,
            Err(e) if e.is_not_found() => String::new(),
            Err(e) => return Err(e),
        };
        Ok(device)
    }

    /// Insert a device and count it in its namespace.
    pub async fn device_create(&self, device: &Device) -> FleetResult<()> {
        let doc = to_document(EntityType::Device, device, DERIVED_FIELDS)?;
        let tenant = device.tenant_id.clone();
        let status = device.status;

        self.cascade("create device", TxnOptions::default(), move |c| {
            Box::pin(create_device_steps(c, doc, tenant, status))
        })
        .await?;

        self.invalidate_namespace(&device.tenant_id).await;
        tracing::debug!(uid = %device.uid, tenant_id = %device.tenant_id, "Device created");
        Ok(())
    }

    pub async fn device_update(
        &self,
        tenant_id: &str,
        uid: &str,
        changes: &DeviceChanges,
    ) -> FleetResult<()> {
        let mut update = UpdateSpec::new();
        if let Some(name) = &changes.name {
            update = update.set("name", name.as_str());
        }
        if let Some(public_url) = changes.public_url {
            update = update.set("public_url", public_url);
        }
        if let Some(tags) = &changes.tags {
            for tag in tags {
                validate_tag(tag)?;
            }
            update = update.set("tags", tags.clone());
        }
        if let Some(info) = &changes.info {
            update = update.set("info", to_value(EntityType::Device, info)?);
        }
        if let Some(remote_addr) = &changes.remote_addr {
            update = update.set("remote_addr", remote_addr.clone());
        }

        self.device_write(tenant_id, uid, &update).await
    }

    /// Move a device to `status`, adjusting namespace counters atomically.
    /// Accepting a device fails when its namespace is at `max_devices`.
    pub async fn device_update_status(
        &self,
        tenant_id: &str,
        uid: &str,
        status: DeviceStatus,
    ) -> FleetResult<()> {
        let tenant: TenantId = tenant_id.to_string();
        let device_uid = uid.to_string();
        let now = self.now();

        self.cascade("update device status", TxnOptions::default(), move |c| {
            Box::pin(update_status_steps(c, tenant, device_uid, status, now))
        })
        .await?;

        self.invalidate_device(tenant_id, uid).await;
        Ok(())
    }

    /// Heartbeat: refresh `last_seen`, clear `disconnected_at` and keep the
    /// connected-device marker current.
    pub async fn device_touch(&self, tenant_id: &str, uid: &str) -> FleetResult<()> {
        let tenant: TenantId = tenant_id.to_string();
        let device_uid = uid.to_string();
        let now = self.now();

        self.cascade("touch device", TxnOptions::default(), move |c| {
            Box::pin(touch_steps(c, tenant, device_uid, now))
        })
        .await?;

        self.cache
            .invalidate(&CacheAside::key_for::<Device>(uid))
            .await;
        Ok(())
    }

    /// Record a disconnect. The device reads as offline from now on.
    pub async fn device_mark_disconnected(&self, tenant_id: &str, uid: &str) -> FleetResult<()> {
        let tenant: TenantId = tenant_id.to_string();
        let device_uid = uid.to_string();
        let now = self.now();

        self.cascade("disconnect device", TxnOptions::default(), move |c| {
            Box::pin(disconnect_steps(c, tenant, device_uid, now))
        })
        .await?;

        self.cache
            .invalidate(&CacheAside::key_for::<Device>(uid))
            .await;
        Ok(())
    }

    /// Delete a device with its sessions, tunnels and connected marker.
    /// Deleting a missing device is `NotFound`.
    pub async fn device_delete(&self, tenant_id: &str, uid: &str) -> FleetResult<()> {
        let tenant: TenantId = tenant_id.to_string();
        let device_uid = uid.to_string();

        self.cascade("delete device", TxnOptions::default(), move |c| {
            Box::pin(delete_device_steps(c, tenant, device_uid))
        })
        .await?;

        self.invalidate_device(tenant_id, uid).await;
        tracing::debug!(uid, tenant_id, "Device deleted");
        Ok(())
    }

    pub async fn device_push_tag(&self, tenant_id: &str, uid: &str, tag: &str) -> FleetResult<()> {
        validate_tag(tag)?;
        self.device_write(tenant_id, uid, &UpdateSpec::new().add_to_set("tags", tag))
            .await
    }

    pub async fn device_pull_tag(&self, tenant_id: &str, uid: &str, tag: &str) -> FleetResult<()> {
        self.device_write(tenant_id, uid, &UpdateSpec::new().pull("tags", tag))
            .await
    }

    /// Apply a direct update to one device, invalidating its cache entry.
    async fn device_write(
        &self,
        tenant_id: &str,
        uid: &str,
        update: &UpdateSpec,
    ) -> FleetResult<()> {
        self.update_existing(Collection::Devices, &device_filter(tenant_id, uid), update, uid)
            .await?;
        self.cache
            .invalidate(&CacheAside::key_for::<Device>(uid))
            .await;
        Ok(())
    }

    async fn invalidate_device(&self, tenant_id: &str, uid: &str) {
        self.cache
            .invalidate(&CacheAside::key_for::<Device>(uid))
            .await;
        self.invalidate_namespace(tenant_id).await;
    }
}

// ============================================================================
// CASCADE BODIES
// ============================================================================

fn device_filter(tenant_id: &str, uid: &str) -> Expr {
    Expr::and([tenant_scope(tenant_id), Expr::eq("uid", uid)])
}

const MAX_TAG_LEN: usize = 255;

pub(super) fn validate_tag(tag: &str) -> FleetResult<()> {
    let reason = if tag.trim().is_empty() {
        "tags cannot be empty".to_string()
    } else if tag.chars().count() > MAX_TAG_LEN {
        format!("tags are at most {} characters", MAX_TAG_LEN)
    } else {
        return Ok(());
    };
    Err(ValidationError::InvalidValue {
        field: "tag".to_string(),
        reason,
    }
    .into())
}

/// Apply a counter adjustment to a namespace.
pub(super) async fn adjust_counters(
    exec: &dyn Executor,
    tenant: &str,
    update: UpdateSpec,
) -> FleetResult<()> {
    let outcome = exec
        .update_one(Collection::Namespaces, &tenant_scope(tenant), &update)
        .await?;
    if outcome.matched == 0 {
        return Err(FleetError::not_found(EntityType::Namespace, tenant));
    }
    Ok(())
}

async fn load_device(exec: &dyn Executor, tenant: &str, uid: &str) -> FleetResult<Device> {
    match find_one(exec, Collection::Devices, device_filter(tenant, uid)).await? {
        Some(doc) => from_document(EntityType::Device, doc),
        None => Err(FleetError::not_found(EntityType::Device, uid)),
    }
}

async fn create_device_steps(
    c: &Cascade,
    doc: Document,
    tenant: TenantId,
    status: DeviceStatus,
) -> FleetResult<()> {
    c.step("insert device", |exec| insert_document(exec, Collection::Devices, doc))
        .await?;
    if let Some(update) = counter_transition(None, Some(status)) {
        c.step("count device", |exec| adjust_counters(exec, &tenant, update))
            .await?;
    }
    Ok(())
}

async fn update_status_steps(
    c: &Cascade,
    tenant: TenantId,
    uid: String,
    status: DeviceStatus,
    now: Timestamp,
) -> FleetResult<()> {
    let previous = c
        .step("set status", |exec| set_status(exec, &tenant, &uid, status, now))
        .await?;
    if let Some(update) = counter_transition(Some(previous), Some(status)) {
        c.step("adjust counters", |exec| adjust_counters(exec, &tenant, update))
            .await?;
    }
    Ok(())
}

/// Write the new status and return the previous one.
async fn set_status(
    exec: &dyn Executor,
    tenant: &str,
    uid: &str,
    status: DeviceStatus,
    now: Timestamp,
) -> FleetResult<DeviceStatus> {
    let device = load_device(exec, tenant, uid).await?;
    if device.status == status {
        return Ok(status);
    }

    if status == DeviceStatus::Accepted {
        let namespace = find_one(exec, Collection::Namespaces, tenant_scope(tenant))
            .await?
            .ok_or_else(|| FleetError::not_found(EntityType::Namespace, tenant))?;
        let max_devices = namespace
            .get("max_devices")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        if max_devices >= 0 {
            let accepted = count_matching(
                exec,
                Collection::Devices,
                Expr::and([tenant_scope(tenant), Expr::eq("status", "accepted")]),
            )
            .await?;
            if accepted as i64 >= max_devices {
                return Err(ValidationError::ConstraintViolation {
                    constraint: "max_devices".to_string(),
                    reason: format!("namespace already has {} accepted devices", accepted),
                }
                .into());
            }
        }
    }

    let update = UpdateSpec::new()
        .set("status", status.as_str())
        .set("status_updated_at", timestamp_value(now));
    exec.update_one(Collection::Devices, &device_filter(tenant, uid), &update)
        .await?;
    Ok(device.status)
}

async fn touch_steps(
    c: &Cascade,
    tenant: TenantId,
    uid: String,
    now: Timestamp,
) -> FleetResult<()> {
    let status = c
        .step("touch device", |exec| touch_device(exec, &tenant, &uid, now))
        .await?;
    c.step("mark connected", |exec| {
        upsert_connected(exec, &tenant, &uid, status, now)
    })
    .await
}

async fn touch_device(
    exec: &dyn Executor,
    tenant: &str,
    uid: &str,
    now: Timestamp,
) -> FleetResult<DeviceStatus> {
    let device = load_device(exec, tenant, uid).await?;
    let update = UpdateSpec::new()
        .set("last_seen", timestamp_value(now))
        .set("disconnected_at", Value::Null);
    exec.update_one(Collection::Devices, &device_filter(tenant, uid), &update)
        .await?;
    Ok(device.status)
}

async fn upsert_connected(
    exec: &dyn Executor,
    tenant: &str,
    uid: &str,
    status: DeviceStatus,
    now: Timestamp,
) -> FleetResult<()> {
    let update = UpdateSpec::new()
        .set("last_seen", timestamp_value(now))
        .set("status", status.as_str());
    let outcome = exec
        .update_one(Collection::ConnectedDevices, &device_filter(tenant, uid), &update)
        .await?;
    if outcome.matched == 0 {
        let marker = ConnectedDevice {
            uid: uid.to_string(),
            tenant_id: tenant.to_string(),
            status,
            last_seen: now,
        };
        let doc = to_document(EntityType::Device, &marker, &[])?;
        exec.insert_one(Collection::ConnectedDevices, doc).await?;
    }
    Ok(())
}

async fn disconnect_steps(
    c: &Cascade,
    tenant: TenantId,
    uid: String,
    now: Timestamp,
) -> FleetResult<()> {
    c.step("mark disconnected", |exec| mark_disconnected(exec, &tenant, &uid, now))
        .await?;
    c.step("drop connected marker", |exec| {
        delete_where(exec, Collection::ConnectedDevices, device_filter(&tenant, &uid))
    })
    .await?;
    Ok(())
}

async fn mark_disconnected(
    exec: &dyn Executor,
    tenant: &str,
    uid: &str,
    now: Timestamp,
) -> FleetResult<()> {
    let outcome = exec
        .update_one(
            Collection::Devices,
            &device_filter(tenant, uid),
            &UpdateSpec::new().set("disconnected_at", timestamp_value(now)),
        )
        .await?;
    if outcome.matched == 0 {
        return Err(FleetError::not_found(EntityType::Device, uid));
    }
    Ok(())
}

async fn delete_device_steps(c: &Cascade, tenant: TenantId, uid: String) -> FleetResult<()> {
    let tenant = tenant.as_str();
    let uid = uid.as_str();

    let status = c
        .step("delete device", |exec| delete_device_document(exec, tenant, uid))
        .await?;

    let sessions = c
        .step("delete sessions", |exec| {
            delete_collecting(
                exec,
                Collection::Sessions,
                Expr::and([tenant_scope(tenant), Expr::eq("device_uid", uid)]),
                "uid",
            )
        })
        .await?;

    if !sessions.is_empty() {
        let session_uids: Vec<Value> = sessions.into_iter().map(Value::from).collect();
        c.step("delete active sessions", |exec| {
            delete_where(
                exec,
                Collection::ActiveSessions,
                Expr::and([
                    tenant_scope(tenant),
                    Expr::In("uid".to_string(), session_uids.clone()),
                ]),
            )
        })
        .await?;
        c.step("delete recorded sessions", |exec| {
            delete_where(
                exec,
                Collection::RecordedSessions,
                Expr::and([tenant_scope(tenant), Expr::In("uid".to_string(), session_uids)]),
            )
        })
        .await?;
    }

    c.step("delete tunnels", |exec| {
        delete_where(
            exec,
            Collection::Tunnels,
            Expr::and([tenant_scope(tenant), Expr::eq("device_uid", uid)]),
        )
    })
    .await?;

    c.step("drop connected marker", |exec| {
        delete_where(exec, Collection::ConnectedDevices, device_filter(tenant, uid))
    })
    .await?;

    if let Some(update) = counter_transition(Some(status), None) {
        c.step("uncount device", |exec| adjust_counters(exec, tenant, update))
            .await?;
    }
    Ok(())
}

async fn delete_device_document(
    exec: &dyn Executor,
    tenant: &str,
    uid: &str,
) -> FleetResult<DeviceStatus> {
    let device = load_device(exec, tenant, uid).await?;
    exec.delete_one(Collection::Devices, &device_filter(tenant, uid))
        .await?;
    Ok(device.status)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::engine::Operation;
    use crate::resolver::NamespaceResolver;
    use chrono::Duration;
    use fleet_core::new_entity_id;

    #[tokio::test]
    async fn test_create_counts_device_and_joins_namespace() {
        let (store, _, _) = test_store().await;
        let ns = seeded_namespace(&store, "acme").await;
        let device = device(&ns.tenant_id, "web-01", &store);
        store.device_create(&device).await.unwrap();

        let found = store
            .device_resolve(&DeviceResolver::Uid(device.uid.clone()), &[])
            .await
            .unwrap();
        assert_eq!(found.namespace, "acme");
        assert!(found.online);

        let ns = store
            .namespace_resolve(&NamespaceResolver::TenantId(ns.tenant_id.clone()), &[])
            .await
            .unwrap();
        assert_eq!(ns.devices_pending_count, 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_within_tenant() {
        let (store, _, _) = test_store().await;
        let ns = seeded_namespace(&store, "acme").await;
        store
            .device_create(&device(&ns.tenant_id, "web-01", &store))
            .await
            .unwrap();

        let mut clash = Device::new(ns.tenant_id.as_str(), "web-01", "ff:ff", store.now());
        clash.uid = "other".to_string();
        let err = store.device_create(&clash).await.unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn test_status_transition_moves_counters() {
        let (store, _, _) = test_store().await;
        let ns = seeded_namespace(&store, "acme").await;
        let device = device(&ns.tenant_id, "web-01", &store);
        store.device_create(&device).await.unwrap();

        store
            .device_update_status(&ns.tenant_id, &device.uid, DeviceStatus::Accepted)
            .await
            .unwrap();

        let ns = store.namespace_get_cached(&ns.tenant_id).await.unwrap();
        assert_eq!(ns.devices_pending_count, 0);
        assert_eq!(ns.devices_accepted_count, 1);
    }

    #[tokio::test]
    async fn test_accept_beyond_max_devices_is_rejected() {
        let (store, _, _) = test_store().await;
        let mut ns = namespace("acme", new_entity_id(), &store);
        ns.max_devices = 1;
        store.namespace_create(&ns).await.unwrap();

        let first = device(&ns.tenant_id, "a", &store);
        let second = device(&ns.tenant_id, "b", &store);
        store.device_create(&first).await.unwrap();
        store.device_create(&second).await.unwrap();
        store
            .device_update_status(&ns.tenant_id, &first.uid, DeviceStatus::Accepted)
            .await
            .unwrap();

        let err = store
            .device_update_status(&ns.tenant_id, &second.uid, DeviceStatus::Accepted)
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_cached_device_recomputes_online() {
        let (store, _, clock) = test_store().await;
        let ns = seeded_namespace(&store, "acme").await;
        let device = device(&ns.tenant_id, "web-01", &store);
        store.device_create(&device).await.unwrap();

        assert!(store.device_get_cached(&device.uid).await.unwrap().online);
        clock.advance(Duration::minutes(5));
        assert!(!store.device_get_cached(&device.uid).await.unwrap().online);

        store.device_touch(&ns.tenant_id, &device.uid).await.unwrap();
        assert!(store.device_get_cached(&device.uid).await.unwrap().online);
    }

    #[tokio::test]
    async fn test_disconnect_makes_device_offline() {
        let (store, engine, _) = test_store().await;
        let ns = seeded_namespace(&store, "acme").await;
        let device = device(&ns.tenant_id, "web-01", &store);
        store.device_create(&device).await.unwrap();
        store.device_touch(&ns.tenant_id, &device.uid).await.unwrap();
        assert_eq!(engine.dump(Collection::ConnectedDevices).unwrap().len(), 1);

        store
            .device_mark_disconnected(&ns.tenant_id, &device.uid)
            .await
            .unwrap();
        let found = store
            .device_resolve(&DeviceResolver::Uid(device.uid.clone()), &[])
            .await
            .unwrap();
        assert!(!found.online);
        assert!(engine.dump(Collection::ConnectedDevices).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_device_is_not_found() {
        let (store, _, _) = test_store().await;
        let err = store.device_delete("t1", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_fault_keeps_device() {
        let (store, engine, _) = test_store().await;
        let ns = seeded_namespace(&store, "acme").await;
        let device = device(&ns.tenant_id, "web-01", &store);
        store.device_create(&device).await.unwrap();
        engine.fail_next(Collection::Tunnels, Operation::Delete);

        let err = store
            .device_delete(&ns.tenant_id, &device.uid)
            .await
            .unwrap_err();
        assert!(err.is_transaction_aborted());
        assert!(store
            .device_resolve(&DeviceResolver::Uid(device.uid.clone()), &[])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_push_and_pull_tag() {
        let (store, _, _) = test_store().await;
        let ns = seeded_namespace(&store, "acme").await;
        let device = device(&ns.tenant_id, "web-01", &store);
        store.device_create(&device).await.unwrap();

        store
            .device_push_tag(&ns.tenant_id, &device.uid, "prod")
            .await
            .unwrap();
        store
            .device_push_tag(&ns.tenant_id, &device.uid, "prod")
            .await
            .unwrap();
        let found = store.device_get_cached(&device.uid).await.unwrap();
        assert_eq!(found.tags, vec!["prod".to_string()]);

        store
            .device_pull_tag(&ns.tenant_id, &device.uid, "prod")
            .await
            .unwrap();
        let found = store.device_get_cached(&device.uid).await.unwrap();
        assert!(found.tags.is_empty());

        assert!(store
            .device_push_tag(&ns.tenant_id, &device.uid, " ")
            .await
            .unwrap_err()
            .is_validation());
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_tags() {
        let (store, _, _) = test_store().await;
        let ns = seeded_namespace(&store, "acme").await;
        let device = device(&ns.tenant_id, "web-01", &store);
        store.device_create(&device).await.unwrap();

        for bad in [String::new(), "x".repeat(MAX_TAG_LEN + 1)] {
            let changes = DeviceChanges {
                tags: Some(vec!["prod".to_string(), bad]),
                ..Default::default()
            };
            let err = store
                .device_update(&ns.tenant_id, &device.uid, &changes)
                .await
                .unwrap_err();
            assert!(err.is_validation());
        }
        assert!(store.device_get_cached(&device.uid).await.unwrap().tags.is_empty());

        let changes = DeviceChanges {
            tags: Some(vec!["prod".to_string()]),
            ..Default::default()
        };
        store
            .device_update(&ns.tenant_id, &device.uid, &changes)
            .await
            .unwrap();
        let found = store.device_get_cached(&device.uid).await.unwrap();
        assert_eq!(found.tags, vec!["prod".to_string()]);
    }
}
