//! Namespace operations.

use super::{count_matching, delete_collecting, delete_where, tenant_scope, update_where, Store};
use crate::cache::CacheAside;
use crate::cascade::Cascade;
use crate::document::to_document;
use crate::engine::{Collection, Executor, Expr, SortKey, SortOrder, TxnOptions, UpdateSpec};
use crate::presence::counter_field;
use crate::query::{Query, QueryOption};
use crate::resolver::NamespaceResolver;
use fleet_core::{
    Device, DeviceStatus, EntityType, FleetError, FleetResult, Namespace, NamespaceChanges,
    TenantId, UserId, ValidationError,
};
use serde_json::Value;

/// Collections holding tenant-scoped records removed with their namespace.
const TENANT_COLLECTIONS: &[(Collection, &str)] = &[
    (Collection::Sessions, "delete sessions"),
    (Collection::ActiveSessions, "delete active sessions"),
    (Collection::ConnectedDevices, "delete connected devices"),
    (Collection::FirewallRules, "delete firewall rules"),
    (Collection::PublicKeys, "delete public keys"),
    (Collection::ApiKeys, "delete api keys"),
    (Collection::RecordedSessions, "delete recorded sessions"),
    (Collection::Tunnels, "delete tunnels"),
];

impl Store {
    fn namespace_query(&self) -> Query {
        Query::new()
            .default_sort(SortKey::new("created_at", SortOrder::Asc))
            .tiebreak("tenant_id")
    }

    /// List namespaces. The count ignores pagination.
    pub async fn namespace_list(
        &self,
        options: &[QueryOption],
    ) -> FleetResult<(Vec<Namespace>, u64)> {
        self.list_with(Collection::Namespaces, self.namespace_query(), options)
            .await
    }

    /// List the namespaces a user is a member of.
    pub async fn namespace_list_for_user(
        &self,
        user_id: UserId,
        options: &[QueryOption],
    ) -> FleetResult<(Vec<Namespace>, u64)> {
        let query = self
            .namespace_query()
            .scoped(Expr::eq("members.user_id", user_id.to_string()));
        self.list_with(Collection::Namespaces, query, options).await
    }

    pub async fn namespace_resolve(
        &self,
        resolver: &NamespaceResolver,
        options: &[QueryOption],
    ) -> FleetResult<Namespace> {
        self.resolve_with(Collection::Namespaces, Query::new(), resolver, options)
            .await
    }

    /// Cache-aside read of a namespace by tenant id.
    pub async fn namespace_get_cached(&self, tenant_id: &str) -> FleetResult<Namespace> {
        let key = CacheAside::key_for::<Namespace>(tenant_id);
        let resolver = NamespaceResolver::TenantId(tenant_id.to_string());
        self.cache
            .get_or_load(&key, self.config.cache_ttl, || {
                self.namespace_resolve(&resolver, &[])
            })
            .await
    }

    /// Insert a namespace. Its owner must be its only owner-role member.
    pub async fn namespace_create(&self, namespace: &Namespace) -> FleetResult<()> {
        if !namespace.has_consistent_owner() {
            return Err(ValidationError::ConstraintViolation {
                constraint: "owner".to_string(),
                reason: "namespace needs exactly one owner member matching its owner".to_string(),
            }
            .into());
        }

        let doc = to_document(EntityType::Namespace, namespace, &[])?;
        self.executor()
            .insert_one(Collection::Namespaces, doc)
            .await?;

        tracing::debug!(
            tenant_id = %namespace.tenant_id,
            name = %namespace.name,
            "Namespace created"
        );
        Ok(())
    }

    pub async fn namespace_update(
        &self,
        tenant_id: &str,
        changes: &NamespaceChanges,
    ) -> FleetResult<()> {
        let mut update = UpdateSpec::new();
        if let Some(name) = &changes.name {
            update = update.set("name", name.as_str());
        }
        if let Some(max_devices) = changes.max_devices {
            update = update.set("max_devices", max_devices);
        }
        if let Some(session_record) = changes.session_record {
            update = update.set("settings.session_record", session_record);
        }

        self.update_existing(Collection::Namespaces, &tenant_scope(tenant_id), &update, tenant_id)
            .await?;
        self.invalidate_namespace(tenant_id).await;
        Ok(())
    }

    /// Delete a namespace and everything scoped to its tenant, atomically.
    ///
    /// Owned-namespace counts are derived from the namespaces collection,
    /// so removing the namespace document is what decrements the owner's.
    pub async fn namespace_delete(&self, tenant_id: &str) -> FleetResult<()> {
        let tenant: TenantId = tenant_id.to_string();
        let devices = self
            .cascade("delete namespace", TxnOptions::default(), move |c| {
                Box::pin(delete_namespace_steps(c, tenant))
            })
            .await?;

        self.invalidate_namespace(tenant_id).await;
        self.cache
            .invalidate_all(devices.iter().map(|uid| CacheAside::key_for::<Device>(uid.as_str())))
            .await;

        tracing::info!(tenant_id, devices = devices.len(), "Namespace deleted");
        Ok(())
    }

    /// Recompute the denormalized device counters from the devices
    /// collection.
    pub async fn namespace_sync_device_counts(&self, tenant_id: &str) -> FleetResult<()> {
        let tenant: TenantId = tenant_id.to_string();
        let counts = self
            .cascade("sync device counts", TxnOptions::default(), move |c| {
                Box::pin(async move {
                    c.step("recount devices", |exec| sync_counts(exec, tenant)).await
                })
            })
            .await?;

        self.invalidate_namespace(tenant_id).await;

        tracing::info!(
            tenant_id,
            accepted = counts[0],
            pending = counts[1],
            rejected = counts[2],
            removed = counts[3],
            "Device counters repaired"
        );
        Ok(())
    }
}

async fn delete_namespace_steps(c: &Cascade, tenant: TenantId) -> FleetResult<Vec<String>> {
    let tenant = tenant.as_str();

    c.step("delete namespace", |exec| delete_namespace_document(exec, tenant))
        .await?;

    let devices = c
        .step("delete devices", |exec| {
            delete_collecting(exec, Collection::Devices, tenant_scope(tenant), "uid")
        })
        .await?;

    for (collection, step) in TENANT_COLLECTIONS {
        c.step(*step, |exec| delete_where(exec, *collection, tenant_scope(tenant)))
            .await?;
    }

    c.step("clear preferred namespace", |exec| {
        update_where(
            exec,
            Collection::Users,
            Expr::eq("preferred_namespace", tenant),
            UpdateSpec::new().set("preferred_namespace", Value::Null),
        )
    })
    .await?;

    Ok(devices)
}

async fn delete_namespace_document(exec: &dyn Executor, tenant: &str) -> FleetResult<()> {
    let deleted = exec
        .delete_one(Collection::Namespaces, &tenant_scope(tenant))
        .await?;
    if deleted == 0 {
        return Err(FleetError::not_found(EntityType::Namespace, tenant));
    }
    Ok(())
}

async fn sync_counts(exec: &dyn Executor, tenant: TenantId) -> FleetResult<[i64; 4]> {
    let statuses = [
        DeviceStatus::Accepted,
        DeviceStatus::Pending,
        DeviceStatus::Rejected,
        DeviceStatus::Removed,
    ];
    let mut counts = [0i64; 4];
    let mut update = UpdateSpec::new();
    for (slot, status) in counts.iter_mut().zip(statuses) {
        let filter = Expr::and([tenant_scope(&tenant), Expr::eq("status", status.as_str())]);
        *slot = count_matching(exec, Collection::Devices, filter).await? as i64;
        update = update.set(counter_field(status), *slot);
    }

    let outcome = exec
        .update_one(Collection::Namespaces, &tenant_scope(&tenant), &update)
        .await?;
    if outcome.matched == 0 {
        return Err(FleetError::not_found(EntityType::Namespace, tenant));
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::engine::Operation;
    use fleet_core::new_entity_id;

    #[tokio::test]
    async fn test_create_and_resolve_by_name() {
        let (store, _, _) = test_store().await;
        let ns = namespace("acme", new_entity_id(), &store);
        store.namespace_create(&ns).await.unwrap();

        let found = store
            .namespace_resolve(&NamespaceResolver::Name("acme".into()), &[])
            .await
            .unwrap();
        assert_eq!(found.tenant_id, ns.tenant_id);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let (store, _, _) = test_store().await;
        store
            .namespace_create(&namespace("acme", new_entity_id(), &store))
            .await
            .unwrap();
        let err = store
            .namespace_create(&namespace("acme", new_entity_id(), &store))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn test_second_owner_is_a_validation_error() {
        let (store, _, _) = test_store().await;
        let mut ns = namespace("acme", new_entity_id(), &store);
        let mut extra = ns.members[0].clone();
        extra.user_id = new_entity_id();
        ns.members.push(extra);
        let err = store.namespace_create(&ns).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_update_missing_namespace_is_not_found() {
        let (store, _, _) = test_store().await;
        let changes = NamespaceChanges {
            max_devices: Some(3),
            ..Default::default()
        };
        let err = store.namespace_update("nope", &changes).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_is_visible_through_cache() {
        let (store, _, _) = test_store().await;
        let ns = namespace("acme", new_entity_id(), &store);
        store.namespace_create(&ns).await.unwrap();
        let cached = store.namespace_get_cached(&ns.tenant_id).await.unwrap();
        assert!(!cached.settings.session_record);

        let changes = NamespaceChanges {
            session_record: Some(true),
            ..Default::default()
        };
        store.namespace_update(&ns.tenant_id, &changes).await.unwrap();

        let fresh = store.namespace_get_cached(&ns.tenant_id).await.unwrap();
        assert!(fresh.settings.session_record);
    }

    #[tokio::test]
    async fn test_delete_fault_keeps_namespace() {
        let (store, engine, _) = test_store().await;
        let ns = namespace("acme", new_entity_id(), &store);
        store.namespace_create(&ns).await.unwrap();
        engine.fail_next(Collection::Tunnels, Operation::Delete);

        let err = store.namespace_delete(&ns.tenant_id).await.unwrap_err();
        assert!(err.is_transaction_aborted());
        assert!(store
            .namespace_resolve(&NamespaceResolver::TenantId(ns.tenant_id.clone()), &[])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_delete_missing_namespace_is_not_found() {
        let (store, _, _) = test_store().await;
        let err = store.namespace_delete("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_transaction_aborted());
    }

    #[tokio::test]
    async fn test_list_for_user_only_returns_memberships() {
        let (store, _, _) = test_store().await;
        let alice = new_entity_id();
        store
            .namespace_create(&namespace("a", alice, &store))
            .await
            .unwrap();
        store
            .namespace_create(&namespace("b", new_entity_id(), &store))
            .await
            .unwrap();

        let (items, total) = store.namespace_list_for_user(alice, &[]).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].name, "a");
    }
}
