//! Tags shared by devices, public keys and firewall rules.
//!
//! A tag is a plain string. It exists in a tenant while some record of the
//! three kinds carries it; renaming or deleting one rewrites all three kinds
//! in one cascade, scoped to the tenant.

use super::device::validate_tag;
use super::{distinct_strings, tenant_scope, update_where, Store};
use crate::cache::CacheAside;
use crate::cascade::Cascade;
use crate::engine::expr::lookup_path;
use crate::engine::{Collection, Expr, Pipeline, TxnOptions, UpdateSpec};
use fleet_core::{Device, FleetResult, TenantId};
use std::collections::BTreeSet;

/// A tag-carrying field and the cascade steps that rewrite it.
struct Tagged {
    collection: Collection,
    field: &'static str,
    rename_step: &'static str,
    remove_step: &'static str,
}

const TAGGED: &[Tagged] = &[
    Tagged {
        collection: Collection::Devices,
        field: "tags",
        rename_step: "rename tag on devices",
        remove_step: "remove tag from devices",
    },
    Tagged {
        collection: Collection::PublicKeys,
        field: "filter.tags",
        rename_step: "rename tag on public keys",
        remove_step: "remove tag from public keys",
    },
    Tagged {
        collection: Collection::FirewallRules,
        field: "filter.tags",
        rename_step: "rename tag on firewall rules",
        remove_step: "remove tag from firewall rules",
    },
];

impl Store {
    /// Distinct tags in use in a tenant, sorted.
    pub async fn tag_list(&self, tenant_id: &str) -> FleetResult<Vec<String>> {
        let mut tags = BTreeSet::new();
        for tagged in TAGGED {
            let docs = self
                .executor()
                .aggregate(tagged.collection, &Pipeline::matching(tenant_scope(tenant_id)))
                .await?;
            for doc in &docs {
                for value in lookup_path(doc, tagged.field) {
                    if let Some(tag) = value.as_str() {
                        tags.insert(tag.to_string());
                    }
                }
            }
        }
        Ok(tags.into_iter().collect())
    }

    /// Rename a tag everywhere in the tenant. Returns the number of
    /// documents modified; zero is a success.
    pub async fn tag_rename(&self, tenant_id: &str, old: &str, new: &str) -> FleetResult<u64> {
        validate_tag(new)?;
        if old == new {
            return Ok(0);
        }

        let tenant: TenantId = tenant_id.to_string();
        let (old_tag, new_tag) = (old.to_string(), new.to_string());
        let (modified, devices) = self
            .cascade("rename tag", TxnOptions::default(), move |c| {
                Box::pin(retag_steps(c, tenant, old_tag, Some(new_tag)))
            })
            .await?;

        self.invalidate_devices(&devices).await;
        tracing::info!(tenant_id, old, new, modified, "Tag renamed");
        Ok(modified)
    }

    /// Remove a tag from every record in the tenant. Returns the number of
    /// documents modified; zero is a success.
    pub async fn tag_delete(&self, tenant_id: &str, tag: &str) -> FleetResult<u64> {
        let tenant: TenantId = tenant_id.to_string();
        let old_tag = tag.to_string();
        let (modified, devices) = self
            .cascade("delete tag", TxnOptions::default(), move |c| {
                Box::pin(retag_steps(c, tenant, old_tag, None))
            })
            .await?;

        self.invalidate_devices(&devices).await;
        tracing::info!(tenant_id, tag, modified, "Tag deleted");
        Ok(modified)
    }

    async fn invalidate_devices(&self, uids: &[String]) {
        self.cache
            .invalidate_all(uids.iter().map(|uid| CacheAside::key_for::<Device>(uid.as_str())))
            .await;
    }
}

/// Replace `old` with `new` (or remove it when `new` is `None`) in every
/// tagged collection. Returns the modified count and the affected device
/// UIDs.
async fn retag_steps(
    c: &Cascade,
    tenant: TenantId,
    old: String,
    new: Option<String>,
) -> FleetResult<(u64, Vec<String>)> {
    let devices = distinct_strings(
        c.executor(),
        Collection::Devices,
        Expr::and([tenant_scope(&tenant), Expr::eq("tags", old.as_str())]),
        "uid",
    )
    .await?;

    let mut modified = 0;
    for tagged in TAGGED {
        let filter = Expr::and([tenant_scope(&tenant), Expr::eq(tagged.field, old.as_str())]);
        let (step, update) = match &new {
            Some(new) => (
                tagged.rename_step,
                UpdateSpec::new().replace_in_array(tagged.field, old.as_str(), new.as_str()),
            ),
            None => (
                tagged.remove_step,
                UpdateSpec::new().pull(tagged.field, old.as_str()),
            ),
        };
        let outcome = c
            .step(step, |exec| update_where(exec, tagged.collection, filter, update))
            .await?;
        modified += outcome.modified;
    }
    Ok((modified, devices))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::engine::Operation;
    use crate::resolver::DeviceResolver;

    async fn tag_device(store: &Store, tenant: &str, name: &str, tag: &str) -> String {
        let mut dev = device(tenant, name, store);
        dev.tags = vec![tag.to_string()];
        store.device_create(&dev).await.unwrap();
        dev.uid
    }

    #[tokio::test]
    async fn test_rename_touches_only_the_tenant() {
        let (store, _, _) = test_store().await;
        let acme = seeded_namespace(&store, "acme").await;
        let other = seeded_namespace(&store, "other").await;
        let mine = tag_device(&store, &acme.tenant_id, "a", "prod").await;
        let theirs = tag_device(&store, &other.tenant_id, "a", "prod").await;

        let modified = store
            .tag_rename(&acme.tenant_id, "prod", "production")
            .await
            .unwrap();
        assert_eq!(modified, 1);

        let mine = store.device_get_cached(&mine).await.unwrap();
        assert_eq!(mine.tags, vec!["production".to_string()]);
        let theirs = store
            .device_resolve(&DeviceResolver::Uid(theirs), &[])
            .await
            .unwrap();
        assert_eq!(theirs.tags, vec!["prod".to_string()]);
    }

    #[tokio::test]
    async fn test_rename_evicts_cached_devices() {
        let (store, _, _) = test_store().await;
        let ns = seeded_namespace(&store, "acme").await;
        let uid = tag_device(&store, &ns.tenant_id, "a", "prod").await;
        store.device_get_cached(&uid).await.unwrap();

        store.tag_rename(&ns.tenant_id, "prod", "live").await.unwrap();
        assert_eq!(
            store.device_get_cached(&uid).await.unwrap().tags,
            vec!["live".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_fault_leaves_tags_untouched() {
        let (store, engine, _) = test_store().await;
        let ns = seeded_namespace(&store, "acme").await;
        let uid = tag_device(&store, &ns.tenant_id, "a", "prod").await;
        engine.fail_next(Collection::FirewallRules, Operation::Update);

        let err = store.tag_delete(&ns.tenant_id, "prod").await.unwrap_err();
        assert!(err.is_transaction_aborted());
        let dev = store
            .device_resolve(&DeviceResolver::Uid(uid), &[])
            .await
            .unwrap();
        assert_eq!(dev.tags, vec!["prod".to_string()]);
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_distinct() {
        let (store, _, _) = test_store().await;
        let ns = seeded_namespace(&store, "acme").await;
        tag_device(&store, &ns.tenant_id, "a", "web").await;
        tag_device(&store, &ns.tenant_id, "b", "db").await;
        tag_device(&store, &ns.tenant_id, "c", "web").await;

        assert_eq!(
            store.tag_list(&ns.tenant_id).await.unwrap(),
            vec!["db".to_string(), "web".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rename_to_empty_is_rejected() {
        let (store, _, _) = test_store().await;
        assert!(store
            .tag_rename("t1", "prod", "")
            .await
            .unwrap_err()
            .is_validation());
        assert_eq!(store.tag_rename("t1", "prod", "prod").await.unwrap(), 0);
    }
}
