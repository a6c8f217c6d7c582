//! Public keys.

use super::{tenant_scope, Store};
use crate::document::{to_document, to_value};
use crate::engine::{Collection, Expr, SortKey, SortOrder, UpdateSpec};
use crate::query::{Query, QueryOption};
use crate::resolver::PublicKeyResolver;
use fleet_core::{EntityType, FleetResult, PublicKey, PublicKeyChanges};

impl Store {
    fn public_key_query(&self) -> Query {
        Query::new()
            .default_sort(SortKey::new("created_at", SortOrder::Asc))
            .tiebreak("fingerprint")
    }

    pub async fn public_key_list(
        &self,
        options: &[QueryOption],
    ) -> FleetResult<(Vec<PublicKey>, u64)> {
        self.list_with(Collection::PublicKeys, self.public_key_query(), options)
            .await
    }

    pub async fn public_key_resolve(
        &self,
        resolver: &PublicKeyResolver,
        options: &[QueryOption],
    ) -> FleetResult<PublicKey> {
        self.resolve_with(Collection::PublicKeys, Query::new(), resolver, options)
            .await
    }

    /// Insert a key. Fingerprints are unique within a tenant.
    pub async fn public_key_create(&self, key: &PublicKey) -> FleetResult<()> {
        let doc = to_document(EntityType::PublicKey, key, &[])?;
        self.executor()
            .insert_one(Collection::PublicKeys, doc)
            .await?;
        Ok(())
    }

    pub async fn public_key_update(
        &self,
        tenant_id: &str,
        fingerprint: &str,
        changes: &PublicKeyChanges,
    ) -> FleetResult<()> {
        let mut update = UpdateSpec::new();
        if let Some(name) = &changes.name {
            update = update.set("name", name.as_str());
        }
        if let Some(username) = &changes.username {
            update = update.set("username", username.as_str());
        }
        if let Some(filter) = &changes.filter {
            update = update.set("filter", to_value(EntityType::PublicKey, filter)?);
        }

        self.update_existing(
            Collection::PublicKeys,
            &key_filter(tenant_id, fingerprint),
            &update,
            fingerprint,
        )
        .await
    }

    pub async fn public_key_delete(&self, tenant_id: &str, fingerprint: &str) -> FleetResult<()> {
        self.delete_existing(
            Collection::PublicKeys,
            &key_filter(tenant_id, fingerprint),
            fingerprint,
        )
        .await
    }
}

fn key_filter(tenant_id: &str, fingerprint: &str) -> Expr {
    Expr::and([tenant_scope(tenant_id), Expr::eq("fingerprint", fingerprint)])
}
