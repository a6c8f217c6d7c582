//! API keys.
//!
//! Keys are stored by the digest of their secret. An expired key is kept
//! until deleted but no longer resolves.

use super::{tenant_scope, Store};
use crate::conflict::{check_conflicts, ApiKeyCandidate};
use crate::document::{to_document, to_value};
use crate::engine::{Collection, Expr, SortKey, SortOrder, UpdateSpec};
use crate::query::{Query, QueryOption};
use crate::resolver::{ApiKeyResolver, Resolver};
use fleet_core::{ApiKey, ApiKeyChanges, EntityType, FleetError, FleetResult};

impl Store {
    fn api_key_query(&self) -> Query {
        Query::new()
            .default_sort(SortKey::new("created_at", SortOrder::Asc))
            .tiebreak("name")
    }

    pub async fn api_key_list(&self, options: &[QueryOption]) -> FleetResult<(Vec<ApiKey>, u64)> {
        self.list_with(Collection::ApiKeys, self.api_key_query(), options)
            .await
    }

    /// Resolve a key. A key past its expiry is `NotFound`.
    pub async fn api_key_resolve(
        &self,
        resolver: &ApiKeyResolver,
        options: &[QueryOption],
    ) -> FleetResult<ApiKey> {
        let key: ApiKey = self
            .resolve_with(Collection::ApiKeys, Query::new(), resolver, options)
            .await?;
        if key.is_expired(self.now()) {
            tracing::debug!(
                name = %key.name,
                tenant_id = %key.tenant_id,
                "Expired API key rejected"
            );
            return Err(FleetError::not_found(ApiKeyResolver::ENTITY, resolver.value()));
        }
        Ok(key)
    }

    /// Which of `candidate`'s id and name already exist in the tenant.
    pub async fn api_key_conflicts(
        &self,
        tenant_id: &str,
        candidate: &ApiKeyCandidate,
    ) -> FleetResult<(Vec<String>, bool)> {
        check_conflicts(
            self.executor(),
            Collection::ApiKeys,
            tenant_scope(tenant_id),
            candidate,
        )
        .await
    }

    /// Insert a key. Names are unique within a tenant.
    pub async fn api_key_create(&self, key: &ApiKey) -> FleetResult<()> {
        let doc = to_document(EntityType::ApiKey, key, &[])?;
        self.executor().insert_one(Collection::ApiKeys, doc).await?;
        tracing::debug!(name = %key.name, tenant_id = %key.tenant_id, "API key created");
        Ok(())
    }

    pub async fn api_key_update(
        &self,
        tenant_id: &str,
        id: &str,
        changes: &ApiKeyChanges,
    ) -> FleetResult<()> {
        let mut update = UpdateSpec::new();
        if let Some(name) = &changes.name {
            update = update.set("name", name.as_str());
        }
        if let Some(role) = changes.role {
            update = update.set("role", to_value(EntityType::ApiKey, &role)?);
        }
        if let Some(expires_at) = &changes.expires_at {
            update = update.set("expires_at", to_value(EntityType::ApiKey, expires_at)?);
        }

        self.update_existing(Collection::ApiKeys, &key_filter(tenant_id, id), &update, id)
            .await
    }

    pub async fn api_key_delete(&self, tenant_id: &str, id: &str) -> FleetResult<()> {
        self.delete_existing(Collection::ApiKeys, &key_filter(tenant_id, id), id)
            .await
    }
}

fn key_filter(tenant_id: &str, id: &str) -> Expr {
    Expr::and([tenant_scope(tenant_id), Expr::eq("id", id)])
}
