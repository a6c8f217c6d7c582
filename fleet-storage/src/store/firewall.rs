//! Firewall rules.

use super::{tenant_scope, Store};
use crate::document::{to_document, to_value};
use crate::engine::{Collection, Expr, SortKey, SortOrder, UpdateSpec};
use crate::query::{Query, QueryOption};
use crate::resolver::{FirewallRuleResolver, Resolver};
use fleet_core::{EntityType, FirewallRule, FirewallRuleChanges, FleetResult};

impl Store {
    fn firewall_rule_query(&self) -> Query {
        Query::new()
            .default_sort(SortKey::new("priority", SortOrder::Asc))
            .tiebreak("id")
    }

    /// List rules, lowest priority value first unless another sort is given.
    pub async fn firewall_rule_list(
        &self,
        options: &[QueryOption],
    ) -> FleetResult<(Vec<FirewallRule>, u64)> {
        self.list_with(Collection::FirewallRules, self.firewall_rule_query(), options)
            .await
    }

    pub async fn firewall_rule_resolve(
        &self,
        resolver: &FirewallRuleResolver,
        options: &[QueryOption],
    ) -> FleetResult<FirewallRule> {
        self.resolve_with(Collection::FirewallRules, Query::new(), resolver, options)
            .await
    }

    /// Insert a rule. Priorities are unique within a tenant.
    pub async fn firewall_rule_create(&self, rule: &FirewallRule) -> FleetResult<()> {
        let doc = to_document(EntityType::FirewallRule, rule, &[])?;
        self.executor()
            .insert_one(Collection::FirewallRules, doc)
            .await?;
        tracing::debug!(
            id = %rule.id,
            tenant_id = %rule.tenant_id,
            priority = rule.priority,
            "Firewall rule created"
        );
        Ok(())
    }

    pub async fn firewall_rule_update(
        &self,
        tenant_id: &str,
        id: &str,
        changes: &FirewallRuleChanges,
    ) -> FleetResult<()> {
        let mut update = UpdateSpec::new();
        if let Some(priority) = changes.priority {
            update = update.set("priority", priority);
        }
        if let Some(action) = changes.action {
            update = update.set("action", to_value(EntityType::FirewallRule, &action)?);
        }
        if let Some(active) = changes.active {
            update = update.set("active", active);
        }
        if let Some(source_ip) = &changes.source_ip {
            update = update.set("source_ip", source_ip.as_str());
        }
        if let Some(username) = &changes.username {
            update = update.set("username", username.as_str());
        }
        if let Some(filter) = &changes.filter {
            update = update.set("filter", to_value(EntityType::FirewallRule, filter)?);
        }

        let filter = rule_filter(tenant_id, id)?;
        self.update_existing(Collection::FirewallRules, &filter, &update, id)
            .await
    }

    pub async fn firewall_rule_delete(&self, tenant_id: &str, id: &str) -> FleetResult<()> {
        let filter = rule_filter(tenant_id, id)?;
        self.delete_existing(Collection::FirewallRules, &filter, id)
            .await
    }
}

/// Rule `id` within a tenant. A malformed id is `InvalidIdentifier`.
fn rule_filter(tenant_id: &str, id: &str) -> FleetResult<Expr> {
    let by_id = FirewallRuleResolver::Id(id.to_string()).to_expr()?;
    Ok(Expr::and([tenant_scope(tenant_id), by_id]))
}
