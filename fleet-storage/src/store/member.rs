//! Namespace membership.
//!
//! Members live inside the namespace document. Every write here
//! invalidates the namespace cache entry before returning.

use super::{find_one, tenant_scope, update_where, Store};
use crate::cache::CacheAside;
use crate::cascade::Cascade;
use crate::document::{from_document, to_value};
use crate::engine::{Collection, Executor, Expr, TxnOptions, UpdateSpec};
use fleet_core::{
    EntityType, FleetError, FleetResult, Member, MemberChanges, MemberRole, Namespace,
    StorageError, TenantId, UserId, ValidationError,
};
use serde_json::Value;

impl Store {
    /// Add a member. Adding an existing member is a `Conflict` on
    /// `user_id`; the owner role cannot be granted this way.
    pub async fn namespace_add_member(&self, tenant_id: &str, member: &Member) -> FleetResult<()> {
        if member.role == MemberRole::Owner {
            return Err(owner_violation("a namespace has exactly one owner"));
        }

        let filter = Expr::and([
            tenant_scope(tenant_id),
            Expr::not(Expr::eq("members.user_id", member.user_id.to_string())),
        ]);
        let update = UpdateSpec::new().push("members", to_value(EntityType::Member, member)?);
        let outcome = self
            .executor()
            .update_one(Collection::Namespaces, &filter, &update)
            .await?;

        if outcome.matched == 0 {
            let exists = find_one(self.executor(), Collection::Namespaces, tenant_scope(tenant_id))
                .await?
                .is_some();
            if exists {
                return Err(StorageError::Conflict {
                    entity_type: EntityType::Member,
                    fields: vec!["user_id".to_string()],
                }
                .into());
            }
            return Err(FleetError::not_found(EntityType::Namespace, tenant_id));
        }

        self.invalidate_namespace(tenant_id).await;
        tracing::debug!(tenant_id, user_id = %member.user_id, role = %member.role, "Member added");
        Ok(())
    }

    /// Change a member's role, status or expiry. The owner keeps its role
    /// and nobody else can be promoted to owner.
    pub async fn namespace_update_member(
        &self,
        tenant_id: &str,
        user_id: UserId,
        changes: &MemberChanges,
    ) -> FleetResult<()> {
        let tenant: TenantId = tenant_id.to_string();
        let changes = changes.clone();

        self.cascade("update member", TxnOptions::default(), move |c| {
            Box::pin(update_member_steps(c, tenant, user_id, changes))
        })
        .await?;

        self.invalidate_namespace(tenant_id).await;
        Ok(())
    }

    /// Remove a member and clear their preferred namespace if it pointed
    /// here. The owner cannot be removed.
    pub async fn namespace_remove_member(
        &self,
        tenant_id: &str,
        user_id: UserId,
    ) -> FleetResult<()> {
        let tenant: TenantId = tenant_id.to_string();

        self.cascade("remove member", TxnOptions::default(), move |c| {
            Box::pin(remove_member_steps(c, tenant, user_id))
        })
        .await?;

        self.invalidate_namespace(tenant_id).await;
        tracing::debug!(tenant_id, %user_id, "Member removed");
        Ok(())
    }

    pub(crate) async fn invalidate_namespace(&self, tenant_id: &str) {
        self.cache
            .invalidate(&CacheAside::key_for::<Namespace>(tenant_id))
            .await;
    }
}

fn owner_violation(reason: &str) -> FleetError {
    ValidationError::ConstraintViolation {
        constraint: "owner".to_string(),
        reason: reason.to_string(),
    }
    .into()
}

async fn load_namespace(exec: &dyn Executor, tenant: &str) -> FleetResult<Namespace> {
    match find_one(exec, Collection::Namespaces, tenant_scope(tenant)).await? {
        Some(doc) => from_document(EntityType::Namespace, doc),
        None => Err(FleetError::not_found(EntityType::Namespace, tenant)),
    }
}

async fn update_member_steps(
    c: &Cascade,
    tenant: TenantId,
    user_id: UserId,
    changes: MemberChanges,
) -> FleetResult<()> {
    c.step("update member", |exec| {
        rewrite_member(exec, &tenant, user_id, &changes)
    })
    .await
}

async fn rewrite_member(
    exec: &dyn Executor,
    tenant: &str,
    user_id: UserId,
    changes: &MemberChanges,
) -> FleetResult<()> {
    let mut namespace = load_namespace(exec, tenant).await?;
    let member = namespace
        .members
        .iter_mut()
        .find(|m| m.user_id == user_id)
        .ok_or_else(|| FleetError::not_found(EntityType::Member, user_id.to_string()))?;

    if let Some(role) = changes.role {
        if member.role == MemberRole::Owner && role != MemberRole::Owner {
            return Err(owner_violation("the owner cannot be demoted"));
        }
        if member.role != MemberRole::Owner && role == MemberRole::Owner {
            return Err(owner_violation("a namespace has exactly one owner"));
        }
        member.role = role;
    }
    if let Some(status) = changes.status {
        member.status = status;
    }
    if let Some(expires_at) = changes.expires_at {
        member.expires_at = expires_at;
    }

    let members = to_value(EntityType::Member, &namespace.members)?;
    exec.update_one(
        Collection::Namespaces,
        &tenant_scope(tenant),
        &UpdateSpec::new().set("members", members),
    )
    .await?;
    Ok(())
}

async fn remove_member_steps(c: &Cascade, tenant: TenantId, user_id: UserId) -> FleetResult<()> {
    let tenant = tenant.as_str();

    c.step("pull member", |exec| pull_member(exec, tenant, user_id))
        .await?;

    c.step("clear preferred namespace", |exec| {
        update_where(
            exec,
            Collection::Users,
            Expr::and([
                Expr::eq("id", user_id.to_string()),
                Expr::eq("preferred_namespace", tenant),
            ]),
            UpdateSpec::new().set("preferred_namespace", Value::Null),
        )
    })
    .await?;
    Ok(())
}

async fn pull_member(exec: &dyn Executor, tenant: &str, user_id: UserId) -> FleetResult<()> {
    let namespace = load_namespace(exec, tenant).await?;
    match namespace.member(user_id) {
        None => return Err(FleetError::not_found(EntityType::Member, user_id.to_string())),
        Some(m) if m.role == MemberRole::Owner => {
            return Err(owner_violation("the owner cannot be removed"));
        }
        Some(_) => {}
    }

    let update = UpdateSpec::new().pull_where("members", Expr::eq("user_id", user_id.to_string()));
    exec.update_one(Collection::Namespaces, &tenant_scope(tenant), &update)
        .await?;
    Ok(())
}
