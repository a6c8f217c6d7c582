//! Users.
//!
//! `namespaces_owned` is never stored. Reads join the namespaces a user
//! owns and report their count, so deleting a namespace lowers it without
//! touching the user document.

use super::{count_matching, distinct_strings, timestamp_value, update_where, Store};
use crate::cascade::Cascade;
use crate::conflict::{check_conflicts, UserCandidate};
use crate::document::to_document;
use crate::engine::{
    Collection, Computed, Executor, Expr, SortKey, SortOrder, Stage, TxnOptions, UpdateSpec,
};
use crate::query::{Query, QueryOption};
use crate::resolver::UserResolver;
use fleet_core::{
    EntityType, FleetError, FleetResult, StorageError, User, UserChanges, UserId, ValidationError,
};

const OWNED: &str = "owned_namespaces";

impl Store {
    fn user_query(&self) -> Query {
        Query::new()
            .default_sort(SortKey::new("created_at", SortOrder::Asc))
            .tiebreak("id")
            .join(Stage::Lookup {
                from: Collection::Namespaces,
                local_field: "id".to_string(),
                foreign_field: "owner".to_string(),
                as_field: OWNED.to_string(),
            })
            .join(Stage::Set {
                field: "namespaces_owned".to_string(),
                value: Computed::Size(OWNED.to_string()),
            })
            .join(Stage::Unset(vec![OWNED.to_string()]))
    }

    pub async fn user_list(&self, options: &[QueryOption]) -> FleetResult<(Vec<User>, u64)> {
        self.list_with(Collection::Users, self.user_query(), options)
            .await
    }

    pub async fn user_resolve(
        &self,
        resolver: &UserResolver,
        options: &[QueryOption],
    ) -> FleetResult<User> {
        self.resolve_with(Collection::Users, self.user_query(), resolver, options)
            .await
    }

    /// Which of `candidate`'s email and username already belong to a user.
    pub async fn user_conflicts(
        &self,
        candidate: &UserCandidate,
    ) -> FleetResult<(Vec<String>, bool)> {
        check_conflicts(self.executor(), Collection::Users, Expr::True, candidate).await
    }

    /// Insert a user. A taken email or username is a `Conflict` naming the
    /// taken fields.
    pub async fn user_create(&self, user: &User) -> FleetResult<()> {
        let candidate = UserCandidate {
            email: Some(user.email.clone()),
            username: Some(user.username.clone()),
        };
        let (fields, taken) = self.user_conflicts(&candidate).await?;
        if taken {
            return Err(conflict(fields));
        }

        let doc = to_document(EntityType::User, user, &["namespaces_owned"])?;
        self.executor().insert_one(Collection::Users, doc).await?;
        tracing::debug!(id = %user.id, username = %user.username, "User created");
        Ok(())
    }

    pub async fn user_update(&self, id: UserId, changes: &UserChanges) -> FleetResult<()> {
        let candidate = UserCandidate {
            email: changes.email.clone(),
            username: changes.username.clone(),
        };
        let (fields, taken) = check_conflicts(
            self.executor(),
            Collection::Users,
            Expr::ne("id", id.to_string()),
            &candidate,
        )
        .await?;
        if taken {
            return Err(conflict(fields));
        }

        let mut update = UpdateSpec::new();
        if let Some(name) = &changes.name {
            update = update.set("name", name.as_str());
        }
        if let Some(username) = &changes.username {
            update = update.set("username", username.as_str());
        }
        if let Some(email) = &changes.email {
            update = update.set("email", email.as_str());
        }
        if let Some(digest) = &changes.password_digest {
            update = update.set("password_digest", digest.as_str());
        }
        if let Some(last_login) = changes.last_login {
            update = update.set("last_login", timestamp_value(last_login));
        }
        if let Some(preferred) = &changes.preferred_namespace {
            update = update.set("preferred_namespace", preferred.clone());
        }
        if let Some(max_namespaces) = changes.max_namespaces {
            update = update.set("max_namespaces", max_namespaces);
        }

        let id = id.to_string();
        self.update_existing(Collection::Users, &Expr::eq("id", id.as_str()), &update, &id)
            .await
    }

    /// Delete a user and their memberships. A user who still owns a
    /// namespace cannot be deleted.
    pub async fn user_delete(&self, id: UserId) -> FleetResult<()> {
        let tenants = self
            .cascade("delete user", TxnOptions::default(), move |c| {
                Box::pin(delete_user_steps(c, id))
            })
            .await?;

        for tenant_id in &tenants {
            self.invalidate_namespace(tenant_id).await;
        }
        tracing::debug!(%id, memberships = tenants.len(), "User deleted");
        Ok(())
    }
}

fn conflict(fields: Vec<String>) -> FleetError {
    StorageError::Conflict {
        entity_type: EntityType::User,
        fields,
    }
    .into()
}

async fn delete_user_steps(c: &Cascade, id: UserId) -> FleetResult<Vec<String>> {
    let id = id.to_string();
    let id = id.as_str();

    c.step("delete user", |exec| delete_user_document(exec, id))
        .await?;

    let tenants = distinct_strings(
        c.executor(),
        Collection::Namespaces,
        Expr::eq("members.user_id", id),
        "tenant_id",
    )
    .await?;

    c.step("leave namespaces", |exec| {
        update_where(
            exec,
            Collection::Namespaces,
            Expr::eq("members.user_id", id),
            UpdateSpec::new().pull_where("members", Expr::eq("user_id", id)),
        )
    })
    .await?;

    Ok(tenants)
}

async fn delete_user_document(exec: &dyn Executor, id: &str) -> FleetResult<()> {
    let owned = count_matching(exec, Collection::Namespaces, Expr::eq("owner", id)).await?;
    if owned > 0 {
        return Err(ValidationError::ConstraintViolation {
            constraint: "owner".to_string(),
            reason: format!("user still owns {} namespaces", owned),
        }
        .into());
    }

    let deleted = exec.delete_one(Collection::Users, &Expr::eq("id", id)).await?;
    if deleted == 0 {
        return Err(FleetError::not_found(EntityType::User, id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use fleet_core::{Member, MemberRole, MemberStatus};

    fn bob(store: &Store) -> User {
        User::new("Bob", "bob", "a@x.com", store.now())
    }

    #[tokio::test]
    async fn test_create_reports_taken_fields() {
        let (store, _, _) = test_store().await;
        store.user_create(&bob(&store)).await.unwrap();

        let carol = User::new("Carol", "carol", "a@x.com", store.now());
        let err = store.user_create(&carol).await.unwrap_err();
        match err {
            FleetError::Storage(StorageError::Conflict { fields, .. }) => {
                assert_eq!(fields, vec!["email".to_string()]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_namespaces_owned_is_derived() {
        let (store, _, _) = test_store().await;
        let user = bob(&store);
        store.user_create(&user).await.unwrap();
        let a = namespace("a", user.id, &store);
        store.namespace_create(&a).await.unwrap();
        store
            .namespace_create(&namespace("b", user.id, &store))
            .await
            .unwrap();

        let by_email = UserResolver::Email("a@x.com".into());
        assert_eq!(store.user_resolve(&by_email, &[]).await.unwrap().namespaces_owned, 2);

        store.namespace_delete(&a.tenant_id).await.unwrap();
        assert_eq!(store.user_resolve(&by_email, &[]).await.unwrap().namespaces_owned, 1);

        let (users, total) = store.user_list(&[]).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(users[0].namespaces_owned, 1);
    }

    #[tokio::test]
    async fn test_update_rejects_taken_username_but_not_own() {
        let (store, _, _) = test_store().await;
        let user = bob(&store);
        store.user_create(&user).await.unwrap();
        store
            .user_create(&User::new("Carol", "carol", "c@x.com", store.now()))
            .await
            .unwrap();

        let keep = UserChanges {
            username: Some("bob".to_string()),
            name: Some("Robert".to_string()),
            ..Default::default()
        };
        store.user_update(user.id, &keep).await.unwrap();

        let steal = UserChanges {
            username: Some("carol".to_string()),
            ..Default::default()
        };
        assert!(store.user_update(user.id, &steal).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_owner_cannot_be_deleted_but_member_can() {
        let (store, _, _) = test_store().await;
        let owner = bob(&store);
        let member = User::new("Carol", "carol", "c@x.com", store.now());
        store.user_create(&owner).await.unwrap();
        store.user_create(&member).await.unwrap();
        let ns = namespace("acme", owner.id, &store);
        store.namespace_create(&ns).await.unwrap();
        store
            .namespace_add_member(
                &ns.tenant_id,
                &Member {
                    user_id: member.id,
                    role: MemberRole::Observer,
                    added_at: store.now(),
                    expires_at: None,
                    status: MemberStatus::Accepted,
                },
            )
            .await
            .unwrap();

        assert!(store.user_delete(owner.id).await.unwrap_err().is_validation());

        store.user_delete(member.id).await.unwrap();
        let ns = store.namespace_get_cached(&ns.tenant_id).await.unwrap();
        assert!(ns.member(member.id).is_none());
        assert!(store.user_delete(member.id).await.unwrap_err().is_not_found());
    }
}
