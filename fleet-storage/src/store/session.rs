//! Sessions and their active-session rows.
//!
//! A session document is history and is never physically removed by these
//! operations. Its active-session row exists exactly while the session is
//! live; closing a session marks the history closed and deletes the row in
//! one transaction.

use super::{
    count_matching, delete_where, find_one, insert_document, tenant_scope, timestamp_value, Store,
};
use crate::cascade::Cascade;
use crate::document::{from_document, from_documents, to_document};
use crate::engine::{
    Collection, Document, Executor, Expr, Pipeline, SortKey, SortOrder, Stage, TxnOptions,
    UpdateSpec,
};
use crate::query::{Query, QueryOption};
use crate::resolver::SessionResolver;
use fleet_core::{
    ActiveSession, EntityType, FleetError, FleetResult, RecordedSession, Session, SessionEvent,
    TenantId, Timestamp,
};

impl Store {
    fn session_query(&self) -> Query {
        Query::new()
            .default_sort(SortKey::new("started_at", SortOrder::Desc))
            .tiebreak("uid")
    }

    pub async fn session_list(&self, options: &[QueryOption]) -> FleetResult<(Vec<Session>, u64)> {
        self.list_with(Collection::Sessions, self.session_query(), options)
            .await
    }

    pub async fn session_resolve(
        &self,
        resolver: &SessionResolver,
        options: &[QueryOption],
    ) -> FleetResult<Session> {
        self.resolve_with(Collection::Sessions, Query::new(), resolver, options)
            .await
    }

    /// Insert a session together with its active-session row.
    pub async fn session_create(&self, session: &Session) -> FleetResult<()> {
        let doc = to_document(EntityType::Session, session, &[])?;
        let active = to_document(
            EntityType::ActiveSession,
            &ActiveSession {
                uid: session.uid.clone(),
                tenant_id: session.tenant_id.clone(),
                last_seen: session.last_seen,
            },
            &[],
        )?;

        self.cascade("create session", TxnOptions::default(), move |c| {
            Box::pin(create_session_steps(c, doc, active))
        })
        .await?;

        tracing::debug!(uid = %session.uid, device_uid = %session.device_uid, "Session created");
        Ok(())
    }

    /// Keep-alive. Refreshes `last_seen` on the session and its active row;
    /// a closed session is `NotFound`.
    pub async fn session_update_last_seen(&self, uid: &str) -> FleetResult<()> {
        let uid = uid.to_string();
        let now = self.now();
        self.cascade("keep session alive", TxnOptions::default(), move |c| {
            Box::pin(keep_alive_steps(c, uid, now))
        })
        .await
    }

    pub async fn session_set_authenticated(
        &self,
        uid: &str,
        authenticated: bool,
    ) -> FleetResult<()> {
        self.session_write(uid, UpdateSpec::new().set("authenticated", authenticated))
            .await
    }

    pub async fn session_set_recorded(&self, uid: &str, recorded: bool) -> FleetResult<()> {
        self.session_write(uid, UpdateSpec::new().set("recorded", recorded))
            .await
    }

    /// Add the event's type and seat to the session's sets and, when the
    /// session is recorded, append the event as a frame. Written with
    /// majority write concern.
    pub async fn session_record_event(&self, uid: &str, event: &SessionEvent) -> FleetResult<()> {
        let uid = uid.to_string();
        let event = event.clone();
        self.cascade("record session event", TxnOptions::majority(), move |c| {
            Box::pin(record_event_steps(c, uid, event))
        })
        .await
    }

    /// Mark the session closed with a final `last_seen` and delete its
    /// active row.
    pub async fn session_close(&self, uid: &str) -> FleetResult<()> {
        let session_uid = uid.to_string();
        let now = self.now();
        self.cascade("close session", TxnOptions::default(), move |c| {
            Box::pin(close_session_steps(c, session_uid, now))
        })
        .await?;

        tracing::debug!(uid, "Session closed");
        Ok(())
    }

    /// A session is open iff its active row exists.
    pub async fn session_is_active(&self, uid: &str) -> FleetResult<bool> {
        let n = count_matching(self.executor(), Collection::ActiveSessions, Expr::eq("uid", uid))
            .await?;
        Ok(n > 0)
    }

    /// Recorded frames of a session, oldest first.
    pub async fn session_list_frames(&self, uid: &str) -> FleetResult<Vec<RecordedSession>> {
        let pipeline = Pipeline::matching(Expr::eq("uid", uid)).with(Stage::Sort(vec![
            SortKey::new("time", SortOrder::Asc),
        ]));
        let docs = self
            .executor()
            .aggregate(Collection::RecordedSessions, &pipeline)
            .await?;
        from_documents(EntityType::Session, docs)
    }

    /// Janitor: close every session whose active row was last seen before
    /// `older_than`. Returns the number of rows removed.
    pub async fn active_session_delete_expired(&self, older_than: Timestamp) -> FleetResult<u64> {
        let now = self.now();
        let expired = self
            .cascade("expire active sessions", TxnOptions::default(), move |c| {
                Box::pin(expire_steps(c, older_than, now))
            })
            .await?;

        if expired > 0 {
            tracing::info!(expired, %older_than, "Expired active sessions removed");
        }
        Ok(expired)
    }

    async fn session_write(&self, uid: &str, update: UpdateSpec) -> FleetResult<()> {
        self.update_existing(Collection::Sessions, &Expr::eq("uid", uid), &update, uid)
            .await
    }
}

// ============================================================================
// CASCADE BODIES
// ============================================================================

fn session_filter(tenant: &str, uid: &str) -> Expr {
    Expr::and([tenant_scope(tenant), Expr::eq("uid", uid)])
}

fn open_session(tenant: &str, uid: &str) -> Expr {
    Expr::and([session_filter(tenant, uid), Expr::eq("closed", false)])
}

/// Point lookup of a session by its unique uid. Every later step of a
/// session cascade is scoped by the tenant found here.
async fn load_session(exec: &dyn Executor, uid: &str, open_only: bool) -> FleetResult<Session> {
    let mut filter = vec![Expr::eq("uid", uid)];
    if open_only {
        filter.push(Expr::eq("closed", false));
    }
    match find_one(exec, Collection::Sessions, Expr::and(filter)).await? {
        Some(doc) => from_document(EntityType::Session, doc),
        None => Err(FleetError::not_found(EntityType::Session, uid)),
    }
}

async fn create_session_steps(c: &Cascade, doc: Document, active: Document) -> FleetResult<()> {
    c.step("insert session", |exec| insert_document(exec, Collection::Sessions, doc))
        .await?;
    c.step("insert active session", |exec| {
        insert_document(exec, Collection::ActiveSessions, active)
    })
    .await
}

async fn keep_alive_steps(c: &Cascade, uid: String, now: Timestamp) -> FleetResult<()> {
    let uid = uid.as_str();
    let tenant = c
        .step("touch session", |exec| touch_session(exec, uid, now))
        .await?;
    c.step("touch active session", |exec| {
        touch(
            exec,
            Collection::ActiveSessions,
            session_filter(&tenant, uid),
            EntityType::ActiveSession,
            uid,
            now,
        )
    })
    .await
}

/// Refresh an open session and return its tenant.
async fn touch_session(exec: &dyn Executor, uid: &str, now: Timestamp) -> FleetResult<TenantId> {
    let session = load_session(exec, uid, true).await?;
    touch(
        exec,
        Collection::Sessions,
        open_session(&session.tenant_id, uid),
        EntityType::Session,
        uid,
        now,
    )
    .await?;
    Ok(session.tenant_id)
}

async fn touch(
    exec: &dyn Executor,
    collection: Collection,
    filter: Expr,
    entity_type: EntityType,
    uid: &str,
    now: Timestamp,
) -> FleetResult<()> {
    let update = UpdateSpec::new().set("last_seen", timestamp_value(now));
    let outcome = exec.update_one(collection, &filter, &update).await?;
    if outcome.matched == 0 {
        return Err(FleetError::not_found(entity_type, uid));
    }
    Ok(())
}

async fn record_event_steps(c: &Cascade, uid: String, event: SessionEvent) -> FleetResult<()> {
    let session = c
        .step("add event", |exec| add_event(exec, &uid, &event))
        .await?;
    if session.recorded {
        let frame = RecordedSession {
            uid: uid.clone(),
            tenant_id: session.tenant_id,
            message: event.data.to_string(),
            time: event.timestamp,
        };
        let doc = to_document(EntityType::Session, &frame, &[])?;
        c.step("append frame", |exec| {
            insert_document(exec, Collection::RecordedSessions, doc)
        })
        .await?;
    }
    Ok(())
}

/// Returns the session as it was before the event was added.
async fn add_event(exec: &dyn Executor, uid: &str, event: &SessionEvent) -> FleetResult<Session> {
    let session = load_session(exec, uid, false).await?;
    let update = UpdateSpec::new()
        .add_to_set("events.types", event.event_type.as_str())
        .add_to_set("events.seats", event.seat);
    exec.update_one(
        Collection::Sessions,
        &session_filter(&session.tenant_id, uid),
        &update,
    )
    .await?;
    Ok(session)
}

async fn close_session_steps(c: &Cascade, uid: String, now: Timestamp) -> FleetResult<()> {
    let uid = uid.as_str();
    let tenant = c
        .step("mark closed", |exec| mark_closed(exec, uid, now))
        .await?;
    c.step("delete active session", |exec| {
        delete_where(exec, Collection::ActiveSessions, session_filter(&tenant, uid))
    })
    .await?;
    Ok(())
}

/// Close an open session and return its tenant.
async fn mark_closed(exec: &dyn Executor, uid: &str, now: Timestamp) -> FleetResult<TenantId> {
    let session = load_session(exec, uid, true).await?;
    let update = UpdateSpec::new()
        .set("closed", true)
        .set("last_seen", timestamp_value(now));
    exec.update_one(
        Collection::Sessions,
        &open_session(&session.tenant_id, uid),
        &update,
    )
    .await?;
    Ok(session.tenant_id)
}

async fn expire_steps(c: &Cascade, older_than: Timestamp, now: Timestamp) -> FleetResult<u64> {
    let stale = Expr::lt("last_seen", timestamp_value(older_than));
    let uids = c
        .step("delete active sessions", |exec| {
            super::delete_collecting(exec, Collection::ActiveSessions, stale, "uid")
        })
        .await?;
    if uids.is_empty() {
        return Ok(0);
    }

    let closing = Expr::and([
        Expr::In(
            "uid".to_string(),
            uids.iter().map(|u| u.as_str().into()).collect(),
        ),
        Expr::eq("closed", false),
    ]);
    c.step("close sessions", |exec| {
        super::update_where(
            exec,
            Collection::Sessions,
            closing,
            UpdateSpec::new()
                .set("closed", true)
                .set("last_seen", timestamp_value(now)),
        )
    })
    .await?;
    Ok(uids.len() as u64)
}
