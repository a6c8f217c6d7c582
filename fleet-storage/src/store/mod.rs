//! Store facade.
//!
//! [`Store`] owns the document engine, the cache-aside accessor, the clock
//! and the configuration. Per-entity operations live in the submodules,
//! each adding an `impl Store` block; this module holds the shared
//! plumbing they are built from.

mod api_key;
mod device;
mod firewall;
mod member;
mod namespace;
mod public_key;
mod session;
mod system;
mod tag;
mod user;

use crate::cache::{CacheAside, CacheBackend, InMemoryCacheBackend, LmdbCacheBackend};
use crate::cascade::{run_cascade, Cascade};
use crate::config::StoreConfig;
use crate::document::{from_document, from_documents};
use crate::engine::{
    Collection, Document, DocumentEngine, Executor, Expr, Pipeline, Stage, TxnOptions,
    UpdateOutcome, UpdateSpec,
};
use crate::query::{Query, QueryOption, COUNT_FIELD};
use crate::resolver::Resolver;
use chrono::SecondsFormat;
use fleet_core::{Clock, FleetError, FleetResult, SystemClock, Timestamp};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Unique indexes the store relies on, per collection.
const UNIQUE_INDEXES: &[(Collection, &[&str])] = &[
    (Collection::Namespaces, &["tenant_id"]),
    (Collection::Namespaces, &["name"]),
    (Collection::Devices, &["uid"]),
    (Collection::Devices, &["tenant_id", "name"]),
    (Collection::ConnectedDevices, &["uid"]),
    (Collection::Sessions, &["uid"]),
    (Collection::ActiveSessions, &["uid"]),
    (Collection::FirewallRules, &["id"]),
    (Collection::FirewallRules, &["tenant_id", "priority"]),
    (Collection::PublicKeys, &["tenant_id", "fingerprint"]),
    (Collection::Users, &["id"]),
    (Collection::Users, &["email"]),
    (Collection::Users, &["username"]),
    (Collection::ApiKeys, &["id"]),
    (Collection::ApiKeys, &["tenant_id", "name"]),
    (Collection::Tunnels, &["address"]),
];

/// Persistence layer for fleet entities.
#[derive(Clone)]
pub struct Store {
    engine: Arc<dyn DocumentEngine>,
    cache: CacheAside,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl Store {
    /// Create a store from its collaborators.
    pub fn new(
        engine: Arc<dyn DocumentEngine>,
        cache: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
    ) -> Self {
        Self {
            engine,
            cache: CacheAside::new(cache),
            clock,
            config,
        }
    }

    /// Create a store on the wall clock, choosing the cache backend from
    /// configuration. An LMDB cache that cannot be opened is logged and
    /// replaced by the in-memory cache.
    pub fn from_config(engine: Arc<dyn DocumentEngine>, config: StoreConfig) -> FleetResult<Self> {
        config.validate()?;

        let cache: Arc<dyn CacheBackend> = match &config.cache_dir {
            Some(dir) => match LmdbCacheBackend::new(dir, config.cache_max_size_mb) {
                Ok(lmdb) => Arc::new(lmdb),
                Err(e) => {
                    tracing::warn!(
                        path = %dir.display(),
                        error = %e,
                        "LMDB cache unavailable, using in-memory cache"
                    );
                    Arc::new(InMemoryCacheBackend::new())
                }
            },
            None => Arc::new(InMemoryCacheBackend::new()),
        };

        Ok(Self::new(engine, cache, Arc::new(SystemClock), config))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheAside {
        &self.cache
    }

    /// Current time according to the store clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Declare every unique index. Safe to call repeatedly.
    pub async fn ensure_indexes(&self) -> FleetResult<()> {
        for (collection, fields) in UNIQUE_INDEXES {
            self.engine.create_unique_index(*collection, fields).await?;
        }
        tracing::info!(count = UNIQUE_INDEXES.len(), "Unique indexes ensured");
        Ok(())
    }

    /// Check that the document engine is reachable.
    pub async fn health_check(&self) -> FleetResult<()> {
        self.engine.ping().await?;
        Ok(())
    }

    /// Run caller-defined writes atomically. See [`Cascade::step`].
    pub async fn with_transaction<T, F>(&self, body: F) -> FleetResult<T>
    where
        F: for<'c> FnOnce(&'c Cascade) -> BoxFuture<'c, FleetResult<T>> + Send,
    {
        self.cascade("transaction", TxnOptions::default(), body).await
    }

    // ========================================================================
    // SHARED PLUMBING
    // ========================================================================

    pub(crate) async fn cascade<T, F>(
        &self,
        name: &'static str,
        options: TxnOptions,
        body: F,
    ) -> FleetResult<T>
    where
        F: for<'c> FnOnce(&'c Cascade) -> BoxFuture<'c, FleetResult<T>> + Send,
    {
        run_cascade(
            self.engine.as_ref(),
            name,
            options,
            self.config.transaction_timeout,
            body,
        )
        .await
    }

    pub(crate) fn executor(&self) -> &dyn Executor {
        self.engine.as_executor()
    }

    /// Run the data and count pipelines of `query`.
    pub(crate) async fn list_with<T: DeserializeOwned>(
        &self,
        collection: Collection,
        query: Query,
        options: &[QueryOption],
    ) -> FleetResult<(Vec<T>, u64)> {
        let query = query.apply(options)?;
        let docs = self
            .executor()
            .aggregate(collection, &query.data_pipeline())
            .await?;
        let total = count_of(
            self.executor()
                .aggregate(collection, &query.count_pipeline())
                .await?,
        );
        let items = from_documents(collection.entity_type(), docs)?;
        Ok((items, total))
    }

    /// Resolve exactly one entity, or `NotFound`.
    pub(crate) async fn resolve_with<R: Resolver, T: DeserializeOwned>(
        &self,
        collection: Collection,
        query: Query,
        resolver: &R,
        options: &[QueryOption],
    ) -> FleetResult<T> {
        let query = query.scoped(resolver.to_expr()?).apply(options)?;
        let mut docs = self
            .executor()
            .aggregate(collection, &query.single_pipeline())
            .await?;
        match docs.pop() {
            Some(doc) => from_document(R::ENTITY, doc),
            None => Err(FleetError::not_found(R::ENTITY, resolver.value())),
        }
    }
}

impl Store {
    /// Update the first document matching `filter`, or `NotFound`.
    pub(crate) async fn update_existing(
        &self,
        collection: Collection,
        filter: &Expr,
        update: &UpdateSpec,
        id: &str,
    ) -> FleetResult<()> {
        let outcome = self
            .executor()
            .update_one(collection, filter, update)
            .await?;
        if outcome.matched == 0 {
            return Err(FleetError::not_found(collection.entity_type(), id));
        }
        Ok(())
    }

    /// Delete the first document matching `filter`, or `NotFound`.
    pub(crate) async fn delete_existing(
        &self,
        collection: Collection,
        filter: &Expr,
        id: &str,
    ) -> FleetResult<()> {
        let deleted = self.executor().delete_one(collection, filter).await?;
        if deleted == 0 {
            return Err(FleetError::not_found(collection.entity_type(), id));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Total from a count pipeline. An empty result counts as zero.
pub(crate) fn count_of(docs: Vec<Document>) -> u64 {
    docs.first()
        .and_then(|d| d.get(COUNT_FIELD))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Count documents matching `filter`.
pub(crate) async fn count_matching(
    exec: &dyn Executor,
    collection: Collection,
    filter: Expr,
) -> FleetResult<u64> {
    let pipeline = Pipeline::matching(filter).with(Stage::Count(COUNT_FIELD.to_string()));
    Ok(count_of(exec.aggregate(collection, &pipeline).await?))
}

/// Fetch one raw document matching `filter`.
pub(crate) async fn find_one(
    exec: &dyn Executor,
    collection: Collection,
    filter: Expr,
) -> FleetResult<Option<Document>> {
    let pipeline = Pipeline::matching(filter).with(Stage::Limit(1));
    Ok(exec.aggregate(collection, &pipeline).await?.pop())
}

/// A string field from every document matching `filter`.
pub(crate) async fn distinct_strings(
    exec: &dyn Executor,
    collection: Collection,
    filter: Expr,
    field: &str,
) -> FleetResult<Vec<String>> {
    let docs = exec
        .aggregate(collection, &Pipeline::matching(filter))
        .await?;
    Ok(docs
        .iter()
        .filter_map(|d| d.get(field).and_then(Value::as_str).map(str::to_string))
        .collect())
}

pub(crate) async fn insert_document(
    exec: &dyn Executor,
    collection: Collection,
    doc: Document,
) -> FleetResult<()> {
    exec.insert_one(collection, doc).await?;
    Ok(())
}

pub(crate) async fn update_where(
    exec: &dyn Executor,
    collection: Collection,
    filter: Expr,
    update: UpdateSpec,
) -> FleetResult<UpdateOutcome> {
    Ok(exec.update_many(collection, &filter, &update).await?)
}

pub(crate) async fn delete_where(
    exec: &dyn Executor,
    collection: Collection,
    filter: Expr,
) -> FleetResult<u64> {
    Ok(exec.delete_many(collection, &filter).await?)
}

/// Delete every document matching `filter`, returning `field` of each.
pub(crate) async fn delete_collecting(
    exec: &dyn Executor,
    collection: Collection,
    filter: Expr,
    field: &'static str,
) -> FleetResult<Vec<String>> {
    let values = distinct_strings(exec, collection, filter.clone(), field).await?;
    exec.delete_many(collection, &filter).await?;
    Ok(values)
}

/// Timestamps are stored as RFC 3339 strings.
pub(crate) fn timestamp_value(ts: Timestamp) -> Value {
    Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

pub(crate) fn tenant_scope(tenant_id: &str) -> Expr {
    Expr::eq("tenant_id", tenant_id)
}
