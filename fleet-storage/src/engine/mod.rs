//! Document engine seam.
//!
//! The store never talks to a database driver directly. It speaks to an
//! [`Executor`]: something that can run aggregation pipelines and
//! single/multi-document writes over named collections. A
//! [`DocumentEngine`] is an executor that can also open a
//! [`Transaction`], which is itself an executor whose writes become
//! visible only on commit.
//!
//! Engine-native failures are [`EngineError`]s. They are translated into
//! the fleet error taxonomy exactly once, through `From<EngineError> for
//! FleetError`, so nothing above the store ever sees them.

pub mod expr;
pub mod memory;

pub use expr::{Computed, Expr, Pipeline, SortKey, SortOrder, Stage};
pub use memory::{InMemoryEngine, MemoryTransaction};

use async_trait::async_trait;
use fleet_core::{EntityType, FleetError, StorageError};
use serde_json::Value;
use std::fmt;

/// A stored document.
pub type Document = serde_json::Map<String, Value>;

/// Result type for engine calls.
pub type EngineResult<T> = Result<T, EngineError>;

// ============================================================================
// COLLECTIONS
// ============================================================================

/// Every collection the store reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Namespaces,
    Devices,
    ConnectedDevices,
    Sessions,
    ActiveSessions,
    RecordedSessions,
    FirewallRules,
    PublicKeys,
    Users,
    ApiKeys,
    Tunnels,
    System,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Namespaces => "namespaces",
            Collection::Devices => "devices",
            Collection::ConnectedDevices => "connected_devices",
            Collection::Sessions => "sessions",
            Collection::ActiveSessions => "active_sessions",
            Collection::RecordedSessions => "recorded_sessions",
            Collection::FirewallRules => "firewall_rules",
            Collection::PublicKeys => "public_keys",
            Collection::Users => "users",
            Collection::ApiKeys => "api_keys",
            Collection::Tunnels => "tunnels",
            Collection::System => "system",
        }
    }

    /// Entity reported in errors raised against this collection.
    pub fn entity_type(&self) -> EntityType {
        match self {
            Collection::Namespaces => EntityType::Namespace,
            Collection::Devices | Collection::ConnectedDevices | Collection::Tunnels => {
                EntityType::Device
            }
            Collection::Sessions | Collection::RecordedSessions => EntityType::Session,
            Collection::ActiveSessions => EntityType::ActiveSession,
            Collection::FirewallRules => EntityType::FirewallRule,
            Collection::PublicKeys => EntityType::PublicKey,
            Collection::Users => EntityType::User,
            Collection::ApiKeys => EntityType::ApiKey,
            Collection::System => EntityType::SystemSettings,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// WRITES
// ============================================================================

/// A single field mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(String, Value),
    Unset(String),
    Inc(String, i64),
    Push(String, Value),
    AddToSet(String, Value),
    Pull(String, Value),
    /// Remove every object element of an array field matching the expression.
    PullWhere(String, Expr),
    /// Replace every occurrence of `from` in an array field with `to`,
    /// keeping the array free of duplicates.
    ReplaceInArray { field: String, from: Value, to: Value },
}

/// An ordered list of field mutations applied to each matched document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateSpec {
    ops: Vec<UpdateOp>,
}

impl UpdateSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Set(field.into(), value.into()));
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.ops.push(UpdateOp::Unset(field.into()));
        self
    }

    pub fn inc(mut self, field: impl Into<String>, by: i64) -> Self {
        self.ops.push(UpdateOp::Inc(field.into(), by));
        self
    }

    pub fn push(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Push(field.into(), value.into()));
        self
    }

    pub fn add_to_set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::AddToSet(field.into(), value.into()));
        self
    }

    pub fn pull(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Pull(field.into(), value.into()));
        self
    }

    pub fn pull_where(mut self, field: impl Into<String>, condition: Expr) -> Self {
        self.ops.push(UpdateOp::PullWhere(field.into(), condition));
        self
    }

    pub fn replace_in_array(
        mut self,
        field: impl Into<String>,
        from: impl Into<Value>,
        to: impl Into<Value>,
    ) -> Self {
        self.ops.push(UpdateOp::ReplaceInArray {
            field: field.into(),
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Outcome of an update: how many documents matched the filter and how
/// many were actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// Durability level requested for a transaction's commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteConcern {
    #[default]
    Acknowledged,
    Majority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxnOptions {
    pub write_concern: WriteConcern,
}

impl TxnOptions {
    pub fn majority() -> Self {
        Self {
            write_concern: WriteConcern::Majority,
        }
    }
}

/// Kind of engine call, used for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Aggregate,
    Insert,
    Update,
    Delete,
}

// ============================================================================
// ERRORS
// ============================================================================

/// Engine-native errors.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("duplicate key in {collection} on index ({index})")]
    DuplicateKey { collection: Collection, index: String },

    #[error("write conflict on {collection}")]
    WriteConflict { collection: Collection },

    #[error("transaction is no longer open")]
    TransactionClosed,

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("injected fault: {operation:?} on {collection}")]
    Injected {
        collection: Collection,
        operation: Operation,
    },

    #[error("invalid document in {collection}: {reason}")]
    InvalidDocument { collection: Collection, reason: String },

    #[error("engine lock poisoned")]
    LockPoisoned,
}

/// The single translation point from engine errors to the fleet taxonomy.
impl From<EngineError> for FleetError {
    fn from(e: EngineError) -> Self {
        let storage = match e {
            EngineError::DuplicateKey { collection, index } => StorageError::Duplicate {
                entity_type: collection.entity_type(),
                reason: format!("unique index ({}) violated", index),
            },
            EngineError::InvalidDocument { collection, reason } => StorageError::Serialization {
                entity_type: collection.entity_type(),
                reason,
            },
            EngineError::WriteConflict { collection } => StorageError::WriteConflict {
                entity_type: collection.entity_type(),
            },
            other @ (EngineError::TransactionClosed
            | EngineError::Unavailable(_)
            | EngineError::Injected { .. }
            | EngineError::LockPoisoned) => StorageError::Unavailable {
                reason: other.to_string(),
            },
        };
        FleetError::Storage(storage)
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Runs reads and writes against collections.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run an aggregation pipeline over a collection.
    async fn aggregate(
        &self,
        collection: Collection,
        pipeline: &Pipeline,
    ) -> EngineResult<Vec<Document>>;

    /// Insert one document, enforcing unique indexes.
    async fn insert_one(&self, collection: Collection, document: Document) -> EngineResult<()>;

    /// Update the first document matching `filter`.
    async fn update_one(
        &self,
        collection: Collection,
        filter: &Expr,
        update: &UpdateSpec,
    ) -> EngineResult<UpdateOutcome>;

    /// Update every document matching `filter`.
    async fn update_many(
        &self,
        collection: Collection,
        filter: &Expr,
        update: &UpdateSpec,
    ) -> EngineResult<UpdateOutcome>;

    /// Delete the first document matching `filter`. Returns the number deleted.
    async fn delete_one(&self, collection: Collection, filter: &Expr) -> EngineResult<u64>;

    /// Delete every document matching `filter`. Returns the number deleted.
    async fn delete_many(&self, collection: Collection, filter: &Expr) -> EngineResult<u64>;
}

/// A document database with multi-document transactions.
#[async_trait]
pub trait DocumentEngine: Executor {
    /// This engine as a plain executor (writes are immediately visible).
    fn as_executor(&self) -> &dyn Executor;

    /// Open a transaction. Dropping the returned handle without committing
    /// rolls it back.
    async fn begin(&self, options: TxnOptions) -> EngineResult<Box<dyn Transaction>>;

    /// Declare a unique index over one or more fields.
    async fn create_unique_index(&self, collection: Collection, fields: &[&str])
        -> EngineResult<()>;

    /// Cheap liveness check.
    async fn ping(&self) -> EngineResult<()>;
}

/// An open multi-document transaction.
#[async_trait]
pub trait Transaction: Executor {
    fn as_executor(&self) -> &dyn Executor;

    fn options(&self) -> TxnOptions;

    async fn commit(self: Box<Self>) -> EngineResult<()>;

    async fn abort(self: Box<Self>) -> EngineResult<()>;
}
