//! Error types for fleet operations

use crate::EntityType;
use thiserror::Error;

/// Storage layer errors.
///
/// Engine-native failures are translated into this taxonomy once, at the
/// storage boundary. Nothing above the store ever sees an engine error.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: EntityType, id: String },

    #[error("Duplicate {entity_type}: {reason}")]
    Duplicate { entity_type: EntityType, reason: String },

    #[error("Invalid identifier for {entity_type}: {value}")]
    InvalidIdentifier { entity_type: EntityType, value: String },

    #[error("Conflicting {entity_type} fields: {fields:?}")]
    Conflict {
        entity_type: EntityType,
        fields: Vec<String>,
    },

    #[error("Transaction aborted at step '{step}': {source}")]
    TransactionAborted {
        step: String,
        source: Box<FleetError>,
    },

    #[error("Write conflict on {entity_type}")]
    WriteConflict { entity_type: EntityType },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Serialization failed for {entity_type}: {reason}")]
    Serialization { entity_type: EntityType, reason: String },
}

/// Client-input validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown filter operator: {operator}")]
    UnknownOperator { operator: String },

    #[error("Malformed filter: {reason}")]
    MalformedFilter { reason: String },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all fleet errors.
#[derive(Debug, Clone, Error)]
pub enum FleetError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

impl FleetError {
    /// Shorthand for a storage not-found error.
    pub fn not_found(entity_type: EntityType, id: impl Into<String>) -> Self {
        FleetError::Storage(StorageError::NotFound {
            entity_type,
            id: id.into(),
        })
    }

    /// Shorthand for a duplicate error.
    pub fn duplicate(entity_type: EntityType, reason: impl Into<String>) -> Self {
        FleetError::Storage(StorageError::Duplicate {
            entity_type,
            reason: reason.into(),
        })
    }

    /// The innermost error, looking through aborted transactions.
    pub fn root_cause(&self) -> &FleetError {
        match self {
            FleetError::Storage(StorageError::TransactionAborted { source, .. }) => {
                source.root_cause()
            }
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root_cause(),
            FleetError::Storage(StorageError::NotFound { .. })
        )
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(
            self.root_cause(),
            FleetError::Storage(StorageError::Duplicate { .. })
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self.root_cause(),
            FleetError::Storage(StorageError::Conflict { .. })
        )
    }

    /// True when a transaction lost a race on a document another writer
    /// changed. Retrying the operation is safe.
    pub fn is_write_conflict(&self) -> bool {
        matches!(
            self.root_cause(),
            FleetError::Storage(StorageError::WriteConflict { .. })
        )
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(
            self.root_cause(),
            FleetError::Storage(StorageError::Unavailable { .. })
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.root_cause(), FleetError::Validation(_))
    }

    /// True when this error is a rolled-back cascade.
    pub fn is_transaction_aborted(&self) -> bool {
        matches!(
            self,
            FleetError::Storage(StorageError::TransactionAborted { .. })
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================
