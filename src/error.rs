//! Error types for the REM database.
//!
//! The crate uses a hierarchical error system:
//! - `RemDbError` is the top-level error returned by all public APIs
//! - Specific error types (`StorageError`, `ValidationError`, `QueryError`,
//!   `ReplicationError`) provide detail
//!
//! Every user-visible failure carries a machine-readable code (see
//! [`RemDbError::code`]) plus a one-line explanation. Fallback queries are a
//! user-visible mechanism handled by the executor, never a silent retry.

use thiserror::Error;

/// Result type alias for REM database operations.
pub type Result<T> = std::result::Result<T, RemDbError>;

/// Top-level error enum for all REM database operations.
///
/// This is the only error type returned by public APIs.
/// Use pattern matching to handle specific error cases.
#[derive(Debug, Error)]
pub enum RemDbError {
    /// Storage layer error (I/O, corruption, transactions).
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Input validation error (schema violation, dimension mismatch).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of what's wrong with the configuration.
        reason: String,
    },

    /// Requested entity, schema or provider not found.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// REM-SQL parsing or query plan validation error.
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Embedding or LLM provider failed after retries. Recoverable for the
    /// caller: the write survives with an `embedding_error` property, and the
    /// planner degrades to rule-based planning.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Vector index error (HNSW operations).
    #[error("Vector index error: {0}")]
    Vector(String),

    /// Replication error (peer streams, WAL application).
    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemDbError {
    /// Creates a configuration error with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates a provider-unavailable error with the given message.
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::ProviderUnavailable(msg.into())
    }

    /// Creates a vector index error with the given message.
    pub fn vector(msg: impl Into<String>) -> Self {
        Self::Vector(msg.into())
    }

    /// Returns the stable machine-readable code for this error.
    ///
    /// This is what crosses process boundaries instead of a stack trace.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage_fatal",
            Self::Validation(ValidationError::DimensionMismatch { .. }) => "dimension_mismatch",
            Self::Validation(_) => "schema_violation",
            Self::Config { .. } => "config",
            Self::NotFound(_) => "not_found",
            Self::Query(QueryError::Parse { .. }) => "query_parse",
            Self::Query(QueryError::PlanValidation { .. }) => "plan_validation",
            Self::Query(_) => "query",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::Vector(_) => "vector_index",
            Self::Replication(ReplicationError::Transient { .. }) => "replication_transient",
            Self::Replication(_) => "replication",
            Self::Io(_) => "io",
        }
    }

    /// Returns true if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a storage error.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is a vector index error.
    pub fn is_vector(&self) -> bool {
        matches!(self, Self::Vector(_))
    }

    /// Returns true if the error is transient and internal retry applies.
    ///
    /// Only transient network failures qualify per the propagation policy;
    /// everything else surfaces synchronously to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Replication(ReplicationError::Transient { .. }) | Self::ProviderUnavailable(_)
        )
    }
}

/// Storage-related errors.
///
/// These errors indicate problems with the underlying storage layer and are
/// fatal to the enclosing batch: either all of `{body, indexes, wal}` commit
/// or none does.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database file or data is corrupted.
    #[error("Database corrupted: {0}")]
    Corrupted(String),

    /// Database is locked by another process.
    #[error("Database is locked by another writer")]
    DatabaseLocked,

    /// Transaction failed (commit, rollback, etc.).
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error from the redb storage engine.
    #[error("Storage engine error: {0}")]
    Redb(String),

    /// Database layout version doesn't match expected version.
    #[error("Layout version mismatch: expected {expected}, found {found}")]
    LayoutVersionMismatch {
        /// Expected layout version.
        expected: u32,
        /// Actual layout version found in database.
        found: u32,
    },
}

impl StorageError {
    /// Creates a corruption error with the given message.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Creates a transaction error with the given message.
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Creates a serialization error with the given message.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Creates a redb error with the given message.
    pub fn redb(msg: impl Into<String>) -> Self {
        Self::Redb(msg.into())
    }
}

// Conversions from redb error types
impl From<redb::Error> for StorageError {
    fn from(err: redb::Error) -> Self {
        StorageError::Redb(err.to_string())
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        StorageError::Redb(err.to_string())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::Transaction(err.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::Transaction(format!("Commit failed: {}", err))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        StorageError::Redb(format!("Table error: {}", err))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        StorageError::Redb(format!("Storage error: {}", err))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

// Also allow direct conversion to RemDbError for convenience
impl From<redb::Error> for RemDbError {
    fn from(err: redb::Error) -> Self {
        RemDbError::Storage(StorageError::from(err))
    }
}

impl From<redb::DatabaseError> for RemDbError {
    fn from(err: redb::DatabaseError) -> Self {
        RemDbError::Storage(StorageError::from(err))
    }
}

impl From<redb::TransactionError> for RemDbError {
    fn from(err: redb::TransactionError) -> Self {
        RemDbError::Storage(StorageError::from(err))
    }
}

impl From<redb::CommitError> for RemDbError {
    fn from(err: redb::CommitError) -> Self {
        RemDbError::Storage(StorageError::from(err))
    }
}

impl From<redb::TableError> for RemDbError {
    fn from(err: redb::TableError) -> Self {
        RemDbError::Storage(StorageError::from(err))
    }
}

impl From<redb::StorageError> for RemDbError {
    fn from(err: redb::StorageError) -> Self {
        RemDbError::Storage(StorageError::from(err))
    }
}

impl From<bincode::Error> for RemDbError {
    fn from(err: bincode::Error) -> Self {
        RemDbError::Storage(StorageError::from(err))
    }
}

impl From<serde_json::Error> for RemDbError {
    fn from(err: serde_json::Error) -> Self {
        RemDbError::Storage(StorageError::from(err))
    }
}

/// Validation errors for input data.
///
/// These errors indicate problems with data provided by the caller and are
/// surfaced synchronously; they never trigger internal retries.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A record failed JSON Schema validation.
    #[error("Schema violation on '{schema}': field '{field}': {constraint}")]
    SchemaViolation {
        /// Schema the record was validated against.
        schema: String,
        /// Offending field (instance path).
        field: String,
        /// Violated constraint, as reported by the validator.
        constraint: String,
    },

    /// Embedding dimension doesn't match the provider's registered dimension.
    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected dimension from the provider registry.
        expected: usize,
        /// Actual dimension provided.
        got: usize,
    },

    /// A field has an invalid value.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Name of the invalid field.
        field: String,
        /// Why the value is invalid.
        reason: String,
    },

    /// A required field is missing or empty.
    #[error("Required field missing: {field}")]
    RequiredField {
        /// Name of the missing field.
        field: String,
    },

    /// A schema registration conflicts with an existing one.
    #[error("Schema conflict: {reason}")]
    SchemaConflict {
        /// What collided (FQN or short name).
        reason: String,
    },
}

impl ValidationError {
    /// Creates a schema violation error.
    pub fn schema_violation(
        schema: impl Into<String>,
        field: impl Into<String>,
        constraint: impl Into<String>,
    ) -> Self {
        Self::SchemaViolation {
            schema: schema.into(),
            field: field.into(),
            constraint: constraint.into(),
        }
    }

    /// Creates a dimension mismatch error.
    pub fn dimension_mismatch(expected: usize, got: usize) -> Self {
        Self::DimensionMismatch { expected, got }
    }

    /// Creates an invalid field error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a required field error.
    pub fn required_field(field: impl Into<String>) -> Self {
        Self::RequiredField {
            field: field.into(),
        }
    }

    /// Creates a schema conflict error.
    pub fn schema_conflict(reason: impl Into<String>) -> Self {
        Self::SchemaConflict {
            reason: reason.into(),
        }
    }
}

/// Not found errors for specific lookups.
#[derive(Debug, Error)]
pub enum NotFoundError {
    /// Entity with given id not found.
    #[error("Entity not found: {0}")]
    Entity(String),

    /// Schema with given name or short name not registered.
    #[error("Schema not found: {0}")]
    Schema(String),

    /// Embedding provider not present in the registry.
    #[error("Embedding provider not found: {0}")]
    Provider(String),

    /// Replication peer not configured.
    #[error("Peer not found: {0}")]
    Peer(String),
}

impl NotFoundError {
    /// Creates an entity not found error.
    pub fn entity(id: impl ToString) -> Self {
        Self::Entity(id.to_string())
    }

    /// Creates a schema not found error.
    pub fn schema(name: impl ToString) -> Self {
        Self::Schema(name.to_string())
    }

    /// Creates a provider not found error.
    pub fn provider(name: impl ToString) -> Self {
        Self::Provider(name.to_string())
    }

    /// Creates a peer not found error.
    pub fn peer(id: impl ToString) -> Self {
        Self::Peer(id.to_string())
    }
}

/// Query-layer errors: REM-SQL parsing and plan validation.
///
/// Parse and validation failures are fatal to the current stage; the
/// executor passes them to fallbacks registered with the `error` trigger.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Malformed REM-SQL.
    #[error("Parse error at position {position}: {message}")]
    Parse {
        /// Byte offset into the query string.
        position: usize,
        /// What went wrong.
        message: String,
    },

    /// A QueryPlan violated a structural rule (e.g. low confidence without
    /// an explanation). LLM plans are untrusted input and are re-validated.
    #[error("Plan validation failed: {reason}")]
    PlanValidation {
        /// Which rule was violated.
        reason: String,
    },

    /// A WHERE predicate references a field the schema does not index.
    #[error("Predicate on non-indexed field '{field}' of schema '{schema}'")]
    NonIndexedPredicate {
        /// The offending field.
        field: String,
        /// Schema that lacks the index.
        schema: String,
    },
}

impl QueryError {
    /// Creates a parse error.
    pub fn parse(position: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: message.into(),
        }
    }

    /// Creates a plan validation error.
    pub fn plan_validation(reason: impl Into<String>) -> Self {
        Self::PlanValidation {
            reason: reason.into(),
        }
    }
}

/// Replication errors.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Peer disconnected or unreachable; the client reconnects with backoff.
    #[error("Peer {peer} unavailable: {reason}")]
    Transient {
        /// Which peer.
        peer: String,
        /// Underlying cause.
        reason: String,
    },

    /// The manager is not running.
    #[error("Replication manager not running")]
    NotRunning,

    /// Entry could not be decoded or decrypted.
    #[error("Invalid WAL entry: {0}")]
    InvalidEntry(String),
}

impl ReplicationError {
    /// Creates a transient peer error.
    pub fn transient(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            peer: peer.into(),
            reason: reason.into(),
        }
    }
}
