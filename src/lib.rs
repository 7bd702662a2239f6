//! # REM Database
//!
//! Embedded, multi-tenant database organizing data as **Resources,
//! Entities and Moments**, with vector similarity search, schema-governed
//! JSON validation, a natural-language query planner, an extended SQL
//! dialect (REM-SQL) and gRPC peer replication driven by a write-ahead
//! log.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use remdb::{RemDb, Config};
//!
//! // Open or create a tenant database
//! let db = RemDb::open("./rem.db", Config::for_tenant("acme"))?;
//!
//! // Insert a resource; embedding generation runs in the background
//! let id = db.insert("resources", serde_json::json!({
//!     "name": "Intro to Rust",
//!     "content": "Rust is a systems programming language",
//!     "category": "tutorial",
//! }))?;
//!
//! // Query three ways
//! let rows = db.sql("SELECT * FROM resources WHERE category = 'tutorial'")?;
//! let hits = db.search("systems languages", "resources", 5)?;
//! let plan = db.plan_query("550e8400-e29b-41d4-a716-446655440000", None)?;
//!
//! db.close()?;
//! ```
//!
//! ## Key Concepts
//!
//! ### Tenant
//!
//! The outermost scope. Every key, index and replication stream is
//! partitioned by tenant id; the core never reads across tenants.
//!
//! ### Entity
//!
//! The universal record: schema-validated JSON `properties` plus system
//! fields (`created_at`, `modified_at`, `deleted_at`) and inline edges.
//! Resources, moments, sessions, messages and agents are all entities
//! under built-in schemas.
//!
//! ### REM-SQL
//!
//! The extended dialect with `LOOKUP`, `SEARCH`, `TRAVERSE` and `SELECT`
//! and deliberately no JOINs; relationships are traversed, not joined.
//!
//! ### Replication
//!
//! Every committed write appends one WAL entry. Peers form a mesh of gRPC
//! streams; conflicts resolve last-write-wins by timestamp with peer-id
//! tiebreak, so all peers converge after quiescence.
//!
//! ## Thread Safety
//!
//! `RemDb` is `Send + Sync` and can be shared across threads using `Arc`.
//! Reads run concurrently; writes within a tenant are serialized.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

// ============================================================================
// Module declarations
// ============================================================================

mod config;
mod db;
mod entity;
mod error;
mod types;
mod wal;

pub mod store;

pub mod embedding;
pub mod graph;
pub mod llm;
pub mod query;
pub mod replication;
pub mod schema;
pub mod storage;
pub mod vector;

// ============================================================================
// Public API re-exports
// ============================================================================

// Main database interface
pub use db::RemDb;

// Configuration
pub use config::{Config, HnswConfig, PeerAddress, ReplicationConfig};

// Error handling
pub use error::{
    NotFoundError, QueryError, RemDbError, ReplicationError, Result, StorageError,
    ValidationError,
};

// Core types
pub use entity::{Direction, Edge, Entity, EMBEDDING_ERROR_PROPERTY};
pub use types::{Embedding, EntityId, PeerId, TenantId, Timestamp};
pub use wal::{WalEntry, WalOperation};

// Schemas
pub use schema::{EmbeddingField, SchemaDefinition, SchemaRegistry};

// Query layer
pub use query::{
    ExecutionMode, FallbackTrigger, Order, Predicate, QueryPlan, QueryResult, QueryType,
    Statement,
};

// Store options
pub use store::ScanOptions;

// Graph traversal
pub use graph::TraversalResult;

// Replication health
pub use replication::{PeerStatus, ReplicationStatus};

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Convenient imports for common usage.
///
/// ```rust
/// use remdb::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::db::RemDb;
    pub use crate::entity::{Direction, Entity};
    pub use crate::error::{RemDbError, Result};
    pub use crate::query::{QueryPlan, QueryResult};
    pub use crate::store::ScanOptions;
    pub use crate::types::{EntityId, Timestamp};
}
