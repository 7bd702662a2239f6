//! Storage layer: a key-spaced façade over redb.
//!
//! Higher layers never open transactions themselves. They describe one
//! logical mutation as an [`EntityCommit`] and hand it to
//! [`Storage::commit_entity`], which applies the body, index diffs,
//! embedding queue changes and the WAL entry in a single atomic
//! transaction.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  entity store / executor / replication                   │
//! │                    │                                     │
//! │                    ▼                                     │
//! │            ┌──────────────┐                              │
//! │            │   Storage    │  one redb txn per commit     │
//! │            └──────────────┘                              │
//! │      entities · key_index · secondary · embeddings       │
//! │      embedding_queue · hnsw_meta · wal · wal_meta        │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod redb;
pub mod tables;

pub use self::redb::{
    embedding_from_bytes, embedding_to_bytes, EmbedJob, EntityCommit, Posting, Storage,
};
pub use tables::{encode_index_value, DatabaseMetadata, LAYOUT_VERSION};
