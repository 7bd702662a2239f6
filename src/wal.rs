//! Write-ahead log records.
//!
//! Every committed mutation emits exactly one WAL entry in the same storage
//! transaction as the mutation itself. The WAL is the unit of replication:
//! entries stream to peers, which apply them under last-write-wins rules.
//!
//! Seq numbers are strictly increasing per `(tenant, tablespace)`. A seq
//! regression indicates corruption and panics rather than propagating.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Tablespace carrying entity bodies. The only tablespace the core writes
/// today; the WAL format keeps the field so streams stay partitionable.
pub const ENTITIES_TABLESPACE: &str = "entities";

/// Mutation kind recorded in the WAL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOperation {
    /// Insert or update of a record.
    Put,
    /// Soft delete. The value still carries the tombstoned body so peers
    /// can apply the delete under the same LWW rules as a Put.
    Delete,
}

impl WalOperation {
    /// Stable wire discriminant (matches the proto enum).
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Put => 1,
            Self::Delete => 2,
        }
    }

    /// Parses the wire discriminant.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Put),
            2 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One committed mutation.
///
/// `timestamp` is the writer's `modified_at` in microseconds UTC; conflicts
/// on the same key resolve last-write-wins by timestamp, ties broken by
/// `source_peer_id` lexicographic order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Strictly increasing per `(tenant, tablespace)` on the local node.
    pub seq_num: u64,
    /// Tenant the mutation belongs to.
    pub tenant_id: String,
    /// Logical keyspace within the tenant.
    pub tablespace: String,
    /// What happened.
    pub operation: WalOperation,
    /// Storage key of the mutated row.
    pub key: Vec<u8>,
    /// Serialized row body (JSON entity).
    pub value: Vec<u8>,
    /// Writer's modification time, microseconds UTC.
    pub timestamp: Timestamp,
    /// Peer that originated the write. Receivers never re-broadcast an
    /// entry whose source equals their own peer id.
    pub source_peer_id: String,
}

impl WalEntry {
    /// Returns true if `self` wins a last-write-wins conflict against
    /// `(other_timestamp, other_peer)` for the same key.
    ///
    /// Later timestamp wins; on a tie the lexicographically greater peer id
    /// wins, so every node picks the same survivor.
    pub fn wins_against(&self, other_timestamp: Timestamp, other_peer: &str) -> bool {
        match self.timestamp.cmp(&other_timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.source_peer_id.as_str() > other_peer,
        }
    }
}
