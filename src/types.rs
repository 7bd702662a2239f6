//! Core type definitions for REM database identifiers and timestamps.
//!
//! Entity ids are UUIDs. Schemas with a `key_field` derive their ids
//! deterministically (UUID v5 over `tenant/schema/key`), which is what makes
//! upserts idempotent; schemas without one get random v4 ids.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Namespace for deterministic entity id derivation.
///
/// Fixed so that the same `(tenant, schema, key_value)` triple derives the
/// same id on every node, which replication relies on for convergence.
const ENTITY_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8f, 0x1d, 0x6a, 0x42, 0x7c, 0x3b, 0x45, 0xe9, 0x9a, 0x50, 0x2d, 0x81, 0xbe, 0x6f, 0x04,
    0x37,
]);

/// Entity identifier.
///
/// # Example
/// ```
/// use remdb::EntityId;
///
/// let random = EntityId::new();
/// let derived = EntityId::derive("tenant-a", "sessions", "s1");
/// assert_eq!(derived, EntityId::derive("tenant-a", "sessions", "s1"));
/// assert_ne!(random, derived);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Creates a new random EntityId (UUID v4).
    #[inline]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derives a deterministic EntityId from a key field value.
    ///
    /// Uses UUID v5 (SHA-1 namespaced) over `tenant/schema/key`, so repeated
    /// upserts of the same key resolve to the same entity.
    pub fn derive(tenant: &str, schema: &str, key_value: &str) -> Self {
        let name = format!("{}/{}/{}", tenant, schema, key_value);
        Self(Uuid::new_v5(&ENTITY_NAMESPACE, name.as_bytes()))
    }

    /// Creates a nil (all zeros) EntityId. Useful for sentinels in tests.
    #[inline]
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Returns the raw UUID bytes for storage keys.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Creates an EntityId from raw bytes.
    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for EntityId {
    /// Returns a nil EntityId. For a new unique id, use [`EntityId::new()`].
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unix timestamp in microseconds UTC.
///
/// Microsecond precision matches the WAL wire format; big-endian encoding
/// makes lexicographic byte order agree with numeric order in index keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Creates a timestamp for the current moment.
    ///
    /// If the system clock is before the Unix epoch (should never happen in
    /// practice), returns the epoch rather than panicking.
    #[inline]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_micros() as i64)
    }

    /// Creates a timestamp from Unix microseconds.
    #[inline]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Returns the timestamp as Unix microseconds.
    #[inline]
    pub const fn as_micros(&self) -> i64 {
        self.0
    }

    /// Returns big-endian bytes for storage (enables lexicographic ordering).
    #[inline]
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque tenant identifier.
///
/// Every key, index and replication stream is partitioned by tenant. The
/// core never reads or writes across tenants.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    /// Creates a new TenantId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the tenant id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replication peer identifier.
///
/// Carried on every WAL entry as `source_peer_id`; used for loop
/// suppression and as the last-write-wins tiebreak.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Creates a new PeerId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the peer id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Embedding vector type alias.
///
/// Embeddings are f32 vectors whose length is fixed by the provider.
pub type Embedding = Vec<f32>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_new_is_unique() {
        let id1 = EntityId::new();
        let id2 = EntityId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_entity_id_derive_is_deterministic() {
        let a = EntityId::derive("t1", "sessions", "s1");
        let b = EntityId::derive("t1", "sessions", "s1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_entity_id_derive_varies_by_component() {
        let base = EntityId::derive("t1", "sessions", "s1");
        assert_ne!(base, EntityId::derive("t2", "sessions", "s1"));
        assert_ne!(base, EntityId::derive("t1", "messages", "s1"));
        assert_ne!(base, EntityId::derive("t1", "sessions", "s2"));
    }

    #[test]
    fn test_entity_id_bytes_roundtrip() {
        let id = EntityId::new();
        let bytes = *id.as_bytes();
        assert_eq!(id, EntityId::from_bytes(bytes));
    }

    #[test]
    fn test_entity_id_parse_roundtrip() {
        let id = EntityId::new();
        let parsed: EntityId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_entity_id_json_is_plain_string() {
        let id = EntityId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_timestamp_now_is_monotonic_enough() {
        let t1 = Timestamp::now();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let t2 = Timestamp::now();
        assert!(t1 < t2, "Timestamps should be ordered");
    }

    #[test]
    fn test_timestamp_be_bytes_ordering() {
        // Big-endian ensures lexicographic ordering matches numeric ordering
        let t1 = Timestamp::from_micros(100);
        let t2 = Timestamp::from_micros(200);
        assert!(t1.to_be_bytes() < t2.to_be_bytes());
    }

    #[test]
    fn test_tenant_id() {
        let id = TenantId::new("tenant-a");
        assert_eq!(id.as_str(), "tenant-a");
        assert_eq!(format!("{}", id), "tenant-a");
    }

    #[test]
    fn test_peer_id_ordering() {
        // Lexicographic order is the LWW tiebreak
        assert!(PeerId::new("instance-a") < PeerId::new("instance-b"));
    }
}
