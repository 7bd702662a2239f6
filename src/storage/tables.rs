//! Table definitions, key composition and index value encoding.
//!
//! redb tables play the role of column families: `entities` holds bodies,
//! `key_index` maps derived keys to ids, `secondary` holds field postings,
//! `embeddings` the raw vectors, `wal` the replication log. All keys are
//! `tenant/...` byte strings; numeric sub-keys are big-endian so that
//! lexicographic byte order matches numeric order and prefix scans stay
//! contiguous.
//!
//! # Table Layout
//!
//! ```text
//! entities         tenant/schema/<id:16>            -> JSON entity body
//! id_index         tenant/<id:16>                   -> schema short name
//! key_index        tenant/schema/<key value>        -> id (16 bytes)
//! secondary (mm)   tenant/schema/field/<enc value>  -> id (16 bytes)
//! embeddings       tenant/schema/field/<id:16>      -> f32 LE bytes
//! embedding_queue  tenant/schema/<id:16>/field      -> bincode EmbedJob
//! hnsw_meta        tenant/schema/field              -> JSON index metadata
//! wal              tenant/tablespace/<seq:8 BE>     -> bincode WalEntry
//! wal_meta         "seq/..." | "watermark/..."      -> u64
//! schemas          short_name                       -> JSON SchemaDefinition
//! metadata         "db_metadata"                    -> bincode DatabaseMetadata
//! ```

use redb::{MultimapTableDefinition, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EntityId, Timestamp};

/// Current storage layout version.
///
/// Increment on breaking changes; the database refuses to open on mismatch.
pub const LAYOUT_VERSION: u32 = 1;

/// Entity bodies, JSON-serialized.
pub const ENTITIES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entities");

/// Canonical id to schema resolution (`get(id)` without a schema).
pub const ID_INDEX_TABLE: TableDefinition<&[u8], &str> = TableDefinition::new("id_index");

/// Derived key to canonical id (the LOOKUP fast path).
pub const KEY_INDEX_TABLE: TableDefinition<&[u8], &[u8; 16]> = TableDefinition::new("key_index");

/// Field-value postings. Multimap so one value maps to many entity ids.
pub const SECONDARY_TABLE: MultimapTableDefinition<&[u8], &[u8; 16]> =
    MultimapTableDefinition::new("secondary");

/// Embedding vectors, stored as raw little-endian f32 bytes.
pub const EMBEDDINGS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("embeddings");

/// Durable embedding work queue; drained by the worker, survives restarts.
pub const EMBEDDING_QUEUE_TABLE: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("embedding_queue");

/// Per-(schema, field) HNSW metadata (deleted set, id mappings).
pub const HNSW_META_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("hnsw_meta");

/// The write-ahead log.
pub const WAL_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("wal");

/// WAL positions: local next-seq counters and per-peer watermarks.
pub const WAL_META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("wal_meta");

/// Persisted schema definitions (JSON), keyed by short name.
pub const SCHEMAS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("schemas");

/// Database-level metadata.
pub const METADATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");

/// Metadata key in the metadata table.
pub const METADATA_KEY: &str = "db_metadata";

// ============================================================================
// Database Metadata
// ============================================================================

/// Database metadata stored under [`METADATA_KEY`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    /// Layout version for compatibility checking.
    pub layout_version: u32,

    /// Tenant this database file is scoped to.
    pub tenant_id: String,

    /// Timestamp when the database was created.
    pub created_at: Timestamp,

    /// Last time the database was opened (updated on each open).
    pub last_opened_at: Timestamp,
}

impl DatabaseMetadata {
    /// Creates new metadata for a fresh database.
    pub fn new(tenant_id: &str) -> Self {
        let now = Timestamp::now();
        Self {
            layout_version: LAYOUT_VERSION,
            tenant_id: tenant_id.to_string(),
            created_at: now,
            last_opened_at: now,
        }
    }

    /// Updates the last_opened_at timestamp.
    pub fn touch(&mut self) {
        self.last_opened_at = Timestamp::now();
    }
}

// ============================================================================
// Key Composition
// ============================================================================

const SEP: u8 = b'/';

fn push_segment(key: &mut Vec<u8>, segment: &str) {
    key.extend_from_slice(segment.as_bytes());
    key.push(SEP);
}

/// `tenant/schema/<id bytes>` — primary key of an entity body.
pub fn entity_key(tenant: &str, schema: &str, id: EntityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant.len() + schema.len() + 18);
    push_segment(&mut key, tenant);
    push_segment(&mut key, schema);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Prefix covering every entity of one schema.
pub fn entity_prefix(tenant: &str, schema: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant.len() + schema.len() + 2);
    push_segment(&mut key, tenant);
    push_segment(&mut key, schema);
    key
}

/// Prefix covering every entity of one tenant.
pub fn tenant_prefix(tenant: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant.len() + 1);
    push_segment(&mut key, tenant);
    key
}

/// Splits an entity key back into `(schema, id)`.
///
/// The id is the fixed-width suffix, so schema names never ambiguate even
/// though id bytes may contain the separator.
pub fn split_entity_key(tenant: &str, key: &[u8]) -> Option<(String, EntityId)> {
    let prefix_len = tenant.len() + 1;
    if key.len() < prefix_len + 17 {
        return None;
    }
    let rest = &key[prefix_len..];
    let id_start = rest.len() - 16;
    // schema segment ends with the separator right before the id bytes
    let schema = std::str::from_utf8(&rest[..id_start - 1]).ok()?;
    let mut id = [0u8; 16];
    id.copy_from_slice(&rest[id_start..]);
    Some((schema.to_string(), EntityId::from_bytes(id)))
}

/// `tenant/<id bytes>` — id to schema resolution.
pub fn id_index_key(tenant: &str, id: EntityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant.len() + 17);
    push_segment(&mut key, tenant);
    key.extend_from_slice(id.as_bytes());
    key
}

/// `tenant/schema/<key value>` — derived key lookup.
pub fn key_index_key(tenant: &str, schema: &str, key_value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant.len() + schema.len() + key_value.len() + 2);
    push_segment(&mut key, tenant);
    push_segment(&mut key, schema);
    key.extend_from_slice(key_value.as_bytes());
    key
}

/// `tenant/schema/field/<encoded value>` — secondary index posting key.
pub fn posting_key(tenant: &str, schema: &str, field: &str, encoded_value: &[u8]) -> Vec<u8> {
    let mut key =
        Vec::with_capacity(tenant.len() + schema.len() + field.len() + encoded_value.len() + 3);
    push_segment(&mut key, tenant);
    push_segment(&mut key, schema);
    push_segment(&mut key, field);
    key.extend_from_slice(encoded_value);
    key
}

/// Prefix covering every posting of one field.
pub fn posting_prefix(tenant: &str, schema: &str, field: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant.len() + schema.len() + field.len() + 3);
    push_segment(&mut key, tenant);
    push_segment(&mut key, schema);
    push_segment(&mut key, field);
    key
}

/// `tenant/schema/field/<id bytes>` — embedding vector key.
pub fn embedding_key(tenant: &str, schema: &str, field: &str, id: EntityId) -> Vec<u8> {
    let mut key = posting_prefix(tenant, schema, field);
    key.extend_from_slice(id.as_bytes());
    key
}

/// `tenant/schema/<id bytes>/field` — embedding queue key.
pub fn queue_key(tenant: &str, schema: &str, id: EntityId, field: &str) -> Vec<u8> {
    let mut key = entity_key(tenant, schema, id);
    key.push(SEP);
    key.extend_from_slice(field.as_bytes());
    key
}

/// `tenant/schema/field` — HNSW metadata key.
pub fn hnsw_meta_key(tenant: &str, schema: &str, field: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant.len() + schema.len() + field.len() + 2);
    push_segment(&mut key, tenant);
    push_segment(&mut key, schema);
    key.extend_from_slice(field.as_bytes());
    key
}

/// `tenant/tablespace/<seq BE>` — WAL entry key.
pub fn wal_key(tenant: &str, tablespace: &str, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant.len() + tablespace.len() + 10);
    push_segment(&mut key, tenant);
    push_segment(&mut key, tablespace);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Prefix covering one tenant/tablespace WAL stream.
pub fn wal_prefix(tenant: &str, tablespace: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant.len() + tablespace.len() + 2);
    push_segment(&mut key, tenant);
    push_segment(&mut key, tablespace);
    key
}

/// wal_meta key for the local seq counter of a tenant/tablespace stream.
pub fn seq_meta_key(tenant: &str, tablespace: &str) -> String {
    format!("seq/{}/{}", tenant, tablespace)
}

/// wal_meta key for a peer's applied watermark.
pub fn watermark_meta_key(peer: &str, tenant: &str, tablespace: &str) -> String {
    format!("watermark/{}/{}/{}", peer, tenant, tablespace)
}

/// The smallest key strictly greater than every key with `prefix`.
///
/// Used as the exclusive upper bound of prefix range scans. Returns `None`
/// for a prefix of all 0xFF bytes (scan to the end instead).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

// ============================================================================
// Index Value Encoding
// ============================================================================

// Type tags order null < bool < integer < float < string; within a tag the
// encoding is order-preserving, so range scans over postings are contiguous.
const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STRING: u8 = 0x04;

/// Encodes a JSON value for use in a posting key.
///
/// Returns `None` for arrays and objects, which are not indexable.
pub fn encode_index_value(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Null => Some(vec![TAG_NULL]),
        Value::Bool(b) => Some(vec![TAG_BOOL, u8::from(*b)]),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let mut out = Vec::with_capacity(9);
                out.push(TAG_INT);
                // Flip the sign bit so negative values sort before positive
                out.extend_from_slice(&((i as u64) ^ (1u64 << 63)).to_be_bytes());
                Some(out)
            } else {
                let f = n.as_f64()?;
                let bits = f.to_bits();
                // IEEE-754 total order: positive floats flip the sign bit,
                // negative floats flip every bit
                let ordered = if bits >> 63 == 0 {
                    bits ^ (1u64 << 63)
                } else {
                    !bits
                };
                let mut out = Vec::with_capacity(9);
                out.push(TAG_FLOAT);
                out.extend_from_slice(&ordered.to_be_bytes());
                Some(out)
            }
        }
        Value::String(s) => {
            let mut out = Vec::with_capacity(1 + s.len());
            out.push(TAG_STRING);
            out.extend_from_slice(s.as_bytes());
            Some(out)
        }
        Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_key_roundtrip() {
        let id = EntityId::new();
        let key = entity_key("t1", "resources", id);
        let (schema, decoded) = split_entity_key("t1", &key).unwrap();
        assert_eq!(schema, "resources");
        assert_eq!(decoded, id);
    }

    #[test]
    fn test_entity_key_ordering_by_prefix() {
        let prefix = entity_prefix("t1", "resources");
        let key = entity_key("t1", "resources", EntityId::new());
        assert!(key.starts_with(&prefix));
        // A different schema never shares the prefix
        let other = entity_key("t1", "sessions", EntityId::new());
        assert!(!other.starts_with(&prefix));
    }

    #[test]
    fn test_prefix_end_bounds_scan() {
        let prefix = entity_prefix("t1", "resources");
        let end = prefix_end(&prefix).unwrap();
        let key = entity_key("t1", "resources", EntityId::new());
        assert!(prefix.as_slice() <= key.as_slice());
        assert!(key.as_slice() < end.as_slice());
    }

    #[test]
    fn test_prefix_end_all_ff() {
        assert_eq!(prefix_end(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn test_wal_key_ordering() {
        let k1 = wal_key("t1", "entities", 1);
        let k2 = wal_key("t1", "entities", 2);
        let k10 = wal_key("t1", "entities", 10);
        assert!(k1 < k2);
        assert!(k2 < k10, "big-endian seq must order numerically");
    }

    #[test]
    fn test_encode_int_ordering() {
        let values = [-100i64, -1, 0, 1, 100];
        let encoded: Vec<_> = values
            .iter()
            .map(|v| encode_index_value(&json!(v)).unwrap())
            .collect();
        for window in encoded.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn test_encode_float_ordering() {
        let values = [-2.5f64, -0.1, 0.0, 0.1, 2.5];
        let encoded: Vec<_> = values
            .iter()
            .map(|v| encode_index_value(&json!(v)).unwrap())
            .collect();
        for window in encoded.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn test_encode_string_ordering() {
        let a = encode_index_value(&json!("apple")).unwrap();
        let b = encode_index_value(&json!("banana")).unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_encode_rejects_containers() {
        assert!(encode_index_value(&json!([1, 2])).is_none());
        assert!(encode_index_value(&json!({"a": 1})).is_none());
    }

    #[test]
    fn test_metadata_touch() {
        let mut meta = DatabaseMetadata::new("t1");
        let original = meta.last_opened_at;
        std::thread::sleep(std::time::Duration::from_millis(1));
        meta.touch();
        assert!(meta.last_opened_at > original);
    }
}
