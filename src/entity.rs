//! The universal entity record and its inline edges.
//!
//! Resources, Entities, Moments, Sessions, Messages and Agents are all the
//! same record shape; the schema registry decides what their `properties`
//! may contain. Edges are owned by their source entity and stored inline
//! with the body, so graph traversal never needs a separate edge table.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, ValidationError};
use crate::types::{EntityId, Timestamp};

/// Property name used to surface permanent embedding failures.
///
/// Set by the embedding worker when a provider keeps failing after retries;
/// never blocks the write that queued the embedding.
pub const EMBEDDING_ERROR_PROPERTY: &str = "embedding_error";

/// Default embedding slot on entity bodies.
pub const EMBEDDING_FIELD: &str = "embedding";
/// Alternative (higher quality) embedding slot.
pub const EMBEDDING_ALT_FIELD: &str = "embedding_alt";

/// Slot property for the n-th embedding field a schema declares.
///
/// Vectors live in these slots; the declared field names the source text.
pub fn embedding_slot(index: usize) -> &'static str {
    if index == 0 {
        EMBEDDING_FIELD
    } else {
        EMBEDDING_ALT_FIELD
    }
}

/// The universal record.
///
/// `properties` is schema-validated JSON; system fields live beside it.
/// A present `deleted_at` means the entity is soft-deleted: still readable
/// by id, elided from scans and search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Opaque 128-bit identifier, unique within `(tenant, schema)`.
    pub id: EntityId,

    /// Short name of the registered schema this record conforms to.
    pub schema: String,

    /// Field name to JSON value mapping, validated against the schema.
    pub properties: Map<String, Value>,

    /// Creation time (microseconds UTC). Never changes after the first
    /// upsert, even across replicas.
    pub created_at: Timestamp,

    /// Last modification time; equals `created_at` for fresh entities.
    pub modified_at: Timestamp,

    /// Soft-delete marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<Timestamp>,

    /// Outgoing edges, owned by this entity.
    #[serde(default)]
    pub edges: Vec<Edge>,

    /// Peer that last wrote this version. Replication's last-write-wins
    /// tiebreak compares this when timestamps collide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_peer: Option<String>,
}

impl Entity {
    /// Creates a fresh entity with both timestamps set to now.
    pub fn new(id: EntityId, schema: impl Into<String>, properties: Map<String, Value>) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            schema: schema.into(),
            properties,
            created_at: now,
            modified_at: now,
            deleted_at: None,
            edges: Vec::new(),
            source_peer: None,
        }
    }

    /// Returns true if the entity is soft-deleted.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns a property value by name, if present.
    #[inline]
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Resolves a field for predicate evaluation.
    ///
    /// System fields (`id`, `schema`, `created_at`, `modified_at`) resolve
    /// before properties, mirroring how predicates address records.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.to_string())),
            "schema" => Some(Value::String(self.schema.clone())),
            "created_at" => Some(Value::from(self.created_at.as_micros())),
            "modified_at" => Some(Value::from(self.modified_at.as_micros())),
            _ => self.properties.get(name).cloned(),
        }
    }

    /// Validates the structural invariants every persisted entity holds.
    ///
    /// - `created_at <= modified_at`
    /// - `deleted_at`, if present, is `>= created_at`
    /// - every edge's `src` equals this entity's id and has a non-empty
    ///   `rel_type`
    pub fn check_invariants(&self) -> Result<()> {
        if self.modified_at < self.created_at {
            return Err(ValidationError::invalid_field(
                "modified_at",
                "must not precede created_at",
            )
            .into());
        }
        if let Some(deleted_at) = self.deleted_at {
            if deleted_at < self.created_at {
                return Err(ValidationError::invalid_field(
                    "deleted_at",
                    "must not precede created_at",
                )
                .into());
            }
        }
        for edge in &self.edges {
            if edge.src != self.id {
                return Err(ValidationError::invalid_field(
                    "edges",
                    format!("edge src {} does not match entity id {}", edge.src, self.id),
                )
                .into());
            }
            if edge.rel_type.is_empty() {
                return Err(ValidationError::required_field("edges[].rel_type").into());
            }
        }
        Ok(())
    }

    /// Converts the entity into its external JSON representation.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A typed, directed edge from its owning entity to another.
///
/// The destination is a weak reference: a lookup target, never ownership.
/// Deleting the destination does not touch the edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source entity id; always the id of the entity carrying this edge.
    pub src: EntityId,

    /// Destination entity id.
    pub dst: EntityId,

    /// Relationship type, e.g. `"references"`. Never empty.
    pub rel_type: String,

    /// Free-form edge properties.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,

    /// When the edge was created.
    pub created_at: Timestamp,
}

impl Edge {
    /// Creates an edge between two entities.
    pub fn new(src: EntityId, dst: EntityId, rel_type: impl Into<String>) -> Self {
        Self {
            src,
            dst,
            rel_type: rel_type.into(),
            properties: Map::new(),
            created_at: Timestamp::now(),
        }
    }
}

/// Edge direction selector for graph traversal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Follow edges away from the node (`src == node`).
    Out,
    /// Follow edges pointing at the node (`dst == node`).
    In,
    /// Follow edges in both directions.
    Both,
}

impl Direction {
    /// Parses a direction keyword as used in REM-SQL (`in|out|both`).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "out" => Some(Self::Out),
            "in" => Some(Self::In),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    /// The REM-SQL keyword for this direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Out => "out",
            Self::In => "in",
            Self::Both => "both",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_new_entity_timestamps() {
        let entity = Entity::new(EntityId::new(), "resources", Map::new());
        assert_eq!(entity.created_at, entity.modified_at);
        assert!(entity.deleted_at.is_none());
        assert!(entity.edges.is_empty());
        assert!(entity.check_invariants().is_ok());
    }

    #[test]
    fn test_field_resolution_order() {
        let mut entity = Entity::new(
            EntityId::new(),
            "resources",
            props(&[("name", json!("doc"))]),
        );
        entity.properties.insert("extra".into(), json!(42));

        assert_eq!(entity.field("name"), Some(json!("doc")));
        assert_eq!(entity.field("extra"), Some(json!(42)));
        assert_eq!(entity.field("schema"), Some(json!("resources")));
        assert_eq!(entity.field("missing"), None);
    }

    #[test]
    fn test_invariant_modified_before_created() {
        let mut entity = Entity::new(EntityId::new(), "resources", Map::new());
        entity.modified_at = Timestamp::from_micros(entity.created_at.as_micros() - 1);
        assert!(entity.check_invariants().is_err());
    }

    #[test]
    fn test_invariant_deleted_before_created() {
        let mut entity = Entity::new(EntityId::new(), "resources", Map::new());
        entity.deleted_at = Some(Timestamp::from_micros(entity.created_at.as_micros() - 1));
        assert!(entity.check_invariants().is_err());
    }

    #[test]
    fn test_invariant_edge_src_mismatch() {
        let mut entity = Entity::new(EntityId::new(), "resources", Map::new());
        entity
            .edges
            .push(Edge::new(EntityId::new(), EntityId::new(), "references"));
        assert!(entity.check_invariants().is_err());
    }

    #[test]
    fn test_invariant_empty_rel_type() {
        let mut entity = Entity::new(EntityId::new(), "resources", Map::new());
        entity.edges.push(Edge::new(entity.id, EntityId::new(), ""));
        assert!(entity.check_invariants().is_err());
    }

    #[test]
    fn test_entity_json_roundtrip() {
        let mut entity = Entity::new(
            EntityId::new(),
            "resources",
            props(&[("name", json!("doc")), ("count", json!(3))]),
        );
        entity
            .edges
            .push(Edge::new(entity.id, EntityId::new(), "references"));

        let bytes = serde_json::to_vec(&entity).unwrap();
        let restored: Entity = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(entity, restored);
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!(Direction::parse("OUT"), Some(Direction::Out));
        assert_eq!(Direction::parse("in"), Some(Direction::In));
        assert_eq!(Direction::parse("Both"), Some(Direction::Both));
        assert_eq!(Direction::parse("sideways"), None);
    }
}
