//! Schema registry: JSON-Schema-governed record types.
//!
//! Every record written to the store conforms to a registered schema. A
//! schema carries its JSON Schema document plus derived descriptors the rest
//! of the engine consumes: the key field (deterministic id derivation), the
//! indexed fields (secondary index postings) and the embedding fields
//! (vector index population).
//!
//! Built-in system schemas (`resources`, `entities`, `moments`, `agents`,
//! `sessions`, `messages`) are auto-registered with `category = "system"`.

mod builtin;

pub use builtin::builtin_schemas;

use std::collections::BTreeMap;

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{NotFoundError, RemDbError, Result, ValidationError};

/// Category for auto-registered system schemas.
pub const SYSTEM_CATEGORY: &str = "system";

/// The categories every registry knows about, in listing order.
pub const KNOWN_CATEGORIES: &[&str] = &["system", "agents", "public", "user"];

/// One embedding-bearing field and the provider its vectors come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingField {
    /// Property holding the source text.
    pub field: String,
    /// Provider registry name (fixes dimension and metric).
    pub provider: String,
}

/// A registered schema: identity, JSON Schema document, derived descriptors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Fully qualified name, unique across the registry (`category.short`).
    pub name: String,

    /// Short name, also unique; what queries and records reference.
    pub short_name: String,

    /// Category grouping (`system`, `agents`, `public`, `user`).
    pub category: String,

    /// Property whose value derives the deterministic entity id. Records
    /// missing the property fall back to random ids.
    pub key_field: Option<String>,

    /// Properties maintained in the secondary index.
    pub indexed_fields: Vec<String>,

    /// Properties fed to the embedding pipeline, at most two (the default
    /// and alternative slots).
    pub embedding_fields: Vec<EmbeddingField>,

    /// The JSON Schema document records are validated against.
    pub json_schema: Value,
}

impl SchemaDefinition {
    /// Builds a user-category definition with the given descriptors.
    pub fn new(short_name: impl Into<String>, json_schema: Value) -> Self {
        let short_name = short_name.into();
        Self {
            name: format!("user.{}", short_name),
            short_name,
            category: "user".to_string(),
            key_field: None,
            indexed_fields: Vec::new(),
            embedding_fields: Vec::new(),
            json_schema,
        }
    }

    /// Sets the key field for deterministic id derivation.
    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = Some(field.into());
        self
    }

    /// Sets the indexed fields.
    pub fn with_indexed_fields(mut self, fields: Vec<String>) -> Self {
        self.indexed_fields = fields;
        self
    }

    /// Sets the embedding fields.
    pub fn with_embedding_fields(mut self, fields: Vec<EmbeddingField>) -> Self {
        self.embedding_fields = fields;
        self
    }

    /// Returns true if `field` is declared indexed.
    pub fn is_indexed(&self, field: &str) -> bool {
        self.indexed_fields.iter().any(|f| f == field)
    }

    /// Returns the embedding binding for `field`, if declared.
    pub fn embedding_field(&self, field: &str) -> Option<&EmbeddingField> {
        self.embedding_fields.iter().find(|e| e.field == field)
    }
}

/// A schema plus its compiled validator.
struct CompiledSchema {
    definition: SchemaDefinition,
    validator: JSONSchema,
}

/// In-memory registry of schemas for one tenant.
///
/// The registry itself is storage-agnostic: [`crate::RemDb`] persists
/// definitions through the storage layer and rehydrates the registry on
/// open via [`SchemaRegistry::from_definitions`].
pub struct SchemaRegistry {
    /// Keyed by short name; FQN uniqueness is enforced on registration.
    schemas: BTreeMap<String, CompiledSchema>,
}

impl SchemaRegistry {
    /// Creates a registry pre-loaded with the built-in system schemas.
    ///
    /// `default_provider` is bound to every builtin embedding field.
    pub fn with_builtins(default_provider: &str) -> Result<Self> {
        let mut registry = Self {
            schemas: BTreeMap::new(),
        };
        for definition in builtin_schemas(default_provider) {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    /// Rehydrates a registry from persisted definitions.
    ///
    /// Builtins are registered first so user definitions with the same
    /// short name (persisted overrides) win.
    pub fn from_definitions(
        default_provider: &str,
        definitions: Vec<SchemaDefinition>,
    ) -> Result<Self> {
        let mut registry = Self::with_builtins(default_provider)?;
        for definition in definitions {
            registry.insert_compiled(definition)?;
        }
        Ok(registry)
    }

    /// Registers a schema, validating its JSON Schema document first.
    ///
    /// Rejects a conflicting FQN or short name, with one exception: a
    /// system schema may be overridden by a user registration of the same
    /// short name (specializing a builtin is how callers add key fields or
    /// indexes to `sessions` and friends).
    pub fn register(&mut self, definition: SchemaDefinition) -> Result<()> {
        if definition.short_name.is_empty() {
            return Err(ValidationError::required_field("short_name").into());
        }
        if definition.short_name.contains('/') || definition.name.contains('/') {
            return Err(ValidationError::invalid_field(
                "name",
                "must not contain '/' (reserved as key separator)",
            )
            .into());
        }
        if definition.embedding_fields.len() > 2 {
            return Err(ValidationError::invalid_field(
                "embedding_fields",
                "at most two embedding fields (default and alternative slots)",
            )
            .into());
        }

        if let Some(existing) = self.schemas.get(&definition.short_name) {
            if existing.definition.category != SYSTEM_CATEGORY {
                return Err(ValidationError::schema_conflict(format!(
                    "short name '{}' already registered as '{}'",
                    definition.short_name, existing.definition.name
                ))
                .into());
            }
        }
        if self
            .schemas
            .values()
            .any(|s| s.definition.name == definition.name && s.definition.short_name != definition.short_name)
        {
            return Err(ValidationError::schema_conflict(format!(
                "fully qualified name '{}' already registered",
                definition.name
            ))
            .into());
        }

        self.insert_compiled(definition)
    }

    fn insert_compiled(&mut self, definition: SchemaDefinition) -> Result<()> {
        let validator = JSONSchema::compile(&definition.json_schema).map_err(|e| {
            RemDbError::from(ValidationError::invalid_field(
                "json_schema",
                format!("not a valid JSON Schema: {}", e),
            ))
        })?;

        debug!(schema = %definition.short_name, category = %definition.category, "Schema registered");
        self.schemas.insert(
            definition.short_name.clone(),
            CompiledSchema {
                definition,
                validator,
            },
        );
        Ok(())
    }

    /// Looks up a schema by short name or fully qualified name.
    pub fn get(&self, name: &str) -> Result<&SchemaDefinition> {
        if let Some(schema) = self.schemas.get(name) {
            return Ok(&schema.definition);
        }
        self.schemas
            .values()
            .map(|s| &s.definition)
            .find(|d| d.name == name)
            .ok_or_else(|| NotFoundError::schema(name).into())
    }

    /// Lists registered short names, optionally filtered by category.
    pub fn list(&self, category: Option<&str>) -> Vec<String> {
        self.schemas
            .values()
            .filter(|s| category.map_or(true, |c| s.definition.category == c))
            .map(|s| s.definition.short_name.clone())
            .collect()
    }

    /// Returns all categories the registry recognizes.
    pub fn categories(&self) -> Vec<String> {
        KNOWN_CATEGORIES.iter().map(|c| c.to_string()).collect()
    }

    /// Returns every definition, for persistence.
    pub fn definitions(&self) -> Vec<SchemaDefinition> {
        self.schemas
            .values()
            .map(|s| s.definition.clone())
            .collect()
    }

    /// Validates a record against its schema.
    ///
    /// Fails with the first offending field and constraint, which is what
    /// callers see as a `SchemaViolation`.
    pub fn validate(&self, schema_name: &str, record: &Map<String, Value>) -> Result<()> {
        let compiled = self
            .schemas
            .get(schema_name)
            .ok_or_else(|| RemDbError::from(NotFoundError::schema(schema_name)))?;

        let instance = Value::Object(record.clone());
        let result = compiled.validator.validate(&instance);
        if let Err(mut errors) = result {
            if let Some(first) = errors.next() {
                let field = first.instance_path.to_string();
                let field = if field.is_empty() {
                    "<record>".to_string()
                } else {
                    field.trim_start_matches('/').replace('/', ".")
                };
                return Err(ValidationError::schema_violation(
                    schema_name,
                    field,
                    first.to_string(),
                )
                .into());
            }
        }
        Ok(())
    }
}
