//! Built-in system schemas.
//!
//! These are the record families the database ships with: resources,
//! generic entities, moments, agents, sessions and messages. All are
//! auto-registered under `category = "system"` when a registry is created.
//! Additional properties are allowed everywhere; the documents below pin
//! down the shapes the engine itself relies on.

use serde_json::json;

use super::{EmbeddingField, SchemaDefinition, SYSTEM_CATEGORY};

fn system(definition: SchemaDefinition) -> SchemaDefinition {
    let mut definition = definition;
    definition.category = SYSTEM_CATEGORY.to_string();
    definition.name = format!("{}.{}", SYSTEM_CATEGORY, definition.short_name);
    definition
}

/// Returns the built-in schema definitions, binding embedding fields to
/// `default_provider`.
pub fn builtin_schemas(default_provider: &str) -> Vec<SchemaDefinition> {
    let bind = |field: &str| EmbeddingField {
        field: field.to_string(),
        provider: default_provider.to_string(),
    };

    vec![
        // Resources: addressable content with optional dual embeddings.
        system(
            SchemaDefinition::new(
                "resources",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "uri": {"type": "string"},
                        "content": {"type": "string"},
                        "category": {"type": "string"},
                        "metadata": {"type": "object"},
                        "embedding": {"type": "array", "items": {"type": "number"}},
                        "embedding_alt": {"type": "array", "items": {"type": "number"}}
                    },
                    "required": ["name"]
                }),
            )
            .with_indexed_fields(vec!["name".into(), "category".into(), "uri".into()])
            .with_embedding_fields(vec![bind("content")]),
        ),
        // Generic entities: named things with no further structure imposed.
        system(
            SchemaDefinition::new(
                "entities",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "category": {"type": "string"}
                    }
                }),
            )
            .with_indexed_fields(vec!["name".into(), "category".into()]),
        ),
        // Moments: timestamped observations.
        system(
            SchemaDefinition::new(
                "moments",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "content": {"type": "string"},
                        "occurred_at": {"type": "integer"}
                    }
                }),
            )
            .with_indexed_fields(vec!["name".into()])
            .with_embedding_fields(vec![bind("content")]),
        ),
        // Agents: agent-let contracts. Unique by name.
        system(
            SchemaDefinition::new(
                "agents",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "category": {"type": "string"},
                        "description": {"type": "string"},
                        "output_schema": {"type": "object"},
                        "tools": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "mcp_server": {"type": "string"},
                                    "tool_name": {"type": "string"},
                                    "usage": {"type": "string"}
                                }
                            }
                        }
                    },
                    "required": ["name"]
                }),
            )
            .with_key_field("name")
            .with_indexed_fields(vec!["name".into(), "category".into()]),
        ),
        // Sessions: group messages under an agent and originating query.
        system(
            SchemaDefinition::new(
                "sessions",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "name": {"type": "string"},
                        "query": {"type": "string"},
                        "agent": {"type": "string"},
                        "session_type": {"type": "string"}
                    }
                }),
            )
            .with_key_field("session_id")
            .with_indexed_fields(vec!["session_id".into(), "agent".into(), "name".into()]),
        ),
        // Messages: conversation turns within a session.
        system(
            SchemaDefinition::new(
                "messages",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "role": {"type": "string", "enum": ["user", "assistant", "system", "tool"]},
                        "content": {"type": "string"},
                        "trace_id": {"type": "string"}
                    },
                    "required": ["session_id", "role", "content"]
                }),
            )
            .with_indexed_fields(vec!["session_id".into(), "role".into(), "trace_id".into()]),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_builtins_are_system() {
        for schema in builtin_schemas("builtin-hash") {
            assert_eq!(schema.category, SYSTEM_CATEGORY);
            assert_eq!(schema.name, format!("system.{}", schema.short_name));
        }
    }

    #[test]
    fn test_resources_descriptors() {
        let schemas = builtin_schemas("builtin-hash");
        let resources = schemas.iter().find(|s| s.short_name == "resources").unwrap();
        assert!(resources.is_indexed("category"));
        assert_eq!(
            resources.embedding_field("content").map(|e| e.provider.as_str()),
            Some("builtin-hash")
        );
        assert!(resources.key_field.is_none());
    }

    #[test]
    fn test_sessions_key_field() {
        let schemas = builtin_schemas("builtin-hash");
        let sessions = schemas.iter().find(|s| s.short_name == "sessions").unwrap();
        assert_eq!(sessions.key_field.as_deref(), Some("session_id"));
    }

    #[test]
    fn test_messages_role_enum() {
        let schemas = builtin_schemas("builtin-hash");
        let messages = schemas.iter().find(|s| s.short_name == "messages").unwrap();
        let roles = &messages.json_schema["properties"]["role"]["enum"];
        assert!(roles.as_array().unwrap().iter().any(|r| r == "tool"));
    }
}
