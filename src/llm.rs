//! LLM boundary: chat completion trait plus edge extraction.
//!
//! The database core never talks to a model directly; it goes through the
//! [`ChatModel`] trait so tests inject canned models and deployments pick
//! their own backend. Calls are blocking with bounded timeouts, and every
//! caller treats the output as untrusted input.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{RemDbError, Result};

/// A chat completion backend.
///
/// Implementations must be `Send + Sync` and keep their own timeouts
/// bounded; a hung model call must not hang the database.
pub trait ChatModel: Send + Sync {
    /// Completes a prompt, returning the raw model text.
    fn complete(&self, system: &str, user: &str) -> Result<String>;

    /// Identifier for logs and health output.
    fn model_name(&self) -> &str {
        "unknown"
    }
}

/// OpenAI-compatible chat backend.
///
/// Reads the API key from `OPENAI_API_KEY`. Any HTTP or decode failure
/// surfaces as `ProviderUnavailable`, which callers recover from (the
/// planner degrades to rules, edge extraction reports the outage).
pub struct OpenAiChat {
    model: String,
    client: reqwest::blocking::Client,
    api_key: String,
}

impl OpenAiChat {
    /// Creates a backend for the given model identifier.
    pub fn new(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RemDbError::provider("OPENAI_API_KEY not set"))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| RemDbError::provider(e.to_string()))?;
        Ok(Self {
            model: model.into(),
            client,
            api_key,
        })
    }
}

impl ChatModel for OpenAiChat {
    fn complete(&self, system: &str, user: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct ApiResponse {
            choices: Vec<ApiChoice>,
        }
        #[derive(Deserialize)]
        struct ApiChoice {
            message: ApiMessage,
        }
        #[derive(Deserialize)]
        struct ApiMessage {
            content: String,
        }

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
            }))
            .send()
            .map_err(|e| RemDbError::provider(format!("chat request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(RemDbError::provider(format!(
                "chat backend returned {}",
                response.status()
            )));
        }

        let body: ApiResponse = response
            .json()
            .map_err(|e| RemDbError::provider(format!("chat response malformed: {}", e)))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| RemDbError::provider("chat backend returned no choices"))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Edge Extraction
// ============================================================================

/// One suggested relationship between named entities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuggestedEdge {
    /// Source entity, by name.
    pub src: String,
    /// Destination entity, by name.
    pub dst: String,
    /// Relationship type.
    pub rel_type: String,
    /// Model confidence in this edge.
    #[serde(default)]
    pub confidence: f32,
}

/// Result of LLM-assisted edge extraction. Advisory only: nothing is
/// written until the caller resolves names to ids and adds edges itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeExtraction {
    /// Suggested edges.
    pub edges: Vec<SuggestedEdge>,
    /// One-paragraph summary of the analyzed text.
    pub summary: String,
}

const EXTRACTION_PROMPT: &str = r#"Extract entity relationships from the text. Output ONLY a JSON object:
{"edges": [{"src": "name", "dst": "name", "rel_type": "verb_phrase", "confidence": 0.0-1.0}], "summary": "one paragraph"}
Use short snake_case rel_type values. Only include relationships stated in the text."#;

/// Extracts suggested edges from free text.
///
/// `context` describes where the text came from and is passed to the
/// model verbatim. Output is advisory; malformed model output surfaces as
/// `ProviderUnavailable` rather than a panic or partial write.
pub fn extract_edges(model: &dyn ChatModel, text: &str, context: &str) -> Result<EdgeExtraction> {
    let user = format!("Context: {}\n\nText:\n{}", context, text);
    let raw = model.complete(EXTRACTION_PROMPT, &user)?;

    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let mut extraction: EdgeExtraction = serde_json::from_str(cleaned)
        .map_err(|e| RemDbError::provider(format!("edge extraction output malformed: {}", e)))?;

    // Drop structurally useless suggestions instead of failing the batch
    extraction
        .edges
        .retain(|e| !e.src.is_empty() && !e.dst.is_empty() && !e.rel_type.is_empty());
    Ok(extraction)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedModel(String);
    impl ChatModel for CannedModel {
        fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_extract_edges_parses_model_output() {
        let canned = json!({
            "edges": [
                {"src": "alice", "dst": "acme", "rel_type": "works_at", "confidence": 0.9},
                {"src": "", "dst": "acme", "rel_type": "broken"},
            ],
            "summary": "Alice works at Acme."
        });
        let model = CannedModel(canned.to_string());
        let extraction = extract_edges(&model, "Alice works at Acme.", "test").unwrap();
        // The empty-src suggestion is dropped, not fatal
        assert_eq!(extraction.edges.len(), 1);
        assert_eq!(extraction.edges[0].rel_type, "works_at");
        assert_eq!(extraction.summary, "Alice works at Acme.");
    }

    #[test]
    fn test_extract_edges_fenced_output() {
        let canned = format!(
            "```json\n{}\n```",
            json!({"edges": [], "summary": "nothing"})
        );
        let model = CannedModel(canned);
        let extraction = extract_edges(&model, "text", "ctx").unwrap();
        assert!(extraction.edges.is_empty());
    }

    #[test]
    fn test_extract_edges_malformed_output() {
        let model = CannedModel("I could not find any edges, sorry!".to_string());
        let err = extract_edges(&model, "text", "ctx").unwrap_err();
        assert_eq!(err.code(), "provider_unavailable");
    }
}
