//! Embedding providers and the immutable provider registry.
//!
//! The registry is the single source of truth for vector dimensions: a
//! schema's embedding field is bound to one provider, and a vector whose
//! length disagrees with the provider's registered dimension is a
//! validation error everywhere (insert, search, replication apply).
//!
//! # Providers
//!
//! - [`HashEmbedding`] — deterministic token-hash vectors, no model files
//!   or network. The default for local development and tests.
//! - [`OpenAiEmbedding`] — `text-embedding-3-*` family over HTTPS.
//! - [`ExternalEmbedding`] — validation only; the caller supplies
//!   pre-computed vectors (sentence-transformers, Cohere, ...).

pub mod worker;

use serde::{Deserialize, Serialize};

use crate::error::{NotFoundError, RemDbError, Result, ValidationError};
use crate::types::Embedding;

/// Distance metric a provider's vectors are scored with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Cosine similarity; vectors are normalized on insertion.
    Cosine,
    /// Inner product; vectors arrive pre-normalized and are stored as-is.
    InnerProduct,
}

/// Registered embedding provider configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProviderSpec {
    /// Provider name as referenced by schemas.
    pub name: &'static str,
    /// Vector dimension every embedding must match.
    pub dimension: usize,
    /// Scoring metric.
    pub metric: Metric,
    /// Whether the provider emits unit-length vectors.
    pub normalized: bool,
}

/// The provider registry. Immutable: initialized once, read-only after.
pub const PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        name: "builtin-hash",
        dimension: 384,
        metric: Metric::Cosine,
        normalized: true,
    },
    // Sentence Transformers (local inference; vectors supplied externally)
    ProviderSpec {
        name: "all-MiniLM-L6-v2",
        dimension: 384,
        metric: Metric::Cosine,
        normalized: false,
    },
    ProviderSpec {
        name: "all-mpnet-base-v2",
        dimension: 768,
        metric: Metric::Cosine,
        normalized: false,
    },
    ProviderSpec {
        name: "paraphrase-MiniLM-L6-v2",
        dimension: 384,
        metric: Metric::Cosine,
        normalized: false,
    },
    // OpenAI - pre-normalized, scored with inner product
    ProviderSpec {
        name: "text-embedding-3-small",
        dimension: 1536,
        metric: Metric::InnerProduct,
        normalized: true,
    },
    ProviderSpec {
        name: "text-embedding-3-large",
        dimension: 3072,
        metric: Metric::InnerProduct,
        normalized: true,
    },
    ProviderSpec {
        name: "text-embedding-ada-002",
        dimension: 1536,
        metric: Metric::InnerProduct,
        normalized: true,
    },
    // Cohere
    ProviderSpec {
        name: "embed-english-v3.0",
        dimension: 1024,
        metric: Metric::Cosine,
        normalized: false,
    },
    ProviderSpec {
        name: "embed-multilingual-v3.0",
        dimension: 1024,
        metric: Metric::Cosine,
        normalized: false,
    },
];

/// Looks up a provider's registered configuration.
pub fn provider_spec(name: &str) -> Result<&'static ProviderSpec> {
    PROVIDERS
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| NotFoundError::provider(name).into())
}

/// Lists the registered provider names.
pub fn list_providers() -> Vec<&'static str> {
    PROVIDERS.iter().map(|p| p.name).collect()
}

/// Normalizes a vector to unit length. A zero vector is returned unchanged.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Embedding generation service.
///
/// Implementations must be `Send + Sync`; the worker calls them from its
/// own thread. Network providers keep their timeouts internal and bounded.
pub trait EmbeddingProvider: Send + Sync {
    /// The registry entry this provider implements.
    fn spec(&self) -> &ProviderSpec;

    /// Generates an embedding for a single text.
    fn embed(&self, text: &str) -> Result<Embedding>;

    /// Generates embeddings for multiple texts.
    ///
    /// The default loops over [`embed`](Self::embed); network providers
    /// override with a batched call.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Validates that a caller-supplied vector matches this provider.
    fn validate_dimension(&self, embedding: &[f32]) -> Result<()> {
        let expected = self.spec().dimension;
        if embedding.len() != expected {
            return Err(ValidationError::dimension_mismatch(expected, embedding.len()).into());
        }
        Ok(())
    }
}

/// Deterministic token-hash embeddings.
///
/// Tokenizes on non-alphanumeric boundaries, hashes each lowercased token
/// into a bucket (FNV-1a) and normalizes the resulting counts. Texts that
/// share vocabulary land near each other, which is enough signal for local
/// development and reproducible tests without model files.
#[derive(Clone, Debug)]
pub struct HashEmbedding {
    spec: &'static ProviderSpec,
}

impl HashEmbedding {
    /// Creates the builtin hash provider (384 dimensions).
    pub fn new() -> Self {
        // builtin-hash is the first registry entry
        Self { spec: &PROVIDERS[0] }
    }

    fn bucket(&self, token: &str) -> usize {
        // FNV-1a
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100_0000_01b3);
        }
        (hash % self.spec.dimension as u64) as usize
    }
}

impl Default for HashEmbedding {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingProvider for HashEmbedding {
    fn spec(&self) -> &ProviderSpec {
        self.spec
    }

    fn embed(&self, text: &str) -> Result<Embedding> {
        let mut vector = vec![0.0f32; self.spec.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            vector[self.bucket(&token)] += 1.0;
        }
        normalize(&mut vector);
        Ok(vector)
    }
}

/// External embedding provider: validation only.
///
/// Used for registry entries whose vectors are computed outside the
/// database (sentence-transformers, Cohere). Calling `embed` is an error;
/// callers supply vectors inline and the store validates dimensions.
#[derive(Clone, Debug)]
pub struct ExternalEmbedding {
    spec: &'static ProviderSpec,
}

impl ExternalEmbedding {
    /// Wraps a registry entry in a validate-only provider.
    pub fn new(spec: &'static ProviderSpec) -> Self {
        Self { spec }
    }
}

impl EmbeddingProvider for ExternalEmbedding {
    fn spec(&self) -> &ProviderSpec {
        self.spec
    }

    fn embed(&self, _text: &str) -> Result<Embedding> {
        Err(RemDbError::provider(format!(
            "provider '{}' does not generate embeddings; supply vectors with the record",
            self.spec.name
        )))
    }
}

/// OpenAI embedding provider (`text-embedding-3-*`, `ada-002`).
///
/// Reads the API key from `OPENAI_API_KEY`. Requests carry a bounded
/// timeout; failures surface as `ProviderUnavailable` and are retried by
/// the worker with backoff.
pub struct OpenAiEmbedding {
    spec: &'static ProviderSpec,
    client: reqwest::blocking::Client,
    api_key: String,
}

impl OpenAiEmbedding {
    /// Creates a provider for one of the OpenAI registry entries.
    pub fn new(spec: &'static ProviderSpec) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RemDbError::provider("OPENAI_API_KEY not set"))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| RemDbError::provider(e.to_string()))?;
        Ok(Self {
            spec,
            client,
            api_key,
        })
    }
}

impl EmbeddingProvider for OpenAiEmbedding {
    fn spec(&self) -> &ProviderSpec {
        self.spec
    }

    fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_batch(&[text])?.remove(0))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        #[derive(Deserialize)]
        struct ApiResponse {
            data: Vec<ApiEmbedding>,
        }
        #[derive(Deserialize)]
        struct ApiEmbedding {
            embedding: Vec<f32>,
        }

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.spec.name,
                "input": texts,
            }))
            .send()
            .map_err(|e| RemDbError::provider(format!("openai request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(RemDbError::provider(format!(
                "openai returned {}",
                response.status()
            )));
        }

        let body: ApiResponse = response
            .json()
            .map_err(|e| RemDbError::provider(format!("openai response malformed: {}", e)))?;

        if body.data.len() != texts.len() {
            return Err(RemDbError::provider(format!(
                "openai returned {} embeddings for {} inputs",
                body.data.len(),
                texts.len()
            )));
        }

        let mut out = Vec::with_capacity(body.data.len());
        for item in body.data {
            self.validate_dimension(&item.embedding)?;
            out.push(item.embedding);
        }
        Ok(out)
    }
}

/// Creates the provider implementation for a registry entry.
pub fn create_provider(name: &str) -> Result<Box<dyn EmbeddingProvider>> {
    let spec = provider_spec(name)?;
    match spec.name {
        "builtin-hash" => Ok(Box::new(HashEmbedding::new())),
        "text-embedding-3-small" | "text-embedding-3-large" | "text-embedding-ada-002" => {
            Ok(Box::new(OpenAiEmbedding::new(spec)?))
        }
        _ => Ok(Box::new(ExternalEmbedding::new(spec))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let spec = provider_spec("all-MiniLM-L6-v2").unwrap();
        assert_eq!(spec.dimension, 384);
        assert_eq!(spec.metric, Metric::Cosine);
        assert!(!spec.normalized);
    }

    #[test]
    fn test_registry_openai_is_inner_product() {
        let spec = provider_spec("text-embedding-3-small").unwrap();
        assert_eq!(spec.dimension, 1536);
        assert_eq!(spec.metric, Metric::InnerProduct);
        assert!(spec.normalized);
    }

    #[test]
    fn test_unknown_provider() {
        let err = provider_spec("made-up-model").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_list_providers_contains_builtin() {
        assert!(list_providers().contains(&"builtin-hash"));
    }

    #[test]
    fn test_hash_embedding_dimension_and_norm() {
        let provider = HashEmbedding::new();
        let vector = provider.embed("memory safety in systems languages").unwrap();
        assert_eq!(vector.len(), 384);
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedding_deterministic() {
        let provider = HashEmbedding::new();
        let a = provider.embed("rust systems programming").unwrap();
        let b = provider.embed("rust systems programming").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_embedding_shared_vocabulary_scores_higher() {
        let provider = HashEmbedding::new();
        let query = provider.embed("memory safety in systems languages").unwrap();
        let rust = provider.embed("Rust systems programming").unwrap();
        let python = provider.embed("Python data science").unwrap();

        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(
            dot(&query, &rust) > dot(&query, &python),
            "shared token 'systems' should pull the Rust text closer"
        );
        assert!(dot(&query, &rust) > 0.25);
    }

    #[test]
    fn test_hash_embedding_empty_text() {
        let provider = HashEmbedding::new();
        let vector = provider.embed("").unwrap();
        assert_eq!(vector.len(), 384);
        assert!(vector.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_external_embedding_rejects_generation() {
        let provider = ExternalEmbedding::new(provider_spec("all-MiniLM-L6-v2").unwrap());
        assert!(provider.embed("hello").is_err());
    }

    #[test]
    fn test_validate_dimension() {
        let provider = HashEmbedding::new();
        assert!(provider.validate_dimension(&vec![0.0; 384]).is_ok());
        let err = provider.validate_dimension(&vec![0.0; 10]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_normalize_zero_vector() {
        let mut vector = vec![0.0f32; 4];
        normalize(&mut vector);
        assert_eq!(vector, vec![0.0; 4]);
    }

    #[test]
    fn test_create_provider_builtin() {
        let provider = create_provider("builtin-hash").unwrap();
        assert_eq!(provider.spec().dimension, 384);
    }

    #[test]
    fn test_create_provider_external_family() {
        let provider = create_provider("embed-english-v3.0").unwrap();
        assert!(provider.embed("text").is_err());
        assert_eq!(provider.spec().dimension, 1024);
    }
}
