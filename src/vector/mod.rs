//! Vector index store: one HNSW graph per `(schema, embedding_field)`.
//!
//! Graphs are derived structures. The `embeddings` table is the source of
//! truth; on open every graph is rebuilt from it and the persisted
//! metadata restores the deleted set. Compaction rebuilds a graph in place
//! once its tombstone ratio crosses the configured threshold.

mod hnsw;

pub use hnsw::HnswIndex;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::config::HnswConfig;
use crate::embedding::provider_spec;
use crate::error::{RemDbError, Result};
use crate::schema::SchemaDefinition;
use crate::storage::Storage;
use crate::types::EntityId;

/// Key identifying one vector index.
type IndexKey = (String, String);

/// All vector indexes of one database instance.
pub struct VectorStore {
    indexes: RwLock<HashMap<IndexKey, Arc<HnswIndex>>>,
    config: HnswConfig,
}

impl VectorStore {
    /// Creates an empty vector store.
    pub fn new(config: HnswConfig) -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Rebuilds every index declared by the given schemas from storage.
    ///
    /// Indexes are keyed by embedding slot (`embedding`, `embedding_alt`),
    /// matching where the vectors live on entity bodies. Called on open;
    /// missing metadata means a fresh index, stored metadata restores the
    /// deleted set.
    pub fn load_all(&self, storage: &Storage, schemas: &[SchemaDefinition]) -> Result<()> {
        for schema in schemas {
            for (slot_index, binding) in schema.embedding_fields.iter().enumerate() {
                let slot = crate::entity::embedding_slot(slot_index);
                let spec = provider_spec(&binding.provider)?;
                let embeddings = storage.embeddings_for(&schema.short_name, slot)?;
                let count = embeddings.len();

                let index = HnswIndex::rebuild_from_embeddings(
                    spec.dimension,
                    spec.metric,
                    spec.normalized,
                    &self.config,
                    embeddings,
                )?;
                if let Some(bytes) = storage.load_hnsw_meta(&schema.short_name, slot)? {
                    index.restore_metadata(&bytes)?;
                }

                if count > 0 {
                    info!(
                        schema = %schema.short_name,
                        slot = %slot,
                        vectors = count,
                        "Rebuilt HNSW index from stored embeddings"
                    );
                }

                self.indexes
                    .write()
                    .map_err(|_| RemDbError::vector("Vector store lock poisoned"))?
                    .insert(
                        (schema.short_name.clone(), slot.to_string()),
                        Arc::new(index),
                    );
            }
        }
        Ok(())
    }

    /// Returns the index for a `(schema, field)` pair, creating it lazily
    /// from the provider's registry entry if absent.
    pub fn get_or_create(
        &self,
        schema: &str,
        field: &str,
        provider: &str,
    ) -> Result<Arc<HnswIndex>> {
        let key = (schema.to_string(), field.to_string());
        {
            let indexes = self
                .indexes
                .read()
                .map_err(|_| RemDbError::vector("Vector store lock poisoned"))?;
            if let Some(index) = indexes.get(&key) {
                return Ok(Arc::clone(index));
            }
        }

        let spec = provider_spec(provider)?;
        let index = Arc::new(HnswIndex::new(
            spec.dimension,
            spec.metric,
            spec.normalized,
            &self.config,
        ));
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| RemDbError::vector("Vector store lock poisoned"))?;
        Ok(Arc::clone(indexes.entry(key).or_insert(index)))
    }

    /// Returns the index if it exists.
    pub fn get(&self, schema: &str, field: &str) -> Option<Arc<HnswIndex>> {
        self.indexes
            .read()
            .ok()?
            .get(&(schema.to_string(), field.to_string()))
            .cloned()
    }

    /// Soft-deletes an entity from every index of its schema.
    pub fn delete_entity(&self, schema: &str, id: EntityId) -> Result<()> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| RemDbError::vector("Vector store lock poisoned"))?;
        for ((index_schema, _), index) in indexes.iter() {
            if index_schema == schema {
                index.delete(id)?;
            }
        }
        Ok(())
    }

    /// Persists metadata for every index through the storage layer.
    pub fn save_all(&self, storage: &Storage) -> Result<()> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| RemDbError::vector("Vector store lock poisoned"))?;
        for ((schema, field), index) in indexes.iter() {
            let bytes = index.metadata_bytes()?;
            storage.save_hnsw_meta(schema, field, &bytes)?;
        }
        Ok(())
    }

    /// Rebuilds indexes whose tombstone ratio crossed the threshold.
    ///
    /// The rebuilt graph contains only live vectors read back from
    /// storage, with deleted ids dropped for good.
    pub fn compact(&self, storage: &Storage) -> Result<()> {
        let threshold = self.config.rebuild_tombstone_ratio;
        let stale: Vec<IndexKey> = {
            let indexes = self
                .indexes
                .read()
                .map_err(|_| RemDbError::vector("Vector store lock poisoned"))?;
            indexes
                .iter()
                .filter(|(_, index)| index.tombstone_ratio() > threshold)
                .map(|(key, _)| key.clone())
                .collect()
        };

        for (schema, field) in stale {
            let old = self.get(&schema, &field);
            let Some(old) = old else { continue };

            let embeddings: Vec<(EntityId, Vec<f32>)> = storage
                .embeddings_for(&schema, &field)?
                .into_iter()
                .filter(|(id, _)| old.contains(*id))
                .collect();

            debug!(
                schema = %schema,
                field = %field,
                live = embeddings.len(),
                "Rebuilding vector index past tombstone threshold"
            );

            let dimension = old.dimension();
            let (metric, normalized) = old.metric_info();
            let rebuilt = Arc::new(HnswIndex::rebuild_from_embeddings(
                dimension,
                metric,
                normalized,
                &self.config,
                embeddings,
            )?);

            self.indexes
                .write()
                .map_err(|_| RemDbError::vector("Vector store lock poisoned"))?
                .insert((schema.clone(), field.clone()), Arc::clone(&rebuilt));
            storage.save_hnsw_meta(&schema, &field, &rebuilt.metadata_bytes()?)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.indexes.read().map(|i| i.len()).unwrap_or(0);
        f.debug_struct("VectorStore")
            .field("indexes", &count)
            .finish()
    }
}
