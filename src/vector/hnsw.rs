//! HNSW vector index implementation using hnsw_rs.
//!
//! Wraps `hnsw_rs::Hnsw` with:
//! - Bidirectional `EntityId` ↔ `usize` ID mapping
//! - Metric selection from the provider (`DistCosine` vs `DistDot`)
//! - Soft-delete via `HashSet` + filtered search, with lazy rebuild once
//!   the tombstone ratio crosses the configured threshold
//! - Metadata persistence through the storage layer's `hnsw_meta` table
//!
//! # Thread Safety
//!
//! The `hnsw_rs::Hnsw` graph uses `parking_lot::RwLock` internally, so
//! `insert()` takes `&self`. Our metadata (`IndexState`) is protected by
//! `std::sync::RwLock`.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use hnsw_rs::prelude::*;

use crate::config::HnswConfig;
use crate::embedding::{normalize, Metric};
use crate::error::{RemDbError, Result};
use crate::types::EntityId;

/// The graph, generic over the provider's distance metric.
enum Graph {
    Cosine(Hnsw<'static, f32, DistCosine>),
    Dot(Hnsw<'static, f32, DistDot>),
}

impl Graph {
    fn insert(&self, vector: &[f32], internal_id: usize) {
        match self {
            Graph::Cosine(hnsw) => hnsw.insert((vector, internal_id)),
            Graph::Dot(hnsw) => hnsw.insert((vector, internal_id)),
        }
    }

    fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<Neighbour> {
        match self {
            Graph::Cosine(hnsw) => hnsw.search(query, k, ef),
            Graph::Dot(hnsw) => hnsw.search(query, k, ef),
        }
    }

    fn count(&self) -> usize {
        match self {
            Graph::Cosine(hnsw) => hnsw.get_nb_point(),
            Graph::Dot(hnsw) => hnsw.get_nb_point(),
        }
    }
}

/// Internal mutable state for ID mapping and soft-deletion.
#[derive(Debug)]
struct IndexState {
    /// Forward map: EntityId → internal usize ID.
    id_to_internal: HashMap<EntityId, usize>,

    /// Reverse map: internal usize ID → EntityId. Vec for O(1) lookup.
    internal_to_id: Vec<EntityId>,

    /// Soft-deleted internal IDs (excluded from search results).
    deleted: HashSet<usize>,

    /// Next internal ID to assign (monotonically increasing).
    next_id: usize,
}

/// Serializable metadata persisted in the `hnsw_meta` table.
///
/// Internal IDs are reassigned sequentially on rebuild, so the deleted set
/// stores entity UUIDs rather than internal IDs.
#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) struct IndexMetadata {
    pub(crate) dimension: usize,
    pub(crate) deleted: Vec<String>,
}

/// HNSW vector index for one `(schema, embedding_field)` pair.
pub struct HnswIndex {
    graph: Graph,
    state: RwLock<IndexState>,
    dimension: usize,
    metric: Metric,
    /// Vectors arrive unit-length from the provider; skip re-normalizing.
    pre_normalized: bool,
    ef_search_default: usize,
}

impl HnswIndex {
    /// Creates a new empty index.
    ///
    /// `metric` and `pre_normalized` come from the provider registry entry
    /// the embedding field is bound to.
    pub fn new(dimension: usize, metric: Metric, pre_normalized: bool, config: &HnswConfig) -> Self {
        let graph = match metric {
            Metric::Cosine => Graph::Cosine(Hnsw::new(
                config.max_nb_connection,
                config.max_elements,
                config.max_layer,
                config.ef_construction,
                DistCosine,
            )),
            Metric::InnerProduct => Graph::Dot(Hnsw::new(
                config.max_nb_connection,
                config.max_elements,
                config.max_layer,
                config.ef_construction,
                DistDot,
            )),
        };

        Self {
            graph,
            state: RwLock::new(IndexState {
                id_to_internal: HashMap::new(),
                internal_to_id: Vec::new(),
                deleted: HashSet::new(),
                next_id: 0,
            }),
            dimension,
            metric,
            pre_normalized,
            ef_search_default: config.ef_search,
        }
    }

    /// Inserts an entity's vector.
    ///
    /// Non-pre-normalized vectors are normalized first (cosine providers).
    /// Re-inserting an id replaces its mapping: the old graph node is
    /// tombstoned and the new vector gets a fresh internal id.
    pub fn insert(&self, id: EntityId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RemDbError::vector(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }

        let mut stored = vector.to_vec();
        if !self.pre_normalized {
            normalize(&mut stored);
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| RemDbError::vector("Index state lock poisoned"))?;

        // Updated vector for a known id: tombstone the old node
        if let Some(&old_internal) = state.id_to_internal.get(&id) {
            state.deleted.insert(old_internal);
        }

        let internal_id = state.next_id;
        state.next_id += 1;
        state.id_to_internal.insert(id, internal_id);
        state.internal_to_id.push(id);

        // Drop the lock before the graph insert (it takes its own lock)
        drop(state);

        self.graph.insert(&stored, internal_id);
        Ok(())
    }

    /// Searches for the k nearest entities, excluding deleted ones.
    ///
    /// Returns `(EntityId, score)` pairs with score in `[0, 1]`, sorted by
    /// score descending. Cosine distance `d ∈ [0, 2]` maps to `1 - d/2`;
    /// inner-product distance `1 - dot` maps back to `dot` clamped.
    pub fn search(&self, query: &[f32], k: usize, ef_search: Option<usize>) -> Result<Vec<(EntityId, f32)>> {
        if query.len() != self.dimension {
            return Err(RemDbError::vector(format!(
                "Query dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }

        let mut prepared = query.to_vec();
        if !self.pre_normalized {
            normalize(&mut prepared);
        }

        let state = self
            .state
            .read()
            .map_err(|_| RemDbError::vector("Index state lock poisoned"))?;

        let ef = ef_search.unwrap_or(self.ef_search_default).max(k);
        // Over-fetch so post-filtering tombstones still fills k
        let fetch = if state.deleted.is_empty() {
            k
        } else {
            k + state.deleted.len()
        };

        let neighbours = self.graph.search(&prepared, fetch, ef.max(fetch));

        let mut results: Vec<(EntityId, f32)> = neighbours
            .into_iter()
            .filter(|n| !state.deleted.contains(&n.d_id))
            .filter_map(|n| {
                state
                    .internal_to_id
                    .get(n.d_id)
                    .map(|&id| (id, self.score(n.distance)))
            })
            .take(k)
            .collect();

        // Neighbours arrive distance-ascending; make score order explicit
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    fn score(&self, distance: f32) -> f32 {
        let score = match self.metric {
            Metric::Cosine => 1.0 - distance / 2.0,
            Metric::InnerProduct => 1.0 - distance,
        };
        score.clamp(0.0, 1.0)
    }

    /// Marks an entity as deleted. Idempotent; unknown ids are a no-op.
    pub fn delete(&self, id: EntityId) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| RemDbError::vector("Index state lock poisoned"))?;
        if let Some(&internal_id) = state.id_to_internal.get(&id) {
            state.deleted.insert(internal_id);
        }
        Ok(())
    }

    /// Returns true if the entity is present and not deleted.
    pub fn contains(&self, id: EntityId) -> bool {
        let state = self.state.read().ok();
        state.is_some_and(|s| {
            s.id_to_internal
                .get(&id)
                .is_some_and(|internal| !s.deleted.contains(internal))
        })
    }

    /// Number of active (non-deleted) vectors.
    pub fn active_count(&self) -> usize {
        let state = self.state.read().ok();
        state.map_or(0, |s| s.id_to_internal.len().saturating_sub(s.deleted.len()))
    }

    /// Total vectors in the graph, including tombstones.
    pub fn total_count(&self) -> usize {
        self.graph.count()
    }

    /// Returns true if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.active_count() == 0
    }

    /// Fraction of graph nodes that are tombstones.
    pub fn tombstone_ratio(&self) -> f32 {
        let total = self.total_count();
        if total == 0 {
            return 0.0;
        }
        let deleted = self.state.read().map(|s| s.deleted.len()).unwrap_or(0);
        deleted as f32 / total as f32
    }

    /// The dimension vectors must match.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// The metric and pre-normalization flag this index was built with.
    pub fn metric_info(&self) -> (Metric, bool) {
        (self.metric, self.pre_normalized)
    }

    /// Serializes metadata (dimension + deleted entity ids) for persistence.
    pub fn metadata_bytes(&self) -> Result<Vec<u8>> {
        let state = self
            .state
            .read()
            .map_err(|_| RemDbError::vector("Index state lock poisoned"))?;
        let metadata = IndexMetadata {
            dimension: self.dimension,
            deleted: state
                .deleted
                .iter()
                .filter_map(|&internal| state.internal_to_id.get(internal).map(|id| id.to_string()))
                .collect(),
        };
        serde_json::to_vec(&metadata)
            .map_err(|e| RemDbError::vector(format!("Failed to serialize HNSW metadata: {}", e)))
    }

    /// Restores the deleted set from persisted metadata bytes.
    ///
    /// Called after rebuilding the graph from stored embeddings; ids that
    /// no longer exist in the graph are skipped.
    pub fn restore_metadata(&self, bytes: &[u8]) -> Result<()> {
        let metadata: IndexMetadata = serde_json::from_slice(bytes)
            .map_err(|e| RemDbError::vector(format!("Failed to parse HNSW metadata: {}", e)))?;

        let mut state = self
            .state
            .write()
            .map_err(|_| RemDbError::vector("Index state lock poisoned"))?;
        for id_str in &metadata.deleted {
            let Ok(id) = id_str.parse::<EntityId>() else {
                return Err(RemDbError::vector(format!(
                    "Invalid UUID in deleted set: {}",
                    id_str
                )));
            };
            if let Some(&internal) = state.id_to_internal.get(&id) {
                state.deleted.insert(internal);
            }
        }
        Ok(())
    }

    /// Rebuilds an index from stored embeddings.
    ///
    /// Used on open (the embeddings table is the source of truth) and by
    /// compaction once the tombstone ratio crosses the threshold.
    pub fn rebuild_from_embeddings(
        dimension: usize,
        metric: Metric,
        pre_normalized: bool,
        config: &HnswConfig,
        embeddings: Vec<(EntityId, Vec<f32>)>,
    ) -> Result<Self> {
        let index = Self::new(dimension, metric, pre_normalized, config);
        for (id, vector) in embeddings {
            index.insert(id, &vector)?;
        }
        Ok(index)
    }
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dimension", &self.dimension)
            .field("metric", &self.metric)
            .field("active", &self.active_count())
            .field("total", &self.total_count())
            .finish()
    }
}
