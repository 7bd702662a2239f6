//! Entity store: upsert, get, scan and delete with the batch contract.
//!
//! Every mutation is assembled into one [`EntityCommit`] so the body, key
//! index, secondary index diffs, embedding queue and WAL entry commit
//! atomically. Writes within the tenant are serialized through the store's
//! write mutex, which keeps WAL sequence numbers strictly monotonic and
//! the derived indexes consistent with bodies.
//!
//! The store is also where replicated WAL entries land:
//! [`EntityStore::apply_wal_entry`] runs remote mutations through the same
//! commit path under last-write-wins rules.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::embedding::{provider_spec, create_provider, EmbeddingProvider};
use crate::entity::{embedding_slot, Edge, Entity};
use crate::error::{NotFoundError, RemDbError, Result, ValidationError};
use crate::query::predicate::{compare, Order, Predicate};
use crate::schema::{SchemaDefinition, SchemaRegistry};
use crate::storage::{encode_index_value, EmbedJob, EntityCommit, Posting, Storage};
use crate::storage::tables::queue_key;
use crate::types::{EntityId, Timestamp};
use crate::vector::VectorStore;
use crate::wal::{WalEntry, WalOperation};

/// How long a writer blocks on a full embedding queue before giving up.
const QUEUE_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for [`EntityStore::scan`].
#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    /// Filter to apply. Equality/in/range conjuncts on indexed fields are
    /// answered from the secondary index; the rest filters in memory.
    pub predicate: Option<Predicate>,
    /// Sort key and direction. Ties break on `(order_key, id)`.
    pub order_by: Option<(String, Order)>,
    /// Maximum rows to return.
    pub limit: Option<usize>,
    /// Rows to skip before returning.
    pub offset: Option<usize>,
    /// Include tombstoned rows (debugging aid; default hidden).
    pub include_deleted: bool,
}

/// The tenant-scoped entity store.
pub struct EntityStore {
    storage: Arc<Storage>,
    registry: RwLock<SchemaRegistry>,
    vectors: Arc<VectorStore>,
    providers: RwLock<HashMap<String, Arc<dyn EmbeddingProvider>>>,
    config: Config,
    /// Serializes writes within the tenant.
    write_lock: Mutex<()>,
    /// Identity stamped on locally originated WAL entries.
    peer_id: String,
    /// Live WAL feed for replication, installed by the manager. Replaced
    /// when the manager restarts.
    replication_tx: RwLock<Option<broadcast::Sender<WalEntry>>>,
}

impl EntityStore {
    /// Opens the store: storage, schema registry (builtins + persisted
    /// definitions) and rebuilt vector indexes.
    pub fn open(path: impl AsRef<std::path::Path>, config: Config) -> Result<Arc<Self>> {
        let storage = Arc::new(Storage::open(path, &config.tenant_id)?);

        let persisted = storage.load_schemas()?;
        let registry =
            SchemaRegistry::from_definitions(&config.default_embedding_provider, persisted)?;

        let vectors = Arc::new(VectorStore::new(config.hnsw.clone()));
        vectors.load_all(&storage, &registry.definitions())?;

        let peer_id = config
            .replication
            .as_ref()
            .map(|r| r.peer_id.clone())
            .unwrap_or_else(|| "local".to_string());

        Ok(Arc::new(Self {
            storage,
            registry: RwLock::new(registry),
            vectors,
            providers: RwLock::new(HashMap::new()),
            config,
            write_lock: Mutex::new(()),
            peer_id,
            replication_tx: RwLock::new(None),
        }))
    }

    /// The underlying storage handle.
    #[inline]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The vector index store.
    #[inline]
    pub fn vectors(&self) -> &VectorStore {
        &self.vectors
    }

    /// The configuration this store was opened with.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// This node's peer id for WAL attribution.
    #[inline]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Installs the live WAL feed. Every committed entry is sent to it.
    pub fn set_replication_feed(&self, tx: broadcast::Sender<WalEntry>) {
        if let Ok(mut guard) = self.replication_tx.write() {
            *guard = Some(tx);
        }
    }

    /// Flushes derived state (vector index metadata) to storage.
    pub fn flush(&self) -> Result<()> {
        self.vectors.save_all(&self.storage)
    }

    // =========================================================================
    // Schemas
    // =========================================================================

    /// Registers a schema and persists its definition.
    pub fn register_schema(&self, definition: SchemaDefinition) -> Result<()> {
        for binding in &definition.embedding_fields {
            provider_spec(&binding.provider)?;
        }
        {
            let mut registry = self
                .registry
                .write()
                .map_err(|_| RemDbError::config("Schema registry lock poisoned"))?;
            registry.register(definition.clone())?;
        }
        self.storage.save_schema(&definition)?;
        info!(schema = %definition.short_name, "Schema registered");
        Ok(())
    }

    /// Returns a schema definition by short name or FQN.
    pub fn get_schema(&self, name: &str) -> Result<SchemaDefinition> {
        let registry = self
            .registry
            .read()
            .map_err(|_| RemDbError::config("Schema registry lock poisoned"))?;
        registry.get(name).cloned()
    }

    /// Lists registered schema short names.
    pub fn list_schemas(&self, category: Option<&str>) -> Vec<String> {
        self.registry
            .read()
            .map(|r| r.list(category))
            .unwrap_or_default()
    }

    // =========================================================================
    // Upsert
    // =========================================================================

    /// Upserts a batch of records, returning one id per record.
    ///
    /// Records with a schema `key_field` derive stable ids, so repeating an
    /// upsert with the same key mutates the same entity.
    #[instrument(skip_all, fields(schema = schema, records = records.len()))]
    pub fn upsert(&self, schema: &str, records: Vec<Map<String, Value>>) -> Result<Vec<EntityId>> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(self.upsert_one(schema, record, false)?);
        }
        Ok(ids)
    }

    /// Inserts a record, generating embeddings synchronously first.
    ///
    /// Unlike the queued path, the caller observes embedding failures
    /// directly and the vector is searchable as soon as this returns.
    pub fn insert_with_embedding(
        &self,
        schema: &str,
        mut record: Map<String, Value>,
    ) -> Result<EntityId> {
        let definition = self.get_schema(schema)?;
        for (slot_index, binding) in definition.embedding_fields.iter().enumerate() {
            let slot = embedding_slot(slot_index);
            if record.contains_key(slot) {
                continue;
            }
            let Some(text) = record.get(&binding.field).and_then(|v| v.as_str()) else {
                continue;
            };
            let provider = self.provider(&binding.provider)?;
            let vector = provider.embed(text)?;
            record.insert(slot.to_string(), Value::from(vector));
        }
        self.upsert_one(schema, record, true)
    }

    fn upsert_one(
        &self,
        schema: &str,
        record: Map<String, Value>,
        skip_queue: bool,
    ) -> Result<EntityId> {
        let definition = self.get_schema(schema)?;
        {
            let registry = self
                .registry
                .read()
                .map_err(|_| RemDbError::config("Schema registry lock poisoned"))?;
            registry.validate(&definition.short_name, &record)?;
        }
        self.validate_inline_embeddings(&definition, &record)?;

        // Deterministic id from the key field when present
        let key_value = definition
            .key_field
            .as_ref()
            .and_then(|field| record.get(field))
            .map(stringify_key);
        let id = match &key_value {
            Some(key) => EntityId::derive(&self.config.tenant_id, &definition.short_name, key),
            None => EntityId::new(),
        };

        // Back-pressure before taking the write lock: the worker needs the
        // lock to drain the queue
        if self.config.enable_embeddings && !definition.embedding_fields.is_empty() {
            self.wait_for_queue_capacity()?;
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RemDbError::config("Write lock poisoned"))?;

        let previous = self
            .storage
            .get_entity_in_schema(&definition.short_name, id)?;

        let now = Timestamp::now();
        let mut entity = Entity {
            id,
            schema: definition.short_name.clone(),
            properties: record,
            created_at: previous.as_ref().map(|p| p.created_at).unwrap_or(now),
            modified_at: now,
            deleted_at: None,
            edges: previous.as_ref().map(|p| p.edges.clone()).unwrap_or_default(),
            source_peer: Some(self.peer_id.clone()),
        };

        let (embedding_jobs, inline_embeddings) =
            self.embedding_work(&definition, &mut entity, previous.as_ref(), skip_queue)?;
        entity.check_invariants()?;

        let removed_postings = previous
            .as_ref()
            .map(|p| indexed_postings(&definition, p))
            .unwrap_or_default();
        let added_postings = indexed_postings(&definition, &entity);

        let commit = EntityCommit {
            entity: entity.clone(),
            key_value,
            removed_postings,
            added_postings,
            embedding_jobs,
            completed_jobs: Vec::new(),
            embeddings: inline_embeddings.clone(),
            operation: WalOperation::Put,
            source_peer_id: self.peer_id.clone(),
        };
        let entry = self.storage.commit_entity(commit)?;

        // Derived structures after the durable commit: rebuildable on crash
        for (slot, vector) in &inline_embeddings {
            if let Some(binding) = binding_for_slot(&definition, slot) {
                let index =
                    self.vectors
                        .get_or_create(&definition.short_name, slot, &binding.provider)?;
                index.insert(id, vector)?;
            }
        }

        self.broadcast(entry);
        debug!(id = %id, "Entity upserted");
        Ok(id)
    }

    fn validate_inline_embeddings(
        &self,
        definition: &SchemaDefinition,
        record: &Map<String, Value>,
    ) -> Result<()> {
        for (slot_index, binding) in definition.embedding_fields.iter().enumerate() {
            let slot = embedding_slot(slot_index);
            if let Some(value) = record.get(slot) {
                let vector = value_to_vector(value).ok_or_else(|| {
                    RemDbError::from(ValidationError::invalid_field(
                        slot,
                        "embedding must be an array of numbers",
                    ))
                })?;
                let spec = provider_spec(&binding.provider)?;
                if vector.len() != spec.dimension {
                    return Err(
                        ValidationError::dimension_mismatch(spec.dimension, vector.len()).into()
                    );
                }
            }
        }
        Ok(())
    }

    /// Decides per embedding slot what the write needs: persist an
    /// inline caller-supplied vector, carry the stored vector forward
    /// (source text unchanged), or queue fresh embedding work.
    fn embedding_work(
        &self,
        definition: &SchemaDefinition,
        entity: &mut Entity,
        previous: Option<&Entity>,
        skip_queue: bool,
    ) -> Result<(Vec<EmbedJob>, Vec<(String, Vec<f32>)>)> {
        let mut jobs = Vec::new();
        let mut inline = Vec::new();

        for (slot_index, binding) in definition.embedding_fields.iter().enumerate() {
            let slot = embedding_slot(slot_index);

            // Caller supplied the vector inline
            if let Some(value) = entity.properties.get(slot) {
                if let Some(vector) = value_to_vector(value) {
                    inline.push((slot.to_string(), vector));
                    continue;
                }
            }

            let text = entity
                .properties
                .get(&binding.field)
                .and_then(|v| v.as_str())
                .map(str::to_string);

            // Unchanged source text: keep the previously computed vector
            // in the body instead of dropping or recomputing it
            if let Some(previous) = previous {
                let previous_text = previous
                    .properties
                    .get(&binding.field)
                    .and_then(|v| v.as_str());
                if previous_text == text.as_deref() {
                    if let Some(vector) = previous.properties.get(slot) {
                        entity.properties.insert(slot.to_string(), vector.clone());
                    }
                    continue;
                }
            }

            if skip_queue || !self.config.enable_embeddings {
                continue;
            }
            let Some(text) = text else {
                continue;
            };

            jobs.push(EmbedJob {
                schema: definition.short_name.clone(),
                id: entity.id,
                field: slot.to_string(),
                provider: binding.provider.clone(),
                text,
                attempts: 0,
            });
        }

        Ok((jobs, inline))
    }

    fn wait_for_queue_capacity(&self) -> Result<()> {
        let capacity = self.config.embedding_queue_capacity;
        let deadline = Instant::now() + QUEUE_BACKPRESSURE_TIMEOUT;
        loop {
            if self.storage.pending_count()? < capacity {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RemDbError::provider(
                    "embedding queue full; worker not draining",
                ));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Retrieves an entity by id, schema resolved automatically.
    ///
    /// Tombstoned entities are returned with `deleted_at` set.
    pub fn get(&self, id: EntityId) -> Result<Option<Entity>> {
        self.storage.get_entity(id)
    }

    /// Scans a schema with optional predicate, ordering and paging.
    pub fn scan(&self, schema: &str, options: &ScanOptions) -> Result<Vec<Entity>> {
        let definition = self.get_schema(schema)?;

        let candidates = match &options.predicate {
            Some(predicate) => self.index_candidates(&definition, predicate)?,
            None => None,
        };

        let mut entities = match candidates {
            Some(ids) => {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(entity) =
                        self.storage.get_entity_in_schema(&definition.short_name, id)?
                    {
                        out.push(entity);
                    }
                }
                out
            }
            None => self.storage.scan_schema(&definition.short_name)?,
        };

        if !options.include_deleted {
            entities.retain(|e| !e.is_deleted());
        }
        if let Some(predicate) = &options.predicate {
            entities.retain(|e| predicate.matches(e));
        }

        if let Some((field, order)) = &options.order_by {
            entities.sort_by(|a, b| {
                let ordering = order_values(a.field(field).as_ref(), b.field(field).as_ref())
                    .then_with(|| a.id.cmp(&b.id));
                match order {
                    Order::Asc => ordering,
                    Order::Desc => ordering.reverse(),
                }
            });
        }

        let offset = options.offset.unwrap_or(0);
        if offset > 0 {
            entities = entities.into_iter().skip(offset).collect();
        }
        if let Some(limit) = options.limit {
            entities.truncate(limit);
        }
        Ok(entities)
    }

    /// Answers equality/in/range conjuncts from the secondary index.
    ///
    /// Returns `None` when no conjunct is indexable (callers fall back to
    /// a schema-prefix scan). Candidate lists for multiple conjuncts are
    /// intersected; range candidates may over-approximate and rely on the
    /// final in-memory filter.
    fn index_candidates(
        &self,
        definition: &SchemaDefinition,
        predicate: &Predicate,
    ) -> Result<Option<Vec<EntityId>>> {
        let mut lists: Vec<Vec<EntityId>> = Vec::new();

        for conjunct in predicate.conjuncts() {
            match conjunct {
                Predicate::Eq(field, value) if definition.is_indexed(field) => {
                    if let Some(encoded) = encode_index_value(value) {
                        lists.push(self.storage.posting_ids(
                            &definition.short_name,
                            field,
                            &encoded,
                        )?);
                    }
                }
                Predicate::In(field, values) if definition.is_indexed(field) => {
                    let mut union: Vec<EntityId> = Vec::new();
                    for value in values {
                        if let Some(encoded) = encode_index_value(value) {
                            union.extend(self.storage.posting_ids(
                                &definition.short_name,
                                field,
                                &encoded,
                            )?);
                        }
                    }
                    union.sort();
                    union.dedup();
                    lists.push(union);
                }
                Predicate::Gt(field, value)
                | Predicate::Gte(field, value)
                | Predicate::Lt(field, value)
                | Predicate::Lte(field, value)
                    if definition.is_indexed(field) =>
                {
                    let Some(encoded) = encode_index_value(value) else {
                        continue;
                    };
                    let (low, high) = match conjunct {
                        Predicate::Gt(..) | Predicate::Gte(..) => (Some(encoded.as_slice()), None),
                        _ => (None, Some(encoded.as_slice())),
                    };
                    let groups = self.storage.posting_ids_range(
                        &definition.short_name,
                        field,
                        low,
                        high,
                    )?;
                    let mut ids: Vec<EntityId> =
                        groups.into_iter().flat_map(|(_, ids)| ids).collect();
                    ids.sort();
                    ids.dedup();
                    lists.push(ids);
                }
                _ => {}
            }
        }

        if lists.is_empty() {
            return Ok(None);
        }
        Ok(Some(intersect(lists)))
    }

    /// Resolves LOOKUP keys: UUIDs resolve directly, anything else probes
    /// the key index across every registered schema.
    pub fn lookup_keys(&self, keys: &[String]) -> Result<Vec<Entity>> {
        let schemas = self.list_schemas(None);
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        for key in keys {
            if let Ok(id) = key.parse::<EntityId>() {
                if let Some(entity) = self.get(id)? {
                    if seen.insert(entity.id) {
                        out.push(entity);
                    }
                    continue;
                }
            }
            for schema in &schemas {
                if let Some(id) = self.storage.lookup_key(schema, key)? {
                    if let Some(entity) = self.storage.get_entity_in_schema(schema, id)? {
                        if seen.insert(entity.id) {
                            out.push(entity);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Semantic Search
    // =========================================================================

    /// Embeds `text` with the schema's default provider and searches.
    pub fn search_text(
        &self,
        text: &str,
        schema: &str,
        top_k: usize,
        filter: Option<&Predicate>,
    ) -> Result<Vec<(Entity, f32)>> {
        let definition = self.get_schema(schema)?;
        let binding = definition.embedding_fields.first().ok_or_else(|| {
            RemDbError::from(ValidationError::invalid_field(
                "schema",
                format!("schema '{}' declares no embedding fields", schema),
            ))
        })?;
        let provider = self.provider(&binding.provider)?;
        let query = provider.embed(text)?;
        self.search_vector(&definition, &query, top_k, filter)
    }

    /// Searches the schema's default vector index with a query vector.
    ///
    /// Filters apply post-ANN: candidates from the graph are checked
    /// against the secondary index postings (and the full predicate) so
    /// recall on the filtered set is preserved by over-fetching.
    pub fn search_vector(
        &self,
        definition: &SchemaDefinition,
        query: &[f32],
        top_k: usize,
        filter: Option<&Predicate>,
    ) -> Result<Vec<(Entity, f32)>> {
        let Some(index) = self.vectors.get(&definition.short_name, embedding_slot(0)) else {
            return Ok(Vec::new());
        };

        let allowed: Option<HashSet<EntityId>> = match filter {
            Some(predicate) => self
                .index_candidates(definition, predicate)?
                .map(|ids| ids.into_iter().collect()),
            None => None,
        };

        let fetch = if filter.is_some() { top_k * 4 } else { top_k };
        let hits = index.search(query, fetch.max(top_k), None)?;

        let mut out = Vec::with_capacity(top_k);
        for (id, score) in hits {
            if let Some(allowed) = &allowed {
                if !allowed.contains(&id) {
                    continue;
                }
            }
            let Some(entity) = self
                .storage
                .get_entity_in_schema(&definition.short_name, id)?
            else {
                continue;
            };
            if entity.is_deleted() {
                continue;
            }
            if let Some(predicate) = filter {
                if !predicate.matches(&entity) {
                    continue;
                }
            }
            out.push((entity, score));
            if out.len() == top_k {
                break;
            }
        }
        Ok(out)
    }

    /// Returns (creating on first use) the provider implementation.
    pub fn provider(&self, name: &str) -> Result<Arc<dyn EmbeddingProvider>> {
        {
            let providers = self
                .providers
                .read()
                .map_err(|_| RemDbError::config("Provider cache lock poisoned"))?;
            if let Some(provider) = providers.get(name) {
                return Ok(Arc::clone(provider));
            }
        }
        let provider: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(name)?);
        let mut providers = self
            .providers
            .write()
            .map_err(|_| RemDbError::config("Provider cache lock poisoned"))?;
        Ok(Arc::clone(providers.entry(name.to_string()).or_insert(provider)))
    }

    // =========================================================================
    // Delete & Edges
    // =========================================================================

    /// Soft-deletes an entity: sets `deleted_at`, drops its postings,
    /// tombstones its vectors. The body stays readable by id.
    #[instrument(skip(self))]
    pub fn delete(&self, id: EntityId) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RemDbError::config("Write lock poisoned"))?;

        let mut entity = self
            .storage
            .get_entity(id)?
            .ok_or_else(|| RemDbError::from(NotFoundError::entity(id)))?;
        if entity.is_deleted() {
            return Ok(());
        }

        let definition = self.get_schema(&entity.schema)?;
        let removed_postings = indexed_postings(&definition, &entity);
        let completed_jobs = definition
            .embedding_fields
            .iter()
            .enumerate()
            .map(|(i, _)| {
                queue_key(
                    &self.config.tenant_id,
                    &definition.short_name,
                    id,
                    embedding_slot(i),
                )
            })
            .collect();

        let now = Timestamp::now();
        entity.deleted_at = Some(now);
        entity.modified_at = now;
        entity.source_peer = Some(self.peer_id.clone());

        let commit = EntityCommit {
            entity: entity.clone(),
            key_value: None,
            removed_postings,
            added_postings: Vec::new(),
            embedding_jobs: Vec::new(),
            completed_jobs,
            embeddings: Vec::new(),
            operation: WalOperation::Delete,
            source_peer_id: self.peer_id.clone(),
        };
        let entry = self.storage.commit_entity(commit)?;

        self.vectors.delete_entity(&entity.schema, id)?;
        self.vectors.compact(&self.storage)?;
        self.broadcast(entry);
        info!(id = %id, "Entity soft-deleted");
        Ok(())
    }

    /// Appends an edge to the source entity.
    ///
    /// Edges are owned by their source; the destination is a weak
    /// reference and is not checked for existence.
    pub fn add_edge(
        &self,
        src: EntityId,
        dst: EntityId,
        rel_type: &str,
        properties: Map<String, Value>,
    ) -> Result<()> {
        if rel_type.is_empty() {
            return Err(ValidationError::required_field("rel_type").into());
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RemDbError::config("Write lock poisoned"))?;

        let mut entity = self
            .storage
            .get_entity(src)?
            .ok_or_else(|| RemDbError::from(NotFoundError::entity(src)))?;

        let mut edge = Edge::new(src, dst, rel_type);
        edge.properties = properties;
        entity.edges.push(edge);
        entity.modified_at = Timestamp::now();
        entity.source_peer = Some(self.peer_id.clone());

        let commit = EntityCommit {
            entity,
            key_value: None,
            removed_postings: Vec::new(),
            added_postings: Vec::new(),
            embedding_jobs: Vec::new(),
            completed_jobs: Vec::new(),
            embeddings: Vec::new(),
            operation: WalOperation::Put,
            source_peer_id: self.peer_id.clone(),
        };
        let entry = self.storage.commit_entity(commit)?;
        self.broadcast(entry);
        Ok(())
    }

    /// Hard-deletes tombstones older than `older_than` and rebuilds
    /// vector indexes past the tombstone threshold.
    ///
    /// Replication has no acknowledgement channel, so "peers have seen
    /// the delete" is approximated by age: pick a horizon comfortably
    /// past the reconnect backoff ceiling. Returns the number of rows
    /// reclaimed.
    pub fn compact(&self, older_than: Duration) -> Result<usize> {
        let cutoff = Timestamp::from_micros(
            Timestamp::now().as_micros() - older_than.as_micros() as i64,
        );

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RemDbError::config("Write lock poisoned"))?;

        let mut reclaimed = 0usize;
        for entity in self.storage.scan_all()? {
            let Some(deleted_at) = entity.deleted_at else {
                continue;
            };
            if deleted_at >= cutoff {
                continue;
            }
            let definition = self.get_schema(&entity.schema)?;
            let key_value = definition
                .key_field
                .as_ref()
                .and_then(|field| entity.properties.get(field))
                .map(stringify_key);
            let slots: Vec<&str> = definition
                .embedding_fields
                .iter()
                .enumerate()
                .map(|(i, _)| embedding_slot(i))
                .collect();

            self.storage.hard_delete_entity(
                &entity.schema,
                entity.id,
                key_value.as_deref(),
                &slots,
            )?;
            reclaimed += 1;
        }

        if reclaimed > 0 {
            info!(reclaimed, "Compaction hard-deleted tombstones");
        }
        self.vectors.compact(&self.storage)?;
        Ok(reclaimed)
    }

    // =========================================================================
    // Embedding Write-Back (called by the worker)
    // =========================================================================

    /// Writes a completed embedding back: body property, vector table,
    /// vector index, and clears the queue entry, all in one commit.
    pub fn complete_embedding(
        &self,
        job: &EmbedJob,
        queue_key_bytes: Vec<u8>,
        vector: Vec<f32>,
    ) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RemDbError::config("Write lock poisoned"))?;

        let Some(mut entity) = self.storage.get_entity_in_schema(&job.schema, job.id)? else {
            // Entity vanished; just clear the queue row
            return self.clear_queue_entry(queue_key_bytes);
        };
        if entity.is_deleted() {
            return self.clear_queue_entry(queue_key_bytes);
        }

        entity
            .properties
            .insert(job.field.clone(), Value::from(vector.clone()));
        entity
            .properties
            .remove(crate::entity::EMBEDDING_ERROR_PROPERTY);
        entity.modified_at = Timestamp::now();
        entity.source_peer = Some(self.peer_id.clone());

        let commit = EntityCommit {
            entity,
            key_value: None,
            removed_postings: Vec::new(),
            added_postings: Vec::new(),
            embedding_jobs: Vec::new(),
            completed_jobs: vec![queue_key_bytes],
            embeddings: vec![(job.field.clone(), vector.clone())],
            operation: WalOperation::Put,
            source_peer_id: self.peer_id.clone(),
        };
        let entry = self.storage.commit_entity(commit)?;

        let index = self
            .vectors
            .get_or_create(&job.schema, &job.field, &job.provider)?;
        index.insert(job.id, &vector)?;

        self.broadcast(entry);
        Ok(())
    }

    /// Records a permanent embedding failure on the entity.
    ///
    /// The failure never blocks other writes; it surfaces as the
    /// `embedding_error` property and clears the queue entry.
    pub fn fail_embedding(
        &self,
        job: &EmbedJob,
        queue_key_bytes: Vec<u8>,
        error: &str,
    ) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RemDbError::config("Write lock poisoned"))?;

        let Some(mut entity) = self.storage.get_entity_in_schema(&job.schema, job.id)? else {
            return self.clear_queue_entry(queue_key_bytes);
        };

        warn!(id = %job.id, field = %job.field, error, "Embedding permanently failed");
        entity.properties.insert(
            crate::entity::EMBEDDING_ERROR_PROPERTY.to_string(),
            Value::String(error.to_string()),
        );
        entity.modified_at = Timestamp::now();
        entity.source_peer = Some(self.peer_id.clone());

        let commit = EntityCommit {
            entity,
            key_value: None,
            removed_postings: Vec::new(),
            added_postings: Vec::new(),
            embedding_jobs: Vec::new(),
            completed_jobs: vec![queue_key_bytes],
            embeddings: Vec::new(),
            operation: WalOperation::Put,
            source_peer_id: self.peer_id.clone(),
        };
        let entry = self.storage.commit_entity(commit)?;
        self.broadcast(entry);
        Ok(())
    }

    fn clear_queue_entry(&self, queue_key_bytes: Vec<u8>) -> Result<()> {
        // A minimal commit is overkill for a dangling queue row; reuse the
        // dedicated storage call instead.
        self.storage.remove_queue_entries(&[queue_key_bytes])
    }

    // =========================================================================
    // Replication Apply
    // =========================================================================

    /// Applies a WAL entry received from a peer.
    ///
    /// Conflicts resolve last-write-wins by timestamp, ties broken by peer
    /// id. Applied entries re-enter the local WAL (preserving the original
    /// source and timestamp) so catch-up streams gossip them onward.
    /// Returns the locally appended entry when applied, `None` when the
    /// entry lost the conflict or originated here.
    pub fn apply_wal_entry(&self, entry: &WalEntry) -> Result<Option<WalEntry>> {
        // Loop suppression: never re-apply our own writes
        if entry.source_peer_id == self.peer_id {
            return Ok(None);
        }

        let mut entity: Entity = serde_json::from_slice(&entry.value).map_err(|e| {
            RemDbError::from(crate::error::ReplicationError::InvalidEntry(format!(
                "undecodable entity body: {}",
                e
            )))
        })?;
        entity.check_invariants()?;

        let definition = self.get_schema(&entity.schema)?;
        self.validate_inline_embeddings(&definition, &entity.properties)?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RemDbError::config("Write lock poisoned"))?;

        let existing = self
            .storage
            .get_entity_in_schema(&entity.schema, entity.id)?;
        if let Some(existing) = &existing {
            let existing_peer = existing.source_peer.as_deref().unwrap_or("");
            if !entry.wins_against(existing.modified_at, existing_peer) {
                debug!(id = %entity.id, "Remote entry lost LWW conflict");
                return Ok(None);
            }
        }

        entity.source_peer = Some(entry.source_peer_id.clone());

        let removed_postings = existing
            .as_ref()
            .map(|p| indexed_postings(&definition, p))
            .unwrap_or_default();
        let added_postings = if entity.is_deleted() {
            Vec::new()
        } else {
            indexed_postings(&definition, &entity)
        };

        let key_value = definition
            .key_field
            .as_ref()
            .and_then(|field| entity.properties.get(field))
            .map(stringify_key);

        let mut inline_embeddings = Vec::new();
        if !entity.is_deleted() {
            for (slot_index, _) in definition.embedding_fields.iter().enumerate() {
                let slot = embedding_slot(slot_index);
                if let Some(vector) = entity.properties.get(slot).and_then(value_to_vector) {
                    inline_embeddings.push((slot.to_string(), vector));
                }
            }
        }

        let schema_name = entity.schema.clone();
        let entity_id = entity.id;
        let deleted = entity.is_deleted();

        let commit = EntityCommit {
            entity,
            key_value,
            removed_postings,
            added_postings,
            embedding_jobs: Vec::new(),
            completed_jobs: Vec::new(),
            embeddings: inline_embeddings.clone(),
            operation: entry.operation,
            source_peer_id: entry.source_peer_id.clone(),
        };
        let local_entry = self.storage.commit_entity(commit)?;

        if deleted {
            self.vectors.delete_entity(&schema_name, entity_id)?;
        } else {
            for (slot, vector) in &inline_embeddings {
                if let Some(binding) = binding_for_slot(&definition, slot) {
                    let index =
                        self.vectors
                            .get_or_create(&schema_name, slot, &binding.provider)?;
                    index.insert(entity_id, vector)?;
                }
            }
        }

        self.broadcast(local_entry.clone());
        debug!(id = %entity_id, origin = %entry.source_peer_id, "Applied replicated entry");
        Ok(Some(local_entry))
    }

    fn broadcast(&self, entry: WalEntry) {
        if let Ok(guard) = self.replication_tx.read() {
            if let Some(tx) = guard.as_ref() {
                // Receivers may lag or be gone; replication catches up
                // from the WAL either way
                let _ = tx.send(entry);
            }
        }
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("tenant", &self.config.tenant_id)
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

fn binding_for_slot<'a>(
    definition: &'a SchemaDefinition,
    slot: &str,
) -> Option<&'a crate::schema::EmbeddingField> {
    definition
        .embedding_fields
        .iter()
        .enumerate()
        .find(|(i, _)| embedding_slot(*i) == slot)
        .map(|(_, binding)| binding)
}

/// Renders a key-field value as the canonical string used for derivation.
fn stringify_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON array of numbers → f32 vector.
fn value_to_vector(value: &Value) -> Option<Vec<f32>> {
    let array = value.as_array()?;
    let mut out = Vec::with_capacity(array.len());
    for item in array {
        out.push(item.as_f64()? as f32);
    }
    Some(out)
}

/// The postings an entity's indexed fields produce.
fn indexed_postings(definition: &SchemaDefinition, entity: &Entity) -> Vec<Posting> {
    let mut out = Vec::new();
    for field in &definition.indexed_fields {
        if let Some(value) = entity.properties.get(field) {
            if let Some(encoded) = encode_index_value(value) {
                out.push(Posting {
                    field: field.clone(),
                    encoded,
                });
            }
        }
    }
    out
}

/// Total order over optional JSON values for ORDER BY.
///
/// Missing < null < bool < number < string; containers sort last.
fn order_values(left: Option<&Value>, right: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) | Value::Object(_) => 4,
        }
    }

    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            let by_rank = rank(a).cmp(&rank(b));
            if by_rank != Ordering::Equal {
                return by_rank;
            }
            compare(Some(a), b).unwrap_or(Ordering::Equal)
        }
    }
}

/// Sorted intersection of candidate id lists.
fn intersect(mut lists: Vec<Vec<EntityId>>) -> Vec<EntityId> {
    if lists.is_empty() {
        return Vec::new();
    }
    // Intersect starting from the smallest list
    lists.sort_by_key(|l| l.len());
    let mut result: HashSet<EntityId> = lists[0].iter().copied().collect();
    for list in &lists[1..] {
        let set: HashSet<EntityId> = list.iter().copied().collect();
        result.retain(|id| set.contains(id));
    }
    let mut out: Vec<EntityId> = result.into_iter().collect();
    out.sort();
    out
}
