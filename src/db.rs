//! The main `RemDb` handle and lifecycle operations.
//!
//! [`RemDb`] ties the subsystems together: schema-validated entity
//! storage, the background embedding worker, vector search, the query
//! planner/executor, graph traversal and peer replication.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use remdb::{RemDb, Config};
//!
//! let db = RemDb::open("./rem.db", Config::for_tenant("acme"))?;
//!
//! db.register_schema(
//!     "articles",
//!     serde_json::json!({
//!         "type": "object",
//!         "properties": {"title": {"type": "string"}, "body": {"type": "string"}},
//!         "required": ["title"]
//!     }),
//!     vec!["title".into()],
//!     vec!["body".into()],
//! )?;
//!
//! let id = db.insert("articles", serde_json::json!({
//!     "title": "Hello",
//!     "body": "An embedded multi-tenant database"
//! }))?;
//!
//! db.wait_for_worker(std::time::Duration::from_secs(5));
//! let hits = db.search("embedded database", "articles", 5)?;
//!
//! db.close()?;
//! ```
//!
//! # Thread Safety
//!
//! `RemDb` is `Send + Sync`. Reads run concurrently; writes within the
//! tenant serialize through the store's write mutex.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, instrument};

use crate::config::{Config, ENV_DB_PATH};
use crate::embedding::worker::EmbeddingWorker;
use crate::entity::{Direction, Entity};
use crate::error::{RemDbError, Result, ValidationError};
use crate::graph::{self, TraversalResult};
use crate::llm::{self, ChatModel, EdgeExtraction};
use crate::query::{plan_query, plan_query_with_model, Executor, QueryPlan, QueryResult};
use crate::replication::{ReplicationManager, ReplicationStatus};
use crate::schema::{EmbeddingField, SchemaDefinition};
use crate::storage::DatabaseMetadata;
use crate::store::{EntityStore, ScanOptions};
use crate::types::EntityId;

/// The main database handle.
///
/// Create with [`RemDb::open`]; close with [`RemDb::close`] to flush
/// derived state and stop background work deterministically.
pub struct RemDb {
    store: Arc<EntityStore>,
    worker: Option<EmbeddingWorker>,
    replication: Mutex<Option<ReplicationManager>>,
    chat_model: Mutex<Option<Arc<dyn ChatModel>>>,
}

impl RemDb {
    /// Opens or creates a database at the given path.
    ///
    /// Starts the embedding worker when `config.enable_embeddings` is set
    /// and the replication mesh when `config.replication` is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the database is
    /// corrupted or locked, or the replication listener cannot bind.
    #[instrument(skip_all, fields(path = %path.as_ref().display(), tenant = %config.tenant_id))]
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;

        info!("Opening REM database");
        let store = EntityStore::open(path, config.clone())?;

        let worker = if config.enable_embeddings {
            Some(EmbeddingWorker::spawn(Arc::clone(&store))?)
        } else {
            None
        };

        let replication = match config.replication {
            Some(replication_config) => Some(ReplicationManager::start(
                Arc::clone(&store),
                replication_config,
            )?),
            None => None,
        };

        info!(
            embeddings = config.enable_embeddings,
            replication = replication.is_some(),
            "REM database opened"
        );

        Ok(Self {
            store,
            worker,
            replication: Mutex::new(replication),
            chat_model: Mutex::new(None),
        })
    }

    /// Opens a database from process environment variables.
    ///
    /// Reads `P8_DB_PATH` for the location and the rest of the `P8_*` /
    /// `REM_REPLICATION_*` variables through [`Config::from_env`].
    pub fn open_from_env() -> Result<Self> {
        let path = std::env::var(ENV_DB_PATH)
            .map_err(|_| RemDbError::config(format!("{} not set", ENV_DB_PATH)))?;
        Self::open(path, Config::from_env())
    }

    /// Closes the database: stops replication and the worker, flushes
    /// vector index metadata, and releases the storage handle.
    #[instrument(skip(self))]
    pub fn close(self) -> Result<()> {
        info!("Closing REM database");

        if let Ok(mut guard) = self.replication.lock() {
            if let Some(manager) = guard.take() {
                manager.stop();
            }
        }
        if let Some(worker) = self.worker {
            worker.shutdown();
        }
        self.store.flush()?;

        info!("REM database closed");
        Ok(())
    }

    /// Returns the configuration the database was opened with.
    #[inline]
    pub fn config(&self) -> &Config {
        self.store.config()
    }

    /// Returns the database metadata (layout version, tenant, timestamps).
    #[inline]
    pub fn metadata(&self) -> &DatabaseMetadata {
        self.store.storage().metadata()
    }

    /// Internal store handle, for modules layered on top of the core.
    #[doc(hidden)]
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    // =========================================================================
    // Schemas
    // =========================================================================

    /// Registers a schema with derived descriptors.
    ///
    /// `embedding_fields` name the text properties to embed (at most two);
    /// they bind to the configured default provider. For per-field
    /// provider control use [`register_schema_definition`](Self::register_schema_definition).
    pub fn register_schema(
        &self,
        name: &str,
        json_schema: Value,
        indexed_fields: Vec<String>,
        embedding_fields: Vec<String>,
    ) -> Result<()> {
        let provider = self.store.config().default_embedding_provider.clone();
        let definition = SchemaDefinition::new(name, json_schema)
            .with_indexed_fields(indexed_fields)
            .with_embedding_fields(
                embedding_fields
                    .into_iter()
                    .map(|field| EmbeddingField {
                        field,
                        provider: provider.clone(),
                    })
                    .collect(),
            );
        self.store.register_schema(definition)
    }

    /// Registers a fully specified schema definition.
    pub fn register_schema_definition(&self, definition: SchemaDefinition) -> Result<()> {
        self.store.register_schema(definition)
    }

    /// Returns a schema by short name or FQN.
    pub fn get_schema(&self, name: &str) -> Result<SchemaDefinition> {
        self.store.get_schema(name)
    }

    /// Lists registered schema short names, optionally by category.
    pub fn list_schemas(&self, category: Option<&str>) -> Vec<String> {
        self.store.list_schemas(category)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Inserts one record; embedding generation is queued in the
    /// background when the schema declares embedding fields.
    pub fn insert(&self, schema: &str, record: Value) -> Result<EntityId> {
        let record = into_object(record)?;
        Ok(self.store.upsert(schema, vec![record])?.remove(0))
    }

    /// Inserts one record, generating embeddings synchronously so the
    /// vector is searchable when this returns.
    pub fn insert_with_embedding(&self, schema: &str, record: Value) -> Result<EntityId> {
        self.store.insert_with_embedding(schema, into_object(record)?)
    }

    /// Upserts a batch of records, one id per record.
    ///
    /// Schemas with a `key_field` derive deterministic ids, making
    /// repeated upserts idempotent updates.
    pub fn upsert(&self, schema: &str, records: Vec<Value>) -> Result<Vec<EntityId>> {
        let records = records
            .into_iter()
            .map(into_object)
            .collect::<Result<Vec<_>>>()?;
        self.store.upsert(schema, records)
    }

    /// Soft-deletes an entity. It stays readable by id but disappears
    /// from scans and search; compaction hard-deletes later.
    pub fn delete(&self, id: EntityId) -> Result<()> {
        self.store.delete(id)
    }

    /// Adds a typed edge from `src` to `dst`.
    pub fn add_edge(&self, src: EntityId, dst: EntityId, rel_type: &str) -> Result<()> {
        self.store.add_edge(src, dst, rel_type, Map::new())
    }

    /// Hard-deletes tombstoned entities older than `older_than`.
    ///
    /// Soft-deleted rows stay replayable until compaction; run this
    /// with a horizon past the replication reconnect ceiling so peers
    /// have had the chance to apply the deletes. Returns the number of
    /// rows reclaimed.
    pub fn compact(&self, older_than: Duration) -> Result<usize> {
        self.store.compact(older_than)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Retrieves an entity by id, including tombstoned ones.
    pub fn get(&self, id: EntityId) -> Result<Option<Entity>> {
        self.store.get(id)
    }

    /// Scans entities: one schema, or every schema when `None`.
    ///
    /// Tombstoned rows are elided; use [`scan_with`](Self::scan_with) to
    /// include them.
    pub fn scan(&self, schema: Option<&str>) -> Result<Vec<Entity>> {
        match schema {
            Some(schema) => self.store.scan(schema, &ScanOptions::default()),
            None => {
                let mut entities = self.store.storage().scan_all()?;
                entities.retain(|e| !e.is_deleted());
                Ok(entities)
            }
        }
    }

    /// Scans a schema with predicate, ordering and paging options.
    pub fn scan_with(&self, schema: &str, options: &ScanOptions) -> Result<Vec<Entity>> {
        self.store.scan(schema, options)
    }

    // =========================================================================
    // Embeddings
    // =========================================================================

    /// Blocks until the embedding worker has drained its queue or the
    /// timeout elapses. Returns true when fully drained.
    ///
    /// Callers that need read-your-embedding freshness invoke this before
    /// searching.
    pub fn wait_for_worker(&self, timeout: Duration) -> bool {
        match &self.worker {
            Some(worker) => worker.wait_idle(&self.store, timeout),
            None => self
                .store
                .storage()
                .pending_count()
                .map(|n| n == 0)
                .unwrap_or(true),
        }
    }

    // =========================================================================
    // Query
    // =========================================================================

    /// Plans a natural-language query into a typed [`QueryPlan`].
    ///
    /// With a chat model attached the plan is LLM-generated and
    /// re-validated; otherwise (or on any model failure) the rule planner
    /// answers. Identifier inputs always take the LOOKUP fast path.
    pub fn plan_query(&self, query: &str, schema_hint: Option<&str>) -> Result<QueryPlan> {
        let schemas: Vec<SchemaDefinition> = self
            .list_schemas(None)
            .iter()
            .filter_map(|name| self.get_schema(name).ok())
            .collect();

        let model = self
            .chat_model
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        match model {
            Some(model) => plan_query_with_model(model.as_ref(), query, schema_hint, &schemas),
            None => plan_query(query, schema_hint, &schemas),
        }
    }

    /// Executes a validated plan, following fallbacks on their triggers.
    pub fn execute_plan(&self, plan: &QueryPlan) -> Result<QueryResult> {
        Executor::new(&self.store).execute_plan(plan)
    }

    /// Plans and executes a natural-language query in one call.
    pub fn query(&self, query: &str, schema_hint: Option<&str>) -> Result<QueryResult> {
        let plan = self.plan_query(query, schema_hint)?;
        self.execute_plan(&plan)
    }

    /// Executes one REM-SQL statement and returns its rows.
    pub fn sql(&self, query: &str) -> Result<Vec<Value>> {
        Executor::new(&self.store).sql(query)
    }

    /// Semantic search: embeds `query` with the schema's provider and
    /// returns `(entity, score)` pairs, best first, scores in `[0, 1]`.
    pub fn search(&self, query: &str, schema: &str, top_k: usize) -> Result<Vec<(Entity, f32)>> {
        self.store.search_text(query, schema, top_k, None)
    }

    /// Breadth-first graph traversal from `start`.
    pub fn traverse(
        &self,
        start: EntityId,
        depth: usize,
        direction: Direction,
        rel_type: Option<&str>,
    ) -> Result<TraversalResult> {
        graph::traverse(&self.store, start, depth, direction, rel_type)
    }

    // =========================================================================
    // LLM Assist
    // =========================================================================

    /// Attaches a chat model for LLM-assisted planning and edge
    /// extraction.
    pub fn set_chat_model(&self, model: Arc<dyn ChatModel>) {
        if let Ok(mut guard) = self.chat_model.lock() {
            *guard = Some(model);
        }
    }

    /// Extracts suggested edges from free text. Advisory: nothing is
    /// written; resolve names to ids and call
    /// [`add_edge`](Self::add_edge) to persist.
    pub fn extract_edges(&self, text: &str, context: &str) -> Result<EdgeExtraction> {
        let model = self
            .chat_model
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| RemDbError::provider("no chat model attached"))?;
        llm::extract_edges(model.as_ref(), text, context)
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Returns the replication health snapshot, or `None` when no mesh is
    /// configured.
    pub fn replication_status(&self) -> Option<ReplicationStatus> {
        self.replication
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|m| m.status()))
    }

    /// Starts (or restarts) the replication mesh from the configuration
    /// the database was opened with.
    pub fn start_replication(&self) -> Result<()> {
        let Some(replication_config) = self.store.config().replication.clone() else {
            return Err(RemDbError::config("no replication configuration"));
        };
        let mut guard = self
            .replication
            .lock()
            .map_err(|_| RemDbError::config("replication lock poisoned"))?;
        if guard.is_none() {
            *guard = Some(ReplicationManager::start(
                Arc::clone(&self.store),
                replication_config,
            )?);
        }
        Ok(())
    }

    /// Stops the replication mesh, leaving the database otherwise usable.
    pub fn stop_replication(&self) {
        if let Ok(mut guard) = self.replication.lock() {
            if let Some(manager) = guard.take() {
                manager.stop();
            }
        }
    }
}

impl std::fmt::Debug for RemDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemDb")
            .field("tenant", &self.store.config().tenant_id)
            .field("worker", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

fn into_object(record: Value) -> Result<Map<String, Value>> {
    match record {
        Value::Object(map) => Ok(map),
        other => Err(ValidationError::invalid_field(
            "record",
            format!("expected a JSON object, got {}", value_kind(&other)),
        )
        .into()),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
