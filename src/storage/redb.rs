//! redb storage engine implementation.
//!
//! This module provides the storage backend using
//! [redb](https://docs.rs/redb), a pure Rust embedded key-value store.
//!
//! # Atomicity
//!
//! Every multi-row mutation in higher layers flows through
//! [`Storage::commit_entity`], which writes the entity body, key index,
//! secondary index diffs, embedding queue changes and the WAL entry in a
//! single redb transaction. Either everything commits or nothing does,
//! which is what keeps the data model invariants intact across crashes.
//!
//! # File Layout
//!
//! One database file per tenant. Opening `./rem.db` creates:
//! - `./rem.db` - Main database file
//! - `./rem.db.lock` - Lock file for writer coordination (may not be visible)

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use redb::{Database, ReadableMultimapTable, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::tables::{
    self, DatabaseMetadata, EMBEDDINGS_TABLE, EMBEDDING_QUEUE_TABLE, ENTITIES_TABLE,
    HNSW_META_TABLE, ID_INDEX_TABLE, KEY_INDEX_TABLE, LAYOUT_VERSION, METADATA_KEY,
    METADATA_TABLE, SCHEMAS_TABLE, SECONDARY_TABLE, WAL_META_TABLE, WAL_TABLE,
};
use crate::entity::Entity;
use crate::error::{RemDbError, Result, StorageError};
use crate::schema::SchemaDefinition;
use crate::types::EntityId;
use crate::wal::{WalEntry, WalOperation, ENTITIES_TABLESPACE};

/// One secondary-index posting to add or remove.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Posting {
    /// Indexed field name.
    pub field: String,
    /// Order-preserving encoded value (see [`tables::encode_index_value`]).
    pub encoded: Vec<u8>,
}

/// A unit of embedding work queued durably alongside the write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbedJob {
    /// Schema of the entity to embed.
    pub schema: String,
    /// Entity id.
    pub id: EntityId,
    /// Property receiving the vector (`embedding` or `embedding_alt`).
    pub field: String,
    /// Provider registry name.
    pub provider: String,
    /// Source text to embed.
    pub text: String,
    /// Attempts made so far; bumped by the worker on retry.
    pub attempts: u32,
}

/// Everything one logical entity mutation touches, committed atomically.
#[derive(Clone, Debug)]
pub struct EntityCommit {
    /// The body to persist (already carrying final timestamps).
    pub entity: Entity,
    /// Derived key to record in the key index, if the schema has one.
    pub key_value: Option<String>,
    /// Postings to drop (the previous version's indexed values).
    pub removed_postings: Vec<Posting>,
    /// Postings to add (the new version's indexed values).
    pub added_postings: Vec<Posting>,
    /// Embedding work to enqueue.
    pub embedding_jobs: Vec<EmbedJob>,
    /// Queue keys to clear (work completed or superseded).
    pub completed_jobs: Vec<Vec<u8>>,
    /// Vectors to persist, keyed by embedding field.
    pub embeddings: Vec<(String, Vec<f32>)>,
    /// Put for inserts/updates, Delete for soft deletes.
    pub operation: WalOperation,
    /// Peer that originated this write (empty string for local writes
    /// before replication is configured).
    pub source_peer_id: String,
}

/// redb storage engine for one tenant.
///
/// `Storage` is `Send + Sync`; redb uses MVCC for readers and exclusive
/// locking for writers. Callers serialize writes through the database-level
/// write mutex so WAL sequence numbers stay monotonic.
pub struct Storage {
    /// The redb database handle.
    db: Database,

    /// Cached database metadata.
    metadata: DatabaseMetadata,

    /// Tenant scope baked into every key.
    tenant: String,

    /// Path to the database file.
    path: PathBuf,

    /// Last assigned WAL seq for the entities tablespace. The stored
    /// counter is validated against this on every append; disagreement is
    /// corruption and panics.
    last_seq: AtomicU64,
}

impl Storage {
    /// Opens or creates a tenant database at the given path.
    #[instrument(skip_all, fields(path = %path.as_ref().display(), tenant = tenant))]
    pub fn open(path: impl AsRef<Path>, tenant: &str) -> Result<Self> {
        let path = path.as_ref();
        let db_exists = path.exists();

        debug!(db_exists, "Opening storage engine");

        let db = Database::builder().create(path).map_err(|e| {
            if e.to_string().contains("locked") {
                StorageError::DatabaseLocked
            } else {
                StorageError::Redb(e.to_string())
            }
        })?;

        let storage = if db_exists {
            Self::open_existing(db, path.to_path_buf(), tenant)?
        } else {
            Self::initialize_new(db, path.to_path_buf(), tenant)?
        };

        Ok(storage)
    }

    fn initialize_new(db: Database, path: PathBuf, tenant: &str) -> Result<Self> {
        info!("Initializing new database");

        let metadata = DatabaseMetadata::new(tenant);

        let write_txn = db.begin_write().map_err(StorageError::from)?;
        {
            let mut meta_table = write_txn.open_table(METADATA_TABLE)?;
            let metadata_bytes =
                bincode::serialize(&metadata).map_err(StorageError::from)?;
            meta_table.insert(METADATA_KEY, metadata_bytes.as_slice())?;

            // Create remaining tables so later read transactions find them
            let _ = write_txn.open_table(ENTITIES_TABLE)?;
            let _ = write_txn.open_table(ID_INDEX_TABLE)?;
            let _ = write_txn.open_table(KEY_INDEX_TABLE)?;
            let _ = write_txn.open_multimap_table(SECONDARY_TABLE)?;
            let _ = write_txn.open_table(EMBEDDINGS_TABLE)?;
            let _ = write_txn.open_table(EMBEDDING_QUEUE_TABLE)?;
            let _ = write_txn.open_table(HNSW_META_TABLE)?;
            let _ = write_txn.open_table(WAL_TABLE)?;
            let _ = write_txn.open_table(WAL_META_TABLE)?;
            let _ = write_txn.open_table(SCHEMAS_TABLE)?;
        }
        write_txn.commit().map_err(StorageError::from)?;

        info!(layout_version = LAYOUT_VERSION, "Database initialized");

        Ok(Self {
            db,
            metadata,
            tenant: tenant.to_string(),
            path,
            last_seq: AtomicU64::new(0),
        })
    }

    fn open_existing(db: Database, path: PathBuf, tenant: &str) -> Result<Self> {
        info!("Opening existing database");

        let read_txn = db.begin_read().map_err(StorageError::from)?;
        let metadata = {
            let meta_table = read_txn
                .open_table(METADATA_TABLE)
                .map_err(|e| StorageError::corrupted(format!("Cannot open metadata table: {}", e)))?;
            let metadata_bytes = meta_table
                .get(METADATA_KEY)
                .map_err(StorageError::from)?
                .ok_or_else(|| StorageError::corrupted("Missing database metadata"))?;
            bincode::deserialize::<DatabaseMetadata>(metadata_bytes.value())
                .map_err(|e| StorageError::corrupted(format!("Invalid metadata format: {}", e)))?
        };

        if metadata.layout_version != LAYOUT_VERSION {
            warn!(
                expected = LAYOUT_VERSION,
                found = metadata.layout_version,
                "Layout version mismatch"
            );
            return Err(RemDbError::Storage(StorageError::LayoutVersionMismatch {
                expected: LAYOUT_VERSION,
                found: metadata.layout_version,
            }));
        }
        if metadata.tenant_id != tenant {
            return Err(StorageError::corrupted(format!(
                "database belongs to tenant '{}', opened as '{}'",
                metadata.tenant_id, tenant
            ))
            .into());
        }

        let last_seq = {
            let meta = read_txn.open_table(WAL_META_TABLE)?;
            meta.get(tables::seq_meta_key(tenant, ENTITIES_TABLESPACE).as_str())?
                .map(|v| v.value())
                .unwrap_or(0)
        };
        drop(read_txn);

        let mut metadata = metadata;
        metadata.touch();

        let write_txn = db.begin_write().map_err(StorageError::from)?;
        {
            let mut meta_table = write_txn.open_table(METADATA_TABLE)?;
            let metadata_bytes = bincode::serialize(&metadata).map_err(StorageError::from)?;
            meta_table.insert(METADATA_KEY, metadata_bytes.as_slice())?;
        }
        write_txn.commit().map_err(StorageError::from)?;

        info!(last_seq, "Database opened successfully");

        Ok(Self {
            db,
            metadata,
            tenant: tenant.to_string(),
            path,
            last_seq: AtomicU64::new(last_seq),
        })
    }

    /// Returns the database metadata.
    #[inline]
    pub fn metadata(&self) -> &DatabaseMetadata {
        &self.metadata
    }

    /// Returns the path to the database file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the tenant this storage is scoped to.
    #[inline]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Returns the last assigned WAL sequence number.
    #[inline]
    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::Acquire)
    }

    /// Closes the storage engine, flushing any pending writes.
    pub fn close(self) -> Result<()> {
        info!("Closing storage engine");
        drop(self.db);
        Ok(())
    }

    // =========================================================================
    // Entity Commit (the atomic batch)
    // =========================================================================

    /// Commits one entity mutation atomically and appends its WAL entry.
    ///
    /// Returns the appended entry so the caller can hand it to replication.
    ///
    /// # Panics
    ///
    /// Panics if the persisted WAL counter disagrees with the in-memory
    /// one; that is a seq regression, which means corruption.
    #[instrument(skip_all, fields(id = %commit.entity.id, schema = %commit.entity.schema))]
    pub fn commit_entity(&self, commit: EntityCommit) -> Result<WalEntry> {
        let body = serde_json::to_vec(&commit.entity).map_err(StorageError::from)?;
        let entity_key = tables::entity_key(&self.tenant, &commit.entity.schema, commit.entity.id);

        let seq = self.last_seq.load(Ordering::Acquire) + 1;
        let entry = WalEntry {
            seq_num: seq,
            tenant_id: self.tenant.clone(),
            tablespace: ENTITIES_TABLESPACE.to_string(),
            operation: commit.operation,
            key: entity_key.clone(),
            value: body.clone(),
            timestamp: commit.entity.modified_at,
            source_peer_id: commit.source_peer_id.clone(),
        };

        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut entities = write_txn.open_table(ENTITIES_TABLE)?;
            entities.insert(entity_key.as_slice(), body.as_slice())?;

            let mut id_index = write_txn.open_table(ID_INDEX_TABLE)?;
            let id_key = tables::id_index_key(&self.tenant, commit.entity.id);
            id_index.insert(id_key.as_slice(), commit.entity.schema.as_str())?;

            if let Some(key_value) = &commit.key_value {
                let mut key_index = write_txn.open_table(KEY_INDEX_TABLE)?;
                let kk = tables::key_index_key(&self.tenant, &commit.entity.schema, key_value);
                key_index.insert(kk.as_slice(), commit.entity.id.as_bytes())?;
            }

            let mut secondary = write_txn.open_multimap_table(SECONDARY_TABLE)?;
            for posting in &commit.removed_postings {
                let pk = tables::posting_key(
                    &self.tenant,
                    &commit.entity.schema,
                    &posting.field,
                    &posting.encoded,
                );
                secondary.remove(pk.as_slice(), commit.entity.id.as_bytes())?;
            }
            for posting in &commit.added_postings {
                let pk = tables::posting_key(
                    &self.tenant,
                    &commit.entity.schema,
                    &posting.field,
                    &posting.encoded,
                );
                secondary.insert(pk.as_slice(), commit.entity.id.as_bytes())?;
            }

            let mut queue = write_txn.open_table(EMBEDDING_QUEUE_TABLE)?;
            for key in &commit.completed_jobs {
                queue.remove(key.as_slice())?;
            }
            for job in &commit.embedding_jobs {
                let qk = tables::queue_key(&self.tenant, &job.schema, job.id, &job.field);
                let value = bincode::serialize(job).map_err(StorageError::from)?;
                queue.insert(qk.as_slice(), value.as_slice())?;
            }

            if !commit.embeddings.is_empty() {
                let mut embeddings = write_txn.open_table(EMBEDDINGS_TABLE)?;
                for (field, vector) in &commit.embeddings {
                    let ek = tables::embedding_key(
                        &self.tenant,
                        &commit.entity.schema,
                        field,
                        commit.entity.id,
                    );
                    embeddings.insert(ek.as_slice(), embedding_to_bytes(vector).as_slice())?;
                }
            }

            let mut wal = write_txn.open_table(WAL_TABLE)?;
            let wk = tables::wal_key(&self.tenant, ENTITIES_TABLESPACE, seq);
            let entry_bytes = bincode::serialize(&entry).map_err(StorageError::from)?;
            wal.insert(wk.as_slice(), entry_bytes.as_slice())?;

            let mut wal_meta = write_txn.open_table(WAL_META_TABLE)?;
            let seq_key = tables::seq_meta_key(&self.tenant, ENTITIES_TABLESPACE);
            let stored = wal_meta.get(seq_key.as_str())?.map(|v| v.value()).unwrap_or(0);
            // Seq regression means the counter moved backwards underneath
            // us; continuing would corrupt the replication stream.
            assert!(
                stored + 1 == seq,
                "WAL sequence regression: stored {} but assigning {}",
                stored,
                seq
            );
            wal_meta.insert(seq_key.as_str(), seq)?;
        }
        write_txn.commit().map_err(StorageError::from)?;

        self.last_seq.store(seq, Ordering::Release);
        debug!(seq, "Entity committed");
        Ok(entry)
    }

    /// Physically removes a tombstoned entity's rows.
    ///
    /// Space reclamation, not a logical mutation: no WAL entry is
    /// emitted. Callers pass the derived key (if any) so the key index
    /// row goes too.
    pub fn hard_delete_entity(
        &self,
        schema: &str,
        id: EntityId,
        key_value: Option<&str>,
        embedding_slots: &[&str],
    ) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut entities = write_txn.open_table(ENTITIES_TABLE)?;
            let key = tables::entity_key(&self.tenant, schema, id);
            entities.remove(key.as_slice())?;

            let mut id_index = write_txn.open_table(ID_INDEX_TABLE)?;
            let id_key = tables::id_index_key(&self.tenant, id);
            id_index.remove(id_key.as_slice())?;

            if let Some(key_value) = key_value {
                let mut key_index = write_txn.open_table(KEY_INDEX_TABLE)?;
                let kk = tables::key_index_key(&self.tenant, schema, key_value);
                key_index.remove(kk.as_slice())?;
            }

            let mut embeddings = write_txn.open_table(EMBEDDINGS_TABLE)?;
            let mut queue = write_txn.open_table(EMBEDDING_QUEUE_TABLE)?;
            for slot in embedding_slots {
                let ek = tables::embedding_key(&self.tenant, schema, slot, id);
                embeddings.remove(ek.as_slice())?;
                let qk = tables::queue_key(&self.tenant, schema, id, slot);
                queue.remove(qk.as_slice())?;
            }
        }
        write_txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    // =========================================================================
    // Entity Reads
    // =========================================================================

    /// Retrieves an entity by id, resolving its schema via the id index.
    ///
    /// Returns tombstoned entities with `deleted_at` set.
    pub fn get_entity(&self, id: EntityId) -> Result<Option<Entity>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let id_index = read_txn.open_table(ID_INDEX_TABLE)?;
        let id_key = tables::id_index_key(&self.tenant, id);
        let Some(schema) = id_index.get(id_key.as_slice())?.map(|v| v.value().to_string()) else {
            return Ok(None);
        };

        let entities = read_txn.open_table(ENTITIES_TABLE)?;
        let key = tables::entity_key(&self.tenant, &schema, id);
        match entities.get(key.as_slice())? {
            Some(body) => {
                let entity = serde_json::from_slice(body.value()).map_err(StorageError::from)?;
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// Retrieves an entity when the schema is already known.
    pub fn get_entity_in_schema(&self, schema: &str, id: EntityId) -> Result<Option<Entity>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let entities = read_txn.open_table(ENTITIES_TABLE)?;
        let key = tables::entity_key(&self.tenant, schema, id);
        match entities.get(key.as_slice())? {
            Some(body) => {
                let entity = serde_json::from_slice(body.value()).map_err(StorageError::from)?;
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// Scans every entity of one schema in key order.
    pub fn scan_schema(&self, schema: &str) -> Result<Vec<Entity>> {
        let prefix = tables::entity_prefix(&self.tenant, schema);
        self.scan_prefix(&prefix)
    }

    /// Scans every entity of the tenant across all schemas.
    pub fn scan_all(&self) -> Result<Vec<Entity>> {
        let prefix = tables::tenant_prefix(&self.tenant);
        self.scan_prefix(&prefix)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Entity>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let entities = read_txn.open_table(ENTITIES_TABLE)?;

        let mut out = Vec::new();
        let iter = match tables::prefix_end(prefix) {
            Some(end) => entities.range(prefix..end.as_slice())?,
            None => entities.range(prefix..)?,
        };
        for item in iter {
            let (_, body) = item.map_err(StorageError::from)?;
            let entity: Entity =
                serde_json::from_slice(body.value()).map_err(StorageError::from)?;
            out.push(entity);
        }
        Ok(out)
    }

    // =========================================================================
    // Key Index
    // =========================================================================

    /// Resolves a derived key within one schema.
    pub fn lookup_key(&self, schema: &str, key_value: &str) -> Result<Option<EntityId>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let key_index = read_txn.open_table(KEY_INDEX_TABLE)?;
        let key = tables::key_index_key(&self.tenant, schema, key_value);
        Ok(key_index
            .get(key.as_slice())?
            .map(|v| EntityId::from_bytes(*v.value())))
    }

    // =========================================================================
    // Secondary Index
    // =========================================================================

    /// Returns the posting list for an exact field value.
    pub fn posting_ids(&self, schema: &str, field: &str, encoded: &[u8]) -> Result<Vec<EntityId>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let secondary = read_txn.open_multimap_table(SECONDARY_TABLE)?;
        let key = tables::posting_key(&self.tenant, schema, field, encoded);

        let mut ids = Vec::new();
        for value in secondary.get(key.as_slice())? {
            let value = value.map_err(StorageError::from)?;
            ids.push(EntityId::from_bytes(*value.value()));
        }
        Ok(ids)
    }

    /// Returns posting ids for an encoded value range within one field.
    ///
    /// `low`/`high` are encoded bounds relative to the field prefix; `None`
    /// means unbounded on that side. Both bounds are inclusive, matching
    /// REM-SQL's `>=` / `<=` after the caller adjusts strict comparisons.
    pub fn posting_ids_range(
        &self,
        schema: &str,
        field: &str,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<EntityId>)>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let secondary = read_txn.open_multimap_table(SECONDARY_TABLE)?;
        let prefix = tables::posting_prefix(&self.tenant, schema, field);

        let start = match low {
            Some(low) => {
                let mut key = prefix.clone();
                key.extend_from_slice(low);
                key
            }
            None => prefix.clone(),
        };
        let end = match high {
            Some(high) => {
                let mut key = prefix.clone();
                key.extend_from_slice(high);
                // Inclusive upper bound: step past keys equal to it
                key.push(0x00);
                Some(key)
            }
            None => tables::prefix_end(&prefix),
        };

        let iter = match &end {
            Some(end) => secondary.range(start.as_slice()..end.as_slice())?,
            None => secondary.range(start.as_slice()..)?,
        };

        let mut out = Vec::new();
        for item in iter {
            let (key, values) = item.map_err(StorageError::from)?;
            let encoded = key.value()[prefix.len()..].to_vec();
            let mut ids = Vec::new();
            for value in values {
                let value = value.map_err(StorageError::from)?;
                ids.push(EntityId::from_bytes(*value.value()));
            }
            out.push((encoded, ids));
        }
        Ok(out)
    }

    // =========================================================================
    // Embeddings & Queue
    // =========================================================================

    /// Retrieves a stored vector.
    pub fn get_embedding(
        &self,
        schema: &str,
        field: &str,
        id: EntityId,
    ) -> Result<Option<Vec<f32>>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let embeddings = read_txn.open_table(EMBEDDINGS_TABLE)?;
        let key = tables::embedding_key(&self.tenant, schema, field, id);
        Ok(embeddings
            .get(key.as_slice())?
            .map(|v| embedding_from_bytes(v.value())))
    }

    /// Lists every stored vector for one `(schema, field)` pair.
    ///
    /// Used to rebuild HNSW graphs on open; the embeddings table is the
    /// source of truth for the vector index.
    pub fn embeddings_for(&self, schema: &str, field: &str) -> Result<Vec<(EntityId, Vec<f32>)>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let embeddings = read_txn.open_table(EMBEDDINGS_TABLE)?;
        let prefix = tables::posting_prefix(&self.tenant, schema, field);

        let mut out = Vec::new();
        let iter = match tables::prefix_end(&prefix) {
            Some(end) => embeddings.range(prefix.as_slice()..end.as_slice())?,
            None => embeddings.range(prefix.as_slice()..)?,
        };
        for item in iter {
            let (key, value) = item.map_err(StorageError::from)?;
            let key = key.value();
            if key.len() < prefix.len() + 16 {
                continue;
            }
            let mut id = [0u8; 16];
            id.copy_from_slice(&key[key.len() - 16..]);
            out.push((EntityId::from_bytes(id), embedding_from_bytes(value.value())));
        }
        Ok(out)
    }

    /// Removes queue rows outside an entity commit.
    ///
    /// Used when the entity a job referenced no longer exists.
    pub fn remove_queue_entries(&self, keys: &[Vec<u8>]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut queue = write_txn.open_table(EMBEDDING_QUEUE_TABLE)?;
            for key in keys {
                queue.remove(key.as_slice())?;
            }
        }
        write_txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Counts pending embedding jobs for this tenant.
    pub fn pending_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let queue = read_txn.open_table(EMBEDDING_QUEUE_TABLE)?;
        let prefix = tables::tenant_prefix(&self.tenant);
        let iter = match tables::prefix_end(&prefix) {
            Some(end) => queue.range(prefix.as_slice()..end.as_slice())?,
            None => queue.range(prefix.as_slice()..)?,
        };
        Ok(iter.count())
    }

    /// Returns all pending embedding jobs with their queue keys.
    ///
    /// Called on open to re-enqueue work that survived a restart.
    pub fn pending_jobs(&self) -> Result<Vec<(Vec<u8>, EmbedJob)>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let queue = read_txn.open_table(EMBEDDING_QUEUE_TABLE)?;
        let prefix = tables::tenant_prefix(&self.tenant);

        let mut out = Vec::new();
        let iter = match tables::prefix_end(&prefix) {
            Some(end) => queue.range(prefix.as_slice()..end.as_slice())?,
            None => queue.range(prefix.as_slice()..)?,
        };
        for item in iter {
            let (key, value) = item.map_err(StorageError::from)?;
            let job: EmbedJob =
                bincode::deserialize(value.value()).map_err(StorageError::from)?;
            out.push((key.value().to_vec(), job));
        }
        Ok(out)
    }

    // =========================================================================
    // HNSW Metadata
    // =========================================================================

    /// Persists serialized HNSW metadata for one `(schema, field)` index.
    pub fn save_hnsw_meta(&self, schema: &str, field: &str, bytes: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut table = write_txn.open_table(HNSW_META_TABLE)?;
            let key = tables::hnsw_meta_key(&self.tenant, schema, field);
            table.insert(key.as_slice(), bytes)?;
        }
        write_txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Loads serialized HNSW metadata, if present.
    pub fn load_hnsw_meta(&self, schema: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let table = read_txn.open_table(HNSW_META_TABLE)?;
        let key = tables::hnsw_meta_key(&self.tenant, schema, field);
        Ok(table.get(key.as_slice())?.map(|v| v.value().to_vec()))
    }

    // =========================================================================
    // WAL
    // =========================================================================

    /// Reads WAL entries with `seq_num > after`, up to `limit`.
    pub fn wal_entries_after(
        &self,
        tablespace: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<WalEntry>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let wal = read_txn.open_table(WAL_TABLE)?;
        let start = tables::wal_key(&self.tenant, tablespace, after + 1);
        let prefix = tables::wal_prefix(&self.tenant, tablespace);

        let mut out = Vec::new();
        let iter = match tables::prefix_end(&prefix) {
            Some(end) => wal.range(start.as_slice()..end.as_slice())?,
            None => wal.range(start.as_slice()..)?,
        };
        for item in iter.take(limit) {
            let (_, value) = item.map_err(StorageError::from)?;
            let entry: WalEntry =
                bincode::deserialize(value.value()).map_err(StorageError::from)?;
            out.push(entry);
        }
        Ok(out)
    }

    /// Returns a peer's persisted watermark for a tablespace.
    pub fn peer_watermark(&self, peer: &str, tablespace: &str) -> Result<u64> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let meta = read_txn.open_table(WAL_META_TABLE)?;
        let key = tables::watermark_meta_key(peer, &self.tenant, tablespace);
        Ok(meta.get(key.as_str())?.map(|v| v.value()).unwrap_or(0))
    }

    /// Durably advances a peer's watermark.
    pub fn set_peer_watermark(&self, peer: &str, tablespace: &str, watermark: u64) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut meta = write_txn.open_table(WAL_META_TABLE)?;
            let key = tables::watermark_meta_key(peer, &self.tenant, tablespace);
            meta.insert(key.as_str(), watermark)?;
        }
        write_txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    // =========================================================================
    // Schema Persistence
    // =========================================================================

    /// Persists a schema definition.
    pub fn save_schema(&self, definition: &SchemaDefinition) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut table = write_txn.open_table(SCHEMAS_TABLE)?;
            let bytes = serde_json::to_vec(definition).map_err(StorageError::from)?;
            table.insert(definition.short_name.as_str(), bytes.as_slice())?;
        }
        write_txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Loads every persisted schema definition.
    pub fn load_schemas(&self) -> Result<Vec<SchemaDefinition>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let table = read_txn.open_table(SCHEMAS_TABLE)?;

        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, value) = item.map_err(StorageError::from)?;
            let definition: SchemaDefinition =
                serde_json::from_slice(value.value()).map_err(StorageError::from)?;
            out.push(definition);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("tenant", &self.tenant)
            .field("path", &self.path)
            .field("last_seq", &self.last_seq())
            .finish_non_exhaustive()
    }
}

/// Serializes a vector as little-endian f32 bytes.
pub fn embedding_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Deserializes little-endian f32 bytes back into a vector.
pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::storage::tables::encode_index_value;
    use serde_json::{json, Map};
    use tempfile::tempdir;

    fn open_storage(dir: &tempfile::TempDir) -> Storage {
        Storage::open(dir.path().join("test.db"), "t1").unwrap()
    }

    fn simple_commit(entity: Entity) -> EntityCommit {
        EntityCommit {
            entity,
            key_value: None,
            removed_postings: vec![],
            added_postings: vec![],
            embedding_jobs: vec![],
            completed_jobs: vec![],
            embeddings: vec![],
            operation: WalOperation::Put,
            source_peer_id: "local".to_string(),
        }
    }

    fn entity_with(name: &str) -> Entity {
        let mut props = Map::new();
        props.insert("name".to_string(), json!(name));
        Entity::new(EntityId::new(), "resources", props)
    }

    #[test]
    fn test_open_creates_new_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        assert!(!path.exists());

        let storage = Storage::open(&path, "t1").unwrap();
        assert!(path.exists());
        assert_eq!(storage.metadata().layout_version, LAYOUT_VERSION);
        assert_eq!(storage.tenant(), "t1");
        assert_eq!(storage.last_seq(), 0);

        storage.close().unwrap();
    }

    #[test]
    fn test_reopen_preserves_metadata_and_seq() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let storage = Storage::open(&path, "t1").unwrap();
        let created_at = storage.metadata().created_at;
        storage.commit_entity(simple_commit(entity_with("a"))).unwrap();
        storage.commit_entity(simple_commit(entity_with("b"))).unwrap();
        assert_eq!(storage.last_seq(), 2);
        storage.close().unwrap();

        let storage = Storage::open(&path, "t1").unwrap();
        assert_eq!(storage.metadata().created_at, created_at);
        assert_eq!(storage.last_seq(), 2);
        storage.close().unwrap();
    }

    #[test]
    fn test_wrong_tenant_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        Storage::open(&path, "t1").unwrap().close().unwrap();

        let result = Storage::open(&path, "t2");
        assert!(result.is_err());
    }

    #[test]
    fn test_commit_and_get_entity() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir);

        let entity = entity_with("doc");
        let id = entity.id;
        let entry = storage.commit_entity(simple_commit(entity.clone())).unwrap();
        assert_eq!(entry.seq_num, 1);
        assert_eq!(entry.operation, WalOperation::Put);

        let fetched = storage.get_entity(id).unwrap().unwrap();
        assert_eq!(fetched, entity);

        let in_schema = storage.get_entity_in_schema("resources", id).unwrap().unwrap();
        assert_eq!(in_schema.id, id);
        assert!(storage.get_entity(EntityId::new()).unwrap().is_none());
    }

    #[test]
    fn test_scan_schema_isolation() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir);

        storage.commit_entity(simple_commit(entity_with("a"))).unwrap();
        storage.commit_entity(simple_commit(entity_with("b"))).unwrap();
        let mut other = entity_with("s");
        other.schema = "sessions".to_string();
        storage.commit_entity(simple_commit(other)).unwrap();

        assert_eq!(storage.scan_schema("resources").unwrap().len(), 2);
        assert_eq!(storage.scan_schema("sessions").unwrap().len(), 1);
        assert_eq!(storage.scan_all().unwrap().len(), 3);
        assert!(storage.scan_schema("missing").unwrap().is_empty());
    }

    #[test]
    fn test_key_index_lookup() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir);

        let entity = entity_with("doc");
        let id = entity.id;
        let mut commit = simple_commit(entity);
        commit.key_value = Some("doc-key".to_string());
        storage.commit_entity(commit).unwrap();

        assert_eq!(storage.lookup_key("resources", "doc-key").unwrap(), Some(id));
        assert_eq!(storage.lookup_key("resources", "other").unwrap(), None);
    }

    #[test]
    fn test_posting_add_remove() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir);

        let entity = entity_with("doc");
        let id = entity.id;
        let encoded = encode_index_value(&json!("tutorial")).unwrap();

        let mut commit = simple_commit(entity.clone());
        commit.added_postings = vec![Posting {
            field: "category".to_string(),
            encoded: encoded.clone(),
        }];
        storage.commit_entity(commit).unwrap();

        assert_eq!(
            storage.posting_ids("resources", "category", &encoded).unwrap(),
            vec![id]
        );

        let mut commit = simple_commit(entity);
        commit.removed_postings = vec![Posting {
            field: "category".to_string(),
            encoded: encoded.clone(),
        }];
        storage.commit_entity(commit).unwrap();

        assert!(storage
            .posting_ids("resources", "category", &encoded)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_posting_range_scan() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir);

        let mut ids = Vec::new();
        for score in [10i64, 20, 30] {
            let entity = entity_with(&format!("doc-{}", score));
            ids.push(entity.id);
            let mut commit = simple_commit(entity);
            commit.added_postings = vec![Posting {
                field: "score".to_string(),
                encoded: encode_index_value(&json!(score)).unwrap(),
            }];
            storage.commit_entity(commit).unwrap();
        }

        let low = encode_index_value(&json!(15)).unwrap();
        let high = encode_index_value(&json!(30)).unwrap();
        let groups = storage
            .posting_ids_range("resources", "score", Some(&low), Some(&high))
            .unwrap();
        let found: Vec<EntityId> = groups.into_iter().flat_map(|(_, ids)| ids).collect();
        assert_eq!(found, vec![ids[1], ids[2]]);
    }

    #[test]
    fn test_embeddings_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir);

        let entity = entity_with("doc");
        let id = entity.id;
        let vector = vec![0.1f32, 0.2, 0.3];
        let mut commit = simple_commit(entity);
        commit.embeddings = vec![("embedding".to_string(), vector.clone())];
        storage.commit_entity(commit).unwrap();

        let stored = storage.get_embedding("resources", "embedding", id).unwrap().unwrap();
        assert_eq!(stored, vector);

        let all = storage.embeddings_for("resources", "embedding").unwrap();
        assert_eq!(all, vec![(id, vector)]);
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let storage = Storage::open(&path, "t1").unwrap();

        let entity = entity_with("doc");
        let id = entity.id;
        let mut commit = simple_commit(entity);
        commit.embedding_jobs = vec![EmbedJob {
            schema: "resources".to_string(),
            id,
            field: "embedding".to_string(),
            provider: "builtin-hash".to_string(),
            text: "hello".to_string(),
            attempts: 0,
        }];
        storage.commit_entity(commit).unwrap();
        storage.close().unwrap();

        let storage = Storage::open(&path, "t1").unwrap();
        let pending = storage.pending_jobs().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.id, id);
        assert_eq!(pending[0].1.text, "hello");
    }

    #[test]
    fn test_wal_entries_after() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir);

        for i in 0..5 {
            storage
                .commit_entity(simple_commit(entity_with(&format!("doc-{}", i))))
                .unwrap();
        }

        let entries = storage.wal_entries_after(ENTITIES_TABLESPACE, 2, 100).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq_num).collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        let limited = storage.wal_entries_after(ENTITIES_TABLESPACE, 0, 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_wal_seq_strictly_increasing() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir);

        let mut last = 0;
        for i in 0..10 {
            let entry = storage
                .commit_entity(simple_commit(entity_with(&format!("doc-{}", i))))
                .unwrap();
            assert!(entry.seq_num > last);
            last = entry.seq_num;
        }
    }

    #[test]
    fn test_peer_watermarks() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir);

        assert_eq!(storage.peer_watermark("peer-b", ENTITIES_TABLESPACE).unwrap(), 0);
        storage.set_peer_watermark("peer-b", ENTITIES_TABLESPACE, 42).unwrap();
        assert_eq!(storage.peer_watermark("peer-b", ENTITIES_TABLESPACE).unwrap(), 42);
    }

    #[test]
    fn test_schema_persistence() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir);

        let definition = crate::schema::SchemaDefinition::new("articles", json!({"type": "object"}));
        storage.save_schema(&definition).unwrap();

        let loaded = storage.load_schemas().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].short_name, "articles");
    }

    #[test]
    fn test_embedding_bytes_roundtrip() {
        let vector = vec![1.5f32, -2.25, 0.0];
        assert_eq!(embedding_from_bytes(&embedding_to_bytes(&vector)), vector);
    }
}
