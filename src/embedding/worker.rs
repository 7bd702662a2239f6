//! Background embedding worker.
//!
//! One worker thread per database instance (and therefore per tenant):
//! ordering of embedding write-backs within a tenant is preserved, and
//! separate tenants proceed in parallel in their own processes.
//!
//! The worker drains the durable queue table, so work enqueued before a
//! crash is picked up on the next open. Provider errors retry with
//! exponential backoff up to the configured attempt limit; permanent
//! failures are recorded on the entity as `embedding_error` and never
//! block other writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::error::{RemDbError, Result};
use crate::storage::EmbedJob;
use crate::store::EntityStore;

/// Poll interval while the queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(20);

/// Base delay for the retry backoff; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_millis(50);

/// Handle to the background embedding worker.
pub struct EmbeddingWorker {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    idle: Arc<AtomicBool>,
}

impl EmbeddingWorker {
    /// Spawns the worker thread for a store.
    pub fn spawn(store: Arc<EntityStore>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let idle = Arc::new(AtomicBool::new(true));

        let thread_shutdown = Arc::clone(&shutdown);
        let thread_idle = Arc::clone(&idle);
        let handle = std::thread::Builder::new()
            .name("remdb-embedding".to_string())
            .spawn(move || run(store, thread_shutdown, thread_idle))
            .map_err(|e| RemDbError::config(format!("failed to spawn embedding worker: {}", e)))?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
            idle,
        })
    }

    /// Blocks until the queue is drained and the worker is idle, or the
    /// timeout elapses. Returns true when fully drained.
    pub fn wait_idle(&self, store: &EntityStore, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let drained = self.idle.load(Ordering::Acquire)
                && store.storage().pending_count().map(|n| n == 0).unwrap_or(true);
            if drained {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Signals shutdown and joins the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EmbeddingWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(store: Arc<EntityStore>, shutdown: Arc<AtomicBool>, idle: Arc<AtomicBool>) {
    debug!("Embedding worker started");
    while !shutdown.load(Ordering::Acquire) {
        let jobs = match store.storage().pending_jobs() {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Embedding worker cannot read queue");
                std::thread::sleep(IDLE_POLL);
                continue;
            }
        };

        if jobs.is_empty() {
            idle.store(true, Ordering::Release);
            std::thread::sleep(IDLE_POLL);
            continue;
        }

        idle.store(false, Ordering::Release);
        for (queue_key, job) in jobs {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            process(&store, queue_key, job);
        }
    }
    debug!("Embedding worker stopped");
}

fn process(store: &EntityStore, queue_key: Vec<u8>, job: EmbedJob) {
    let max_attempts = store.config().embedding_max_attempts.max(1);

    let provider = match store.provider(&job.provider) {
        Ok(provider) => provider,
        Err(e) => {
            // Provider cannot be constructed at all; not retryable
            record_failure(store, &job, queue_key, &e.to_string());
            return;
        }
    };

    let mut last_error = String::new();
    for attempt in 0..max_attempts {
        match provider.embed(&job.text) {
            Ok(vector) => {
                if let Err(e) = store.complete_embedding(&job, queue_key, vector) {
                    error!(id = %job.id, error = %e, "Failed to write embedding back");
                }
                return;
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt + 1 < max_attempts {
                    let backoff = RETRY_BASE * 2u32.saturating_pow(attempt);
                    warn!(
                        id = %job.id,
                        attempt = attempt + 1,
                        error = %last_error,
                        "Embedding attempt failed, backing off"
                    );
                    std::thread::sleep(backoff);
                }
            }
        }
    }

    record_failure(store, &job, queue_key, &last_error);
}

fn record_failure(store: &EntityStore, job: &EmbedJob, queue_key: Vec<u8>, error: &str) {
    if let Err(e) = store.fail_embedding(job, queue_key, error) {
        error!(id = %job.id, error = %e, "Failed to record embedding failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::entity::EMBEDDING_ERROR_PROPERTY;
    use crate::schema::{EmbeddingField, SchemaDefinition};
    use serde_json::{json, Map, Value};
    use tempfile::tempdir;

    fn record(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_worker_embeds_queued_content() {
        let dir = tempdir().unwrap();
        let store =
            EntityStore::open(dir.path().join("test.db"), Config::for_tenant("t1")).unwrap();
        let worker = EmbeddingWorker::spawn(Arc::clone(&store)).unwrap();

        let ids = store
            .upsert(
                "resources",
                vec![record(json!({"name": "Doc", "content": "rust systems programming"}))],
            )
            .unwrap();

        assert!(worker.wait_idle(&store, Duration::from_secs(10)));

        let entity = store.get(ids[0]).unwrap().unwrap();
        let embedding = entity.property("embedding").unwrap().as_array().unwrap();
        assert_eq!(embedding.len(), 384);
        assert!(entity.property(EMBEDDING_ERROR_PROPERTY).is_none());

        // Vector is searchable once the worker reports idle
        let results = store
            .search_text("rust systems programming", "resources", 1, None)
            .unwrap();
        assert_eq!(results[0].0.id, ids[0]);

        worker.shutdown();
    }

    #[test]
    fn test_worker_records_permanent_failure() {
        let dir = tempdir().unwrap();
        let mut config = Config::for_tenant("t1");
        config.embedding_max_attempts = 2;
        let store = EntityStore::open(dir.path().join("test.db"), config).unwrap();

        // all-mpnet-base-v2 is a validate-only provider: embed() always fails
        store
            .register_schema(
                SchemaDefinition::new(
                    "notes",
                    json!({"type": "object", "properties": {"body": {"type": "string"}}}),
                )
                .with_embedding_fields(vec![EmbeddingField {
                    field: "body".into(),
                    provider: "all-mpnet-base-v2".into(),
                }]),
            )
            .unwrap();

        let worker = EmbeddingWorker::spawn(Arc::clone(&store)).unwrap();
        let ids = store
            .upsert("notes", vec![record(json!({"body": "some text"}))])
            .unwrap();

        assert!(worker.wait_idle(&store, Duration::from_secs(10)));

        let entity = store.get(ids[0]).unwrap().unwrap();
        assert!(
            entity.property(EMBEDDING_ERROR_PROPERTY).is_some(),
            "permanent failure must surface on the entity"
        );

        worker.shutdown();
    }

    #[test]
    fn test_worker_picks_up_jobs_from_previous_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        // Enqueue without a worker running
        let ids = {
            let store = EntityStore::open(&path, Config::for_tenant("t1")).unwrap();
            let ids = store
                .upsert(
                    "resources",
                    vec![record(json!({"name": "Doc", "content": "durable queue"}))],
                )
                .unwrap();
            store.flush().unwrap();
            ids
        };

        // Reopen: the queued job survives and gets processed
        let store = EntityStore::open(&path, Config::for_tenant("t1")).unwrap();
        assert_eq!(store.storage().pending_count().unwrap(), 1);
        let worker = EmbeddingWorker::spawn(Arc::clone(&store)).unwrap();
        assert!(worker.wait_idle(&store, Duration::from_secs(10)));

        let entity = store.get(ids[0]).unwrap().unwrap();
        assert!(entity.property("embedding").is_some());
        worker.shutdown();
    }
}
