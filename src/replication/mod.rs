//! Peer replication over gRPC.
//!
//! Each instance runs one server stream of WAL entries and one client per
//! configured peer, forming a mesh. The protocol contract:
//!
//! - On connect, a subscriber offers its last-known watermark per
//!   `(tenant, tablespace)`.
//! - The server replays historical entries past that watermark, then
//!   switches to live streaming.
//! - Each local write produces exactly one WAL entry, broadcast to all
//!   connected subscribers.
//! - Entries carry `source_peer_id`; receivers never re-apply or
//!   re-broadcast their own entries (loop suppression).
//! - Conflicts resolve last-write-wins by timestamp, ties broken by peer
//!   id lexicographic order.
//! - Clients reconnect with exponential backoff; watermarks persist in
//!   `wal_meta` across restarts.
//! - Optional ChaCha20-Poly1305 sealing wraps each entry for cross-tenant
//!   streams.

pub mod client;
pub mod codec;
pub mod crypto;
pub mod server;

/// Generated wire types for the replication service.
pub mod proto {
    #![allow(missing_docs)]
    tonic::include_proto!("remdb.replication.v1");
}

pub use client::PeerStatus;
pub use crypto::EntryCipher;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tonic::transport::Server;
use tracing::{info, warn};

use crate::config::{PeerAddress, ReplicationConfig};
use crate::error::{RemDbError, Result};
use crate::store::EntityStore;
use crate::wal::{WalEntry, ENTITIES_TABLESPACE};

/// Capacity of the live WAL broadcast feed. Subscribers that fall this
/// far behind are disconnected and catch up from their watermark.
const LIVE_FEED_CAPACITY: usize = 1024;

/// Snapshot of the server side of replication health.
#[derive(Clone, Debug, Serialize)]
pub struct ServerStatus {
    /// Bound listen address.
    pub listen_addr: String,
    /// Currently connected subscriber streams.
    pub connected_subscribers: u32,
    /// Highest local WAL seq.
    pub last_seq: u64,
}

/// Snapshot of overall replication health.
#[derive(Clone, Debug, Serialize)]
pub struct ReplicationStatus {
    /// Whether the manager is running.
    pub running: bool,
    /// This node's peer id.
    pub peer_id: String,
    /// Server-side health.
    pub server: ServerStatus,
    /// Per-peer client health, keyed by peer id.
    pub clients: BTreeMap<String, PeerStatus>,
}

/// Orchestrates the replication server and per-peer clients.
///
/// Owns its own tokio runtime so the synchronous database core stays
/// runtime-free; dropping or [`stop`](Self::stop)ping the manager tears
/// down every stream.
pub struct ReplicationManager {
    runtime: Option<tokio::runtime::Runtime>,
    store: Arc<EntityStore>,
    config: ReplicationConfig,
    shutdown_tx: watch::Sender<bool>,
    clients: Vec<(PeerAddress, Arc<client::ClientState>)>,
    subscribers: Arc<AtomicU32>,
}

impl ReplicationManager {
    /// Starts the server and connects to every configured peer.
    pub fn start(store: Arc<EntityStore>, config: ReplicationConfig) -> Result<Self> {
        let listen_addr: SocketAddr = config
            .listen_addr
            .parse()
            .map_err(|e| RemDbError::config(format!("bad listen address: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("remdb-replication")
            .enable_all()
            .build()
            .map_err(|e| RemDbError::config(format!("replication runtime: {}", e)))?;

        let (live_tx, _) = broadcast::channel::<WalEntry>(LIVE_FEED_CAPACITY);
        store.set_replication_feed(live_tx.clone());

        let cipher = config
            .encryption_key
            .as_ref()
            .map(|key| Arc::new(EntryCipher::new(key)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let subscribers = Arc::new(AtomicU32::new(0));

        // Server
        let service = server::ReplicationService::new(
            Arc::clone(&store),
            live_tx,
            cipher.clone(),
            config.peer_id.clone(),
            Arc::clone(&subscribers),
        );
        let mut server_shutdown = shutdown_rx.clone();
        runtime.spawn(async move {
            let result = Server::builder()
                .add_service(proto::replication_server::ReplicationServer::new(service))
                .serve_with_shutdown(listen_addr, async move {
                    let _ = server_shutdown.changed().await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "Replication server exited");
            }
        });

        // Clients, one per peer
        let mut clients = Vec::with_capacity(config.peers.len());
        for peer in &config.peers {
            let watermark = store
                .storage()
                .peer_watermark(&peer.peer_id, ENTITIES_TABLESPACE)
                .unwrap_or(0);
            let state = Arc::new(client::ClientState::new(peer.address.clone(), watermark));
            clients.push((peer.clone(), Arc::clone(&state)));

            runtime.spawn(client::run_client(
                Arc::clone(&store),
                peer.clone(),
                cipher.clone(),
                state,
                shutdown_rx.clone(),
            ));
        }

        info!(
            peer_id = %config.peer_id,
            listen = %config.listen_addr,
            peers = config.peers.len(),
            "Replication manager started"
        );

        Ok(Self {
            runtime: Some(runtime),
            store,
            config,
            shutdown_tx,
            clients,
            subscribers,
        })
    }

    /// Health snapshot for monitoring.
    pub fn status(&self) -> ReplicationStatus {
        let clients = self
            .clients
            .iter()
            .map(|(peer, state)| (peer.peer_id.clone(), state.snapshot()))
            .collect();

        ReplicationStatus {
            running: self.runtime.is_some(),
            peer_id: self.config.peer_id.clone(),
            server: ServerStatus {
                listen_addr: self.config.listen_addr.clone(),
                connected_subscribers: self.subscribers.load(Ordering::Relaxed),
                last_seq: self.store.storage().last_seq(),
            },
            clients,
        }
    }

    /// Stops the server and all client streams.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(std::time::Duration::from_secs(2));
        }
        info!(peer_id = %self.config.peer_id, "Replication manager stopped");
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        if self.runtime.is_some() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("peer_id", &self.config.peer_id)
            .field("peers", &self.config.peers.len())
            .field("running", &self.runtime.is_some())
            .finish()
    }
}
