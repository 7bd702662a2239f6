//! Replication client: one subscription per configured peer.
//!
//! The client offers its persisted watermark, applies the catch-up and
//! live entries it receives, and advances the watermark durably after
//! each apply. Disconnects reconnect with exponential backoff up to a
//! ceiling; after a reconnect the stream resumes from the last
//! acknowledged watermark, so in-flight entries are simply re-sent.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tonic::transport::Endpoint;
use tonic::Request;
use tracing::{debug, info, warn};

use super::codec::decode_entry;
use super::crypto::EntryCipher;
use super::proto;
use crate::config::PeerAddress;
use crate::store::EntityStore;
use crate::wal::ENTITIES_TABLESPACE;

/// Initial reconnect delay.
const BACKOFF_START: Duration = Duration::from_millis(500);

/// Reconnect delay ceiling.
const BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Point-in-time view of one peer connection, as exposed by health.
#[derive(Clone, Debug, Serialize)]
pub struct PeerStatus {
    /// Whether the subscription is currently established.
    pub connected: bool,
    /// Highest seq applied from this peer.
    pub watermark: u64,
    /// The peer's address.
    pub address: String,
}

/// Shared mutable state for one peer connection.
pub(crate) struct ClientState {
    status: Mutex<PeerStatus>,
}

impl ClientState {
    pub(crate) fn new(address: String, watermark: u64) -> Self {
        Self {
            status: Mutex::new(PeerStatus {
                connected: false,
                watermark,
                address,
            }),
        }
    }

    pub(crate) fn snapshot(&self) -> PeerStatus {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn set_connected(&self, connected: bool) {
        if let Ok(mut status) = self.status.lock() {
            status.connected = connected;
        }
    }

    fn set_watermark(&self, watermark: u64) {
        if let Ok(mut status) = self.status.lock() {
            status.watermark = watermark;
        }
    }
}

/// Runs the subscription loop for one peer until shutdown.
pub(crate) async fn run_client(
    store: Arc<EntityStore>,
    peer: PeerAddress,
    cipher: Option<Arc<EntryCipher>>,
    state: Arc<ClientState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_START;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match subscribe_once(&store, &peer, cipher.as_deref(), &state, &mut shutdown).await {
            Ok(()) => {
                // Clean disconnect (server closed); retry promptly
                backoff = BACKOFF_START;
            }
            Err(e) => {
                warn!(peer = %peer.peer_id, error = %e, "Peer subscription failed");
            }
        }
        state.set_connected(false);

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(BACKOFF_CEILING);
    }

    state.set_connected(false);
    debug!(peer = %peer.peer_id, "Replication client stopped");
}

async fn subscribe_once(
    store: &Arc<EntityStore>,
    peer: &PeerAddress,
    cipher: Option<&EntryCipher>,
    state: &ClientState,
    shutdown: &mut watch::Receiver<bool>,
) -> crate::error::Result<()> {
    use crate::error::ReplicationError;

    let endpoint = Endpoint::from_shared(format!("http://{}", peer.address))
        .map_err(|e| ReplicationError::transient(&peer.peer_id, e.to_string()))?
        .connect_timeout(Duration::from_secs(5));
    let channel = endpoint
        .connect()
        .await
        .map_err(|e| ReplicationError::transient(&peer.peer_id, e.to_string()))?;
    let mut client = proto::replication_client::ReplicationClient::new(channel);

    let watermark = store
        .storage()
        .peer_watermark(&peer.peer_id, ENTITIES_TABLESPACE)?;
    let offer = proto::WatermarkOffer {
        tenant_id: store.config().tenant_id.clone(),
        tablespace: ENTITIES_TABLESPACE.to_string(),
        watermark,
        peer_id: store.peer_id().to_string(),
    };

    let mut stream = client
        .subscribe(Request::new(tokio_stream::once(offer)))
        .await
        .map_err(|e| ReplicationError::transient(&peer.peer_id, e.to_string()))?
        .into_inner();

    state.set_connected(true);
    info!(peer = %peer.peer_id, watermark, "Subscribed to peer");

    loop {
        let message = tokio::select! {
            message = stream.message() => message,
            _ = shutdown.changed() => return Ok(()),
        };

        match message {
            Ok(Some(message)) => {
                let seq = message.seq_num;
                let entry = decode_entry(message, cipher)?;

                let apply_store = Arc::clone(store);
                let applied =
                    tokio::task::spawn_blocking(move || apply_store.apply_wal_entry(&entry))
                        .await
                        .map_err(|_| {
                            ReplicationError::transient(&peer.peer_id, "apply task failed")
                        })?;
                if let Err(e) = applied {
                    // A malformed or unapplicable entry is logged and
                    // skipped; the stream itself stays healthy
                    warn!(peer = %peer.peer_id, seq, error = %e, "Entry not applied");
                }

                store
                    .storage()
                    .set_peer_watermark(&peer.peer_id, ENTITIES_TABLESPACE, seq)?;
                state.set_watermark(seq);
            }
            Ok(None) => return Ok(()),
            Err(status) => {
                return Err(
                    ReplicationError::transient(&peer.peer_id, status.message().to_string())
                        .into(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_snapshot() {
        let state = ClientState::new("localhost:9001".into(), 5);
        let snapshot = state.snapshot();
        assert!(!snapshot.connected);
        assert_eq!(snapshot.watermark, 5);
        assert_eq!(snapshot.address, "localhost:9001");

        state.set_connected(true);
        state.set_watermark(9);
        let snapshot = state.snapshot();
        assert!(snapshot.connected);
        assert_eq!(snapshot.watermark, 9);
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut backoff = BACKOFF_START;
        for _ in 0..10 {
            backoff = (backoff * 2).min(BACKOFF_CEILING);
        }
        assert_eq!(backoff, BACKOFF_CEILING);
    }
}
