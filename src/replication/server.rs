//! Replication server: catch-up plus live streaming of WAL entries.
//!
//! Subscribers open a `Subscribe` stream and offer their last applied
//! watermark; the server replays history past it from the WAL table, then
//! bridges onto the live broadcast feed. `Publish` is the push-mode path:
//! the peer streams entries and the server applies them locally.
//!
//! Loop suppression happens on both sides: the server never echoes a
//! subscriber its own entries, and appliers ignore entries whose source is
//! themselves.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use super::codec::{decode_entry, encode_entry};
use super::crypto::EntryCipher;
use super::proto;
use crate::store::EntityStore;
use crate::wal::{WalEntry, ENTITIES_TABLESPACE};

/// Batch size for historical replay reads.
const REPLAY_BATCH: usize = 256;

/// Outbound buffer per subscriber.
const SUBSCRIBER_BUFFER: usize = 256;

/// The gRPC replication service.
pub struct ReplicationService {
    store: Arc<EntityStore>,
    live: broadcast::Sender<WalEntry>,
    cipher: Option<Arc<EntryCipher>>,
    peer_id: String,
    subscribers: Arc<AtomicU32>,
}

impl ReplicationService {
    /// Creates the service over a store and its live WAL feed.
    pub fn new(
        store: Arc<EntityStore>,
        live: broadcast::Sender<WalEntry>,
        cipher: Option<Arc<EntryCipher>>,
        peer_id: String,
        subscribers: Arc<AtomicU32>,
    ) -> Self {
        Self {
            store,
            live,
            cipher,
            peer_id,
            subscribers,
        }
    }
}

#[tonic::async_trait]
impl proto::replication_server::Replication for ReplicationService {
    type SubscribeStream = ReceiverStream<Result<proto::WalEntry, Status>>;

    async fn subscribe(
        &self,
        request: Request<Streaming<proto::WatermarkOffer>>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let mut offers = request.into_inner();
        let offer = offers
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("subscriber must offer a watermark"))?;

        let subscriber = offer.peer_id.clone();
        let tablespace = if offer.tablespace.is_empty() {
            ENTITIES_TABLESPACE.to_string()
        } else {
            offer.tablespace.clone()
        };
        info!(
            subscriber = %subscriber,
            watermark = offer.watermark,
            "Subscriber connected"
        );

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let store = Arc::clone(&self.store);
        let cipher = self.cipher.clone();
        let mut live = self.live.subscribe();
        let counter = Arc::clone(&self.subscribers);

        counter.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let mut cursor = offer.watermark;

            // Historical catch-up past the offered watermark
            loop {
                let batch = {
                    let store = Arc::clone(&store);
                    let tablespace = tablespace.clone();
                    tokio::task::spawn_blocking(move || {
                        store
                            .storage()
                            .wal_entries_after(&tablespace, cursor, REPLAY_BATCH)
                    })
                    .await
                };
                let batch = match batch {
                    Ok(Ok(batch)) => batch,
                    Ok(Err(e)) => {
                        warn!(error = %e, "Replay read failed");
                        let _ = tx.send(Err(Status::internal("replay failed"))).await;
                        break;
                    }
                    Err(_) => break,
                };
                if batch.is_empty() {
                    break;
                }
                for entry in batch {
                    cursor = entry.seq_num;
                    if entry.source_peer_id == subscriber {
                        continue;
                    }
                    match encode_entry(&entry, cipher.as_deref()) {
                        Ok(message) => {
                            if tx.send(Ok(message)).await.is_err() {
                                counter.fetch_sub(1, Ordering::Relaxed);
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to encode replay entry"),
                    }
                }
            }

            debug!(subscriber = %subscriber, cursor, "Switching to live stream");

            // Live streaming from the broadcast feed
            loop {
                match live.recv().await {
                    Ok(entry) => {
                        if entry.seq_num <= cursor || entry.source_peer_id == subscriber {
                            continue;
                        }
                        cursor = entry.seq_num;
                        match encode_entry(&entry, cipher.as_deref()) {
                            Ok(message) => {
                                if tx.send(Ok(message)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "Failed to encode live entry"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // The subscriber fell behind the buffer; it will
                        // reconnect and catch up from its watermark
                        warn!(subscriber = %subscriber, missed, "Subscriber lagged");
                        let _ = tx
                            .send(Err(Status::data_loss("stream lagged; reconnect to catch up")))
                            .await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            counter.fetch_sub(1, Ordering::Relaxed);
            debug!(subscriber = %subscriber, "Subscriber stream ended");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn publish(
        &self,
        request: Request<Streaming<proto::WalEntry>>,
    ) -> Result<Response<proto::PublishAck>, Status> {
        let mut stream = request.into_inner();
        let mut applied = 0u64;

        while let Some(message) = stream.message().await? {
            let entry = decode_entry(message, self.cipher.as_deref())
                .map_err(|e| Status::invalid_argument(e.code().to_string()))?;

            let store = Arc::clone(&self.store);
            let result = tokio::task::spawn_blocking(move || store.apply_wal_entry(&entry))
                .await
                .map_err(|_| Status::internal("apply task failed"))?;

            match result {
                Ok(Some(_)) => applied += 1,
                Ok(None) => {}
                // Machine-readable code only; no stack traces cross the wire
                Err(e) => return Err(Status::internal(e.code().to_string())),
            }
        }

        Ok(Response::new(proto::PublishAck {
            applied,
            watermark: self.store.storage().last_seq(),
        }))
    }

    async fn health_check(
        &self,
        _request: Request<proto::HealthCheckRequest>,
    ) -> Result<Response<proto::HealthStatus>, Status> {
        Ok(Response::new(proto::HealthStatus {
            running: true,
            peer_id: self.peer_id.clone(),
            connected_subscribers: self.subscribers.load(Ordering::Relaxed),
            last_seq: self.store.storage().last_seq(),
        }))
    }
}
