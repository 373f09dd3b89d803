//! Leader-side registry of subscribed replicas
//!
//! Each registered replica owns a dedicated forwarder task draining an
//! unbounded queue into the socket's write half. Propagation only ever
//! enqueues, so one slow or dead replica cannot stall the accept loop,
//! other replicas, or the client that issued the write. A replica whose
//! socket write fails removes itself from the registry.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

/// One subscribed replica: its outbound queue and the highest replication
/// offset it has acknowledged.
struct ReplicaEntry {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
    acked: Arc<AtomicU64>,
}

/// Ordered list of outbound sinks to currently subscribed replicas.
pub struct ReplicaRegistry {
    entries: Mutex<Vec<ReplicaEntry>>,
    next_id: AtomicU64,
    ack_notify: Notify,
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        ReplicaRegistry {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            ack_notify: Notify::new(),
        }
    }

    /// Register `writer` as a new replica sink and spawn its forwarder
    /// task. Returns the registry id the owning connection uses to route
    /// later `REPLCONF ACK`s.
    pub async fn register(self: Arc<Self>, writer: OwnedWriteHalf) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = ReplicaEntry {
            id,
            tx,
            acked: Arc::new(AtomicU64::new(0)),
        };
        self.entries.lock().await.push(entry);

        tokio::spawn(async move {
            forward_to_replica(self, id, writer, rx).await;
        });

        info!("registered replica {}", id);
        id
    }

    /// Queue `payload` to every subscribed replica. Entries whose
    /// forwarder has already stopped are dropped on the spot.
    pub async fn propagate(&self, payload: Bytes) {
        let mut entries = self.entries.lock().await;
        entries.retain(|entry| entry.tx.send(payload.clone()).is_ok());
    }

    /// Record an acknowledged offset from replica `id`. Acks only move
    /// forward; a stale ack is ignored.
    pub async fn record_ack(&self, id: u64, offset: u64) {
        {
            let entries = self.entries.lock().await;
            match entries.iter().find(|entry| entry.id == id) {
                Some(entry) => {
                    entry.acked.fetch_max(offset, Ordering::SeqCst);
                }
                None => {
                    warn!("ack from unregistered replica {}", id);
                    return;
                }
            }
        }
        self.ack_notify.notify_waiters();
    }

    /// Number of replicas whose acknowledged offset has reached `target`.
    pub async fn count_acked(&self, target: u64) -> usize {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|entry| entry.acked.load(Ordering::SeqCst) >= target)
            .count()
    }

    /// Number of currently subscribed replicas.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Resolve the next time any replica acknowledges an offset. Callers
    /// re-check their condition afterwards; `WAIT` pairs this with its own
    /// deadline.
    pub async fn ack_changed(&self) {
        self.ack_notify.notified().await;
    }

    async fn remove(&self, id: u64) {
        let mut entries = self.entries.lock().await;
        entries.retain(|entry| entry.id != id);
    }
}

impl Default for ReplicaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain the queue into the replica's socket until the channel closes or
/// a write fails, then deregister.
async fn forward_to_replica(
    registry: Arc<ReplicaRegistry>,
    id: u64,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(payload) = rx.recv().await {
        if let Err(e) = writer.write_all(&payload).await {
            warn!("write to replica {} failed, dropping it: {}", id, e);
            break;
        }
    }
    registry.remove(id).await;
    debug!("forwarder for replica {} stopped", id);
}
