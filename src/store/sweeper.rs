//! Background expiry sweep
//!
//! Periodically samples the store and evicts expired entries. The sweep is
//! best-effort: lazy eviction in `MemoryStore::get` remains the
//! correctness backstop, the sweep just keeps dead entries from piling up.

use super::SharedStore;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How often the sweep runs.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// Upper bound on keys inspected per tick.
pub const SWEEP_SAMPLES: usize = 100;

/// Spawn the periodic sweeper. It holds the store lock only for the
/// duration of one sampled pass, and stops when `shutdown` fires.
pub fn spawn_sweeper(store: SharedStore, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_sweep_loop(store, shutdown).await;
    })
}

async fn run_sweep_loop(store: SharedStore, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval fires immediately once; skip that tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("expiry sweeper shutting down");
                return;
            }
            _ = ticker.tick() => {
                let outcome = sweep_once(&store).await;
                info!(
                    "expiry sweep inspected {} keys, evicted {}",
                    outcome.inspected, outcome.expired
                );
            }
        }
    }
}

async fn sweep_once(store: &SharedStore) -> crate::store::SweepOutcome {
    let mut guard = store.lock().await;
    guard.sweep_expired(SWEEP_SAMPLES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn test_sweep_once_evicts_expired() {
        let store: SharedStore = Arc::new(Mutex::new(MemoryStore::new()));
        {
            let mut guard = store.lock().await;
            guard.set("dead", Bytes::from("v"), 1);
            guard.set("live", Bytes::from("v"), 0);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = sweep_once(&store).await;
        assert_eq!(outcome.expired, 1);
        assert_eq!(store.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let store: SharedStore = Arc::new(Mutex::new(MemoryStore::new()));
        let shutdown = CancellationToken::new();
        let handle = spawn_sweeper(store, shutdown.clone());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
