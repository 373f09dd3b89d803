//! TTL-aware in-memory store

mod entry;
mod memory;
mod sweeper;

pub use entry::StoreValue;
pub use memory::{MemoryStore, SweepOutcome};
pub use sweeper::{spawn_sweeper, SWEEP_PERIOD, SWEEP_SAMPLES};

use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared handle to the store. The single mutex serializes readers,
/// writers and the expiry sweeper.
pub type SharedStore = Arc<Mutex<MemoryStore>>;
