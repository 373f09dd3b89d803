//! In-memory storage implementation

use super::entry::StoreValue;
use bytes::Bytes;
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;

/// Type alias for our hash map with SipHasher
type StoreMap = HashMap<Bytes, StoreValue, BuildHasherDefault<SipHasher13>>;

/// In-memory key-value store with per-key expiry.
///
/// Expired entries are logically absent: `get` evicts them lazily, and the
/// background sweep (`sweep_expired`) retires them in sampled batches so a
/// large store converges without ever being scanned in one go.
pub struct MemoryStore {
    /// The main storage map
    entries: StoreMap,

    /// Rotating start position for the sampled sweep
    sweep_cursor: usize,
}

impl MemoryStore {
    /// Create a new memory store with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new memory store with specified initial capacity
    pub fn with_capacity(capacity: usize) -> Self {
        MemoryStore {
            entries: HashMap::with_capacity_and_hasher(
                capacity,
                BuildHasherDefault::<SipHasher13>::default(),
            ),
            sweep_cursor: 0,
        }
    }

    /// Install `value` under `key`, replacing any previous value and
    /// deadline. `ttl_ms` of zero means no expiry.
    pub fn set(&mut self, key: impl Into<Bytes>, value: Bytes, ttl_ms: u64) {
        self.entries.insert(key.into(), StoreValue::new(value, ttl_ms));
    }

    /// Fetch the live value under `key`. An entry whose deadline has
    /// passed is removed here and reported as absent.
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        let expired = self
            .entries
            .get(key)
            .map(|entry| entry.is_expired())
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Number of entries, expired-but-unswept ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sample up to `max_samples` entries and evict the expired ones.
    ///
    /// A cursor rotates the sampling window between calls so successive
    /// sweeps visit different entries and eventually cover the whole map.
    pub fn sweep_expired(&mut self, max_samples: usize) -> SweepOutcome {
        let total = self.entries.len();
        if total == 0 {
            self.sweep_cursor = 0;
            return SweepOutcome::default();
        }

        let start = self.sweep_cursor % total;
        let sampled: Vec<Bytes> = self
            .entries
            .keys()
            .cycle()
            .skip(start)
            .take(max_samples.min(total))
            .cloned()
            .collect();

        let mut expired = 0;
        for key in &sampled {
            let dead = self
                .entries
                .get(key)
                .map(|entry| entry.is_expired())
                .unwrap_or(false);
            if dead {
                self.entries.remove(key);
                expired += 1;
            }
        }

        self.sweep_cursor = start + sampled.len();
        SweepOutcome {
            inspected: sampled.len(),
            expired,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters from one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub inspected: usize,
    pub expired: usize,
}
