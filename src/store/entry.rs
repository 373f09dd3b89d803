//! Stored values

use bytes::Bytes;
use std::time::{Duration, Instant};

/// A stored value with an optional absolute expiry deadline.
///
/// Deadlines come from the monotonic clock; a wall clock that can jump
/// backwards would resurrect expired keys.
#[derive(Debug, Clone)]
pub struct StoreValue {
    /// The value payload (binary-safe)
    pub value: Bytes,

    /// Absolute deadline, absent when no TTL was given
    pub expires_at: Option<Instant>,
}

impl StoreValue {
    /// Create a value; `ttl_ms` of zero means the key never expires.
    pub fn new(value: Bytes, ttl_ms: u64) -> Self {
        let expires_at = if ttl_ms > 0 {
            Some(Instant::now() + Duration::from_millis(ttl_ms))
        } else {
            None
        };
        StoreValue { value, expires_at }
    }

    /// Check whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}
