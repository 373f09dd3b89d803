//! Replication role engine
//!
//! A process runs as either the leader of a replica set or as a replica of
//! exactly one leader. Both roles share the store and executor; what
//! differs is a small amount of role-specific state: leaders keep the
//! replication id, the propagated-byte offset and the replica registry,
//! replicas keep their leader's address and the count of replicated bytes
//! they have consumed.

pub mod handshake;
mod registry;

pub use registry::ReplicaRegistry;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Length of the replication identifier in hex characters.
pub const REPL_ID_LEN: usize = 40;

/// Hex encoding of the smallest valid snapshot in the on-disk file format.
/// Leaders send this blob to a freshly synchronized replica, which reads
/// it by length and discards it.
const EMPTY_SNAPSHOT_HEX: &str = "524544495330303131fa0972656469732d76657205372e322e30fa0a72656469732d62697473c040fa056374696d65c26d08bc65fa08757365642d6d656dc2b0c41000fa08616f662d62617365c000fff06e3bfec0ff5aa2";

/// Server role within the replication topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Replica,
}

impl Role {
    /// Role name as reported by `INFO replication`. The wire protocol
    /// keeps the traditional names.
    pub fn as_info_str(self) -> &'static str {
        match self {
            Role::Leader => "master",
            Role::Replica => "slave",
        }
    }
}

/// Replication state shared by the executor and the connection runtime.
pub struct Replication {
    state: RoleState,
}

enum RoleState {
    Leader(LeaderState),
    Replica(ReplicaState),
}

impl Replication {
    /// Leader-side state: a fresh replication id, a zero offset and an
    /// empty replica registry.
    pub fn leader() -> Self {
        Replication {
            state: RoleState::Leader(LeaderState::new()),
        }
    }

    /// Replica-side state, built once the handshake has yielded the
    /// leader's replication id.
    pub fn replica(leader_addr: String, repl_id: String) -> Self {
        Replication {
            state: RoleState::Replica(ReplicaState::new(leader_addr, repl_id)),
        }
    }

    pub fn role(&self) -> Role {
        match &self.state {
            RoleState::Leader(_) => Role::Leader,
            RoleState::Replica(_) => Role::Replica,
        }
    }

    /// The replication id: generated at leader start, learned from the
    /// FULLRESYNC reply on a replica.
    pub fn repl_id(&self) -> &str {
        match &self.state {
            RoleState::Leader(leader) => &leader.repl_id,
            RoleState::Replica(replica) => &replica.repl_id,
        }
    }

    /// The leader's replication offset. Replicas report zero; their own
    /// progress lives in `ReplicaState::bytes_processed`.
    pub fn offset(&self) -> u64 {
        match &self.state {
            RoleState::Leader(leader) => leader.offset.load(Ordering::SeqCst),
            RoleState::Replica(_) => 0,
        }
    }

    pub fn as_leader(&self) -> Option<&LeaderState> {
        match &self.state {
            RoleState::Leader(leader) => Some(leader),
            RoleState::Replica(_) => None,
        }
    }

    pub fn as_replica(&self) -> Option<&ReplicaState> {
        match &self.state {
            RoleState::Leader(_) => None,
            RoleState::Replica(replica) => Some(replica),
        }
    }
}

/// Leader-only replication state.
pub struct LeaderState {
    /// Fixed 40-hex identifier assigned at startup
    pub repl_id: String,

    /// Total bytes of write commands propagated to replicas
    pub offset: AtomicU64,

    /// The opaque snapshot blob served to full-resyncing replicas
    pub snapshot: Bytes,

    /// Currently subscribed replicas
    pub registry: Arc<ReplicaRegistry>,
}

impl LeaderState {
    fn new() -> Self {
        LeaderState {
            repl_id: generate_repl_id(),
            offset: AtomicU64::new(0),
            snapshot: empty_snapshot(),
            registry: Arc::new(ReplicaRegistry::new()),
        }
    }

    /// The two writes that answer a PSYNC: the `+FULLRESYNC <replid> 0`
    /// line, then the length-prefixed snapshot blob. The blob is not
    /// CRLF-terminated.
    pub fn full_resync_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(format!("+FULLRESYNC {} 0\r\n", self.repl_id).as_bytes());
        buf.put_slice(format!("${}\r\n", self.snapshot.len()).as_bytes());
        buf.put_slice(&self.snapshot);
        buf.freeze()
    }
}

/// Replica-only replication state.
pub struct ReplicaState {
    /// `host:port` of the leader we replicate from
    pub leader_addr: String,

    /// Replication id announced by the leader's FULLRESYNC
    pub repl_id: String,

    bytes_processed: AtomicU64,
}

impl ReplicaState {
    fn new(leader_addr: String, repl_id: String) -> Self {
        ReplicaState {
            leader_addr,
            repl_id,
            bytes_processed: AtomicU64::new(0),
        }
    }

    /// Total count of replicated command bytes consumed from the leader
    /// stream so far. This is the number a `REPLCONF ACK` reports.
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::SeqCst)
    }

    /// Advance the consumed-byte count by one command's wire length.
    pub fn add_processed(&self, wire_len: u64) {
        self.bytes_processed.fetch_add(wire_len, Ordering::SeqCst);
    }
}

/// Generate a fresh 40-character hex replication identifier.
fn generate_repl_id() -> String {
    const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..REPL_ID_LEN)
        .map(|_| HEX_DIGITS[rng.gen_range(0..HEX_DIGITS.len())] as char)
        .collect()
}

fn empty_snapshot() -> Bytes {
    // compiled-in constant; validated by tests
    Bytes::from(hex::decode(EMPTY_SNAPSHOT_HEX).expect("snapshot constant is valid hex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repl_id_shape() {
        let id = generate_repl_id();
        assert_eq!(id.len(), REPL_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_repl_ids_are_distinct() {
        assert_ne!(generate_repl_id(), generate_repl_id());
    }

    #[test]
    fn test_empty_snapshot_decodes() {
        let blob = empty_snapshot();
        assert_eq!(blob.len(), 88);
        assert!(blob.starts_with(b"REDIS"));
    }

    #[test]
    fn test_full_resync_payload_layout() {
        let replication = Replication::leader();
        let leader = replication.as_leader().unwrap();
        let payload = leader.full_resync_payload();

        let preamble = format!("+FULLRESYNC {} 0\r\n$88\r\n", leader.repl_id);
        assert!(payload.starts_with(preamble.as_bytes()));
        // the blob follows the header directly, with no trailing CRLF
        assert_eq!(payload.len(), preamble.len() + 88);
        assert!(!payload.ends_with(b"\r\n"));
    }

    #[test]
    fn test_role_accessors() {
        let leader = Replication::leader();
        assert_eq!(leader.role(), Role::Leader);
        assert_eq!(leader.role().as_info_str(), "master");
        assert!(leader.as_leader().is_some());
        assert!(leader.as_replica().is_none());

        let replica = Replication::replica("127.0.0.1:6379".to_owned(), "a".repeat(40));
        assert_eq!(replica.role(), Role::Replica);
        assert_eq!(replica.role().as_info_str(), "slave");
        assert_eq!(replica.repl_id().len(), 40);
        assert_eq!(replica.offset(), 0);
    }

    #[test]
    fn test_replica_byte_accounting() {
        let replica = ReplicaState::new("127.0.0.1:6379".to_owned(), "a".repeat(40));
        assert_eq!(replica.bytes_processed(), 0);
        replica.add_processed(31);
        replica.add_processed(37);
        assert_eq!(replica.bytes_processed(), 68);
    }
}
