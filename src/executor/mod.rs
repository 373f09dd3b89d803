//! Command execution
//!
//! Dispatches parsed commands against the store and the replication state
//! and decides what (if anything) goes back to the peer. The role rules
//! live here: a leader fans successful writes out to its replicas, a
//! replica stays silent on the leader link except for REPLCONF traffic.

use crate::command::{Command, ReplConf};
use crate::protocol::{RespEncoder, RespValue};
use crate::replication::Replication;
use crate::store::SharedStore;
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How a connection is tagged. CLIENT and REPLICA are inbound; LEADER is
/// the replica's own stream to its leader, carrying propagated commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Client,
    Leader,
    Replica,
}

/// The origin of a dispatched command.
#[derive(Debug, Clone, Copy)]
pub struct CommandSource {
    pub kind: ConnectionKind,
    /// Registry id, present once the connection completed a PSYNC
    pub replica_id: Option<u64>,
}

impl CommandSource {
    pub fn client() -> Self {
        CommandSource {
            kind: ConnectionKind::Client,
            replica_id: None,
        }
    }

    pub fn leader_link() -> Self {
        CommandSource {
            kind: ConnectionKind::Leader,
            replica_id: None,
        }
    }
}

/// What the connection should do with the outcome of a dispatch.
#[derive(Debug, PartialEq)]
pub enum ExecOutcome {
    /// Write this frame back to the peer
    Reply(RespValue),

    /// Nothing to send
    Silent,

    /// PSYNC accepted: write these raw bytes, then hand the connection's
    /// write half over to the replica registry
    FullResync(Bytes),
}

/// Executes commands against the shared store and replication state.
pub struct Executor {
    store: SharedStore,
    replication: Arc<Replication>,
}

impl Executor {
    pub fn new(store: SharedStore, replication: Arc<Replication>) -> Self {
        Executor { store, replication }
    }

    pub fn replication(&self) -> &Arc<Replication> {
        &self.replication
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Dispatch one command. FIFO order within a connection is the
    /// caller's responsibility; everything shared is locked here.
    pub async fn execute(&self, command: Command, source: CommandSource) -> ExecOutcome {
        debug!("executing {:?} from {:?}", command, source.kind);

        // A replica answers its leader only through REPLCONF; every other
        // reply on that link is swallowed after its effects are applied.
        let suppress = source.kind == ConnectionKind::Leader
            && !matches!(command, Command::ReplConf(_));

        let outcome = match command {
            Command::Ping => ExecOutcome::Reply(RespValue::simple_string("PONG")),
            Command::Echo(payload) => ExecOutcome::Reply(RespValue::BulkString(payload)),
            Command::Info(_section) => self.info(),
            Command::Get(key) => self.get(&key).await,
            Command::Set { key, value, ttl_ms } => self.set(key, value, ttl_ms, source).await,
            Command::ReplConf(conf) => self.replconf(conf, source).await,
            Command::Psync { .. } => self.psync(source),
            Command::Wait {
                num_replicas,
                timeout_ms,
            } => self.wait(num_replicas, timeout_ms).await,
        };

        if suppress && matches!(outcome, ExecOutcome::Reply(_)) {
            return ExecOutcome::Silent;
        }
        outcome
    }

    /// INFO replication: sorted `key:value` lines with a trailing newline.
    fn info(&self) -> ExecOutcome {
        // the section argument is validated at parse time
        let mut lines = vec![
            format!("master_repl_offset:{}", self.replication.offset()),
            format!("master_replid:{}", self.replication.repl_id()),
            format!("role:{}", self.replication.role().as_info_str()),
        ];
        lines.sort();
        let mut body = lines.join("\n");
        body.push('\n');
        ExecOutcome::Reply(RespValue::bulk_string(body))
    }

    async fn get(&self, key: &[u8]) -> ExecOutcome {
        let value = self.store.lock().await.get(key);
        match value {
            Some(value) => ExecOutcome::Reply(RespValue::BulkString(value)),
            None => ExecOutcome::Reply(RespValue::null()),
        }
    }

    /// SET installs the value and, on a leader, fans the re-encoded
    /// command out to every replica. The store lock is held across the
    /// write and its fan-out so replicated writes leave in the order the
    /// store applied them.
    async fn set(
        &self,
        key: Bytes,
        value: Bytes,
        ttl_ms: Option<u64>,
        source: CommandSource,
    ) -> ExecOutcome {
        let command = Command::Set {
            key: key.clone(),
            value: value.clone(),
            ttl_ms,
        };

        let mut store = self.store.lock().await;
        store.set(key, value, ttl_ms.unwrap_or(0));

        if let Some(leader) = self.replication.as_leader() {
            // writes arriving over the replication link are never re-propagated
            if source.kind == ConnectionKind::Client {
                let payload = RespEncoder::encode(&command.encode());
                leader.offset.fetch_add(payload.len() as u64, Ordering::SeqCst);
                leader.registry.propagate(payload).await;
            }
        }
        drop(store);

        ExecOutcome::Reply(RespValue::simple_string("OK"))
    }

    async fn replconf(&self, conf: ReplConf, source: CommandSource) -> ExecOutcome {
        match conf {
            // handshake chatter; the listening port and capabilities are
            // acknowledged and otherwise unused
            ReplConf::ListeningPort(port) => {
                debug!("replica announced listening port {}", port);
                ExecOutcome::Reply(RespValue::simple_string("OK"))
            }
            ReplConf::Capa(capabilities) => {
                debug!("replica announced capabilities {:?}", capabilities);
                ExecOutcome::Reply(RespValue::simple_string("OK"))
            }
            ReplConf::Ack(offset) => {
                match (self.replication.as_leader(), source.replica_id) {
                    (Some(leader), Some(replica_id)) => {
                        leader.registry.record_ack(replica_id, offset).await;
                    }
                    _ => warn!("REPLCONF ACK from a connection that is not a replica"),
                }
                // acks are never answered
                ExecOutcome::Silent
            }
            ReplConf::GetAck => match self.replication.as_replica() {
                Some(replica) if source.kind == ConnectionKind::Leader => {
                    // the ack reports the offset *before* this GETACK; the
                    // connection adds the GETACK's own bytes afterwards
                    let ack = Command::ReplConf(ReplConf::Ack(replica.bytes_processed()));
                    ExecOutcome::Reply(ack.encode())
                }
                _ => ExecOutcome::Reply(RespValue::error(
                    "ERR GETACK is only valid on a replica's leader connection",
                )),
            },
        }
    }

    /// PSYNC on a leader starts a full resync and reclassifies the
    /// connection; anywhere else it is a protocol error.
    fn psync(&self, source: CommandSource) -> ExecOutcome {
        match self.replication.as_leader() {
            Some(leader) => {
                if source.kind != ConnectionKind::Client {
                    return ExecOutcome::Reply(RespValue::error(
                        "ERR PSYNC from an already-registered replica",
                    ));
                }
                ExecOutcome::FullResync(leader.full_resync_payload())
            }
            None => ExecOutcome::Reply(RespValue::error("ERR PSYNC is not valid on a replica")),
        }
    }

    /// WAIT counts replicas acknowledged up to the current offset,
    /// soliciting fresh acks and blocking up to the caller's deadline when
    /// the count falls short.
    async fn wait(&self, num_replicas: u64, timeout_ms: u64) -> ExecOutcome {
        let Some(leader) = self.replication.as_leader() else {
            return ExecOutcome::Reply(RespValue::error("ERR WAIT is not valid on a replica"));
        };

        let target = leader.offset.load(Ordering::SeqCst);
        let mut count = leader.registry.count_acked(target).await;
        if count as u64 >= num_replicas {
            return ExecOutcome::Reply(RespValue::integer(count as i64));
        }

        // replicas only ack when asked
        let getack = RespEncoder::encode(&Command::ReplConf(ReplConf::GetAck).encode());
        leader.registry.propagate(getack).await;

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            count = leader.registry.count_acked(target).await;
            if count as u64 >= num_replicas {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if tokio::time::timeout(deadline - now, leader.registry.ack_changed())
                .await
                .is_err()
            {
                count = leader.registry.count_acked(target).await;
                break;
            }
        }
        ExecOutcome::Reply(RespValue::integer(count as i64))
    }
}
