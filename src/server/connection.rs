//! Connection handling
//!
//! One task per socket: decode frames, parse commands, dispatch, write
//! replies. The same loop serves plain clients, connections that turn
//! into replica links after a PSYNC, and (on a replica) the inbound
//! leader stream carrying propagated commands.

use crate::command::Command;
use crate::executor::{CommandSource, ConnectionKind, ExecOutcome, Executor};
use crate::protocol::{RespEncoder, RespParser, RespValue};
use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Connection handler
pub struct Connection {
    reader: OwnedReadHalf,

    /// Present until the connection is handed to the replica registry,
    /// which then owns all writes to this peer
    writer: Option<OwnedWriteHalf>,

    kind: ConnectionKind,

    /// Registry id once this connection completed a PSYNC
    replica_id: Option<u64>,

    read_buffer: BytesMut,
}

impl Connection {
    /// Wrap a freshly accepted client socket.
    pub fn new(stream: TcpStream) -> Self {
        Self::with_buffer(stream, BytesMut::with_capacity(4096), ConnectionKind::Client)
    }

    /// Wrap the leader link on a replica, seeded with any bytes the
    /// leader pipelined behind the handshake snapshot.
    pub fn leader_link(stream: TcpStream, leftover: BytesMut) -> Self {
        Self::with_buffer(stream, leftover, ConnectionKind::Leader)
    }

    fn with_buffer(stream: TcpStream, read_buffer: BytesMut, kind: ConnectionKind) -> Self {
        let (reader, writer) = stream.into_split();
        Connection {
            reader,
            writer: Some(writer),
            kind,
            replica_id: None,
            read_buffer,
        }
    }

    /// Serve the connection until EOF, error or shutdown. Frames execute
    /// in arrival order; a malformed frame gets a `-ERR` reply and closes
    /// the connection, a well-framed bad command only gets the error.
    pub async fn run(mut self, executor: Arc<Executor>, shutdown: CancellationToken) -> Result<()> {
        // the leader may have pipelined commands behind the handshake
        self.drain_frames(&executor).await?;

        loop {
            let read = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("connection closing on shutdown");
                    return Ok(());
                }
                read = self.reader.read_buf(&mut self.read_buffer) => read,
            };
            let n = read.context("failed reading from peer")?;
            if n == 0 {
                if self.read_buffer.is_empty() {
                    return Ok(());
                }
                bail!("connection reset by peer mid-frame");
            }
            self.drain_frames(&executor).await?;
        }
    }

    /// Process every complete frame currently buffered.
    async fn drain_frames(&mut self, executor: &Arc<Executor>) -> Result<()> {
        loop {
            let buffered = self.read_buffer.len();
            match RespParser::parse(&mut self.read_buffer) {
                Ok(Some(frame)) => {
                    let wire_len = (buffered - self.read_buffer.len()) as u64;
                    self.dispatch(frame, wire_len, executor).await?;
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("protocol error: {}", e);
                    let reply = RespValue::error(format!("ERR protocol error: {}", e));
                    self.write_frame(&reply).await.ok();
                    bail!("malformed frame from peer: {}", e);
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        frame: RespValue,
        wire_len: u64,
        executor: &Arc<Executor>,
    ) -> Result<()> {
        let result = self.dispatch_inner(frame, executor).await;

        // On the leader link every consumed frame advances the replica's
        // ack offset, response or not, but only after the command (and
        // any GETACK reply) is fully handled.
        if self.kind == ConnectionKind::Leader {
            if let Some(replica) = executor.replication().as_replica() {
                replica.add_processed(wire_len);
            }
        }
        result
    }

    async fn dispatch_inner(&mut self, frame: RespValue, executor: &Arc<Executor>) -> Result<()> {
        let command = match Command::parse(&frame) {
            Ok(command) => command,
            Err(e) => {
                warn!("rejecting command: {}", e);
                // bad commands keep the connection open; a replica stays
                // quiet about them on the leader link
                if self.kind != ConnectionKind::Leader {
                    self.write_frame(&RespValue::error(format!("ERR {}", e)))
                        .await?;
                }
                return Ok(());
            }
        };

        let source = CommandSource {
            kind: self.kind,
            replica_id: self.replica_id,
        };
        match executor.execute(command, source).await {
            ExecOutcome::Reply(reply) => self.write_frame(&reply).await,
            ExecOutcome::Silent => Ok(()),
            ExecOutcome::FullResync(payload) => self.become_replica(payload, executor).await,
        }
    }

    /// Finish a PSYNC: send the FULLRESYNC preamble and snapshot, then
    /// hand the write half to the replica registry. From here on this
    /// task only reads (acks and further REPLCONF traffic).
    async fn become_replica(&mut self, payload: Bytes, executor: &Arc<Executor>) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            bail!("PSYNC on a connection that is already a replica");
        };
        writer
            .write_all(&payload)
            .await
            .context("failed writing full resync payload")?;

        let Some(leader) = executor.replication().as_leader() else {
            bail!("full resync outcome on a replica");
        };
        let replica_id = leader.registry.clone().register(writer).await;
        self.kind = ConnectionKind::Replica;
        self.replica_id = Some(replica_id);
        debug!("connection reclassified as replica {}", replica_id);
        Ok(())
    }

    async fn write_frame(&mut self, frame: &RespValue) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            debug!("dropping {} reply on a registered replica connection", frame);
            return Ok(());
        };
        let payload = RespEncoder::encode(frame);
        writer
            .write_all(&payload)
            .await
            .context("failed writing reply")?;
        Ok(())
    }
}
