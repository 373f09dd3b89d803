//! Replica-side handshake
//!
//! Before serving clients, a replica dials its leader and walks a fixed
//! sequence: PING, REPLCONF listening-port, REPLCONF capa, PSYNC, then
//! reads and discards the snapshot blob. Every step has its own deadline
//! and any unexpected reply fails startup; there is no retry.

use crate::command::{Command, ReplConf};
use crate::protocol::{RespEncoder, RespParser, RespValue};
use crate::replication::REPL_ID_LEN;
use anyhow::{anyhow, bail, Context, Result};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::info;

/// Per-step deadline for handshake I/O.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// A completed handshake: the leader connection, any bytes the leader
/// already pipelined after the snapshot blob, and the leader's
/// replication id from the FULLRESYNC reply.
pub struct Handshake {
    pub stream: TcpStream,
    pub leftover: BytesMut,
    pub repl_id: String,
}

/// Drive the full handshake against `leader_addr`, announcing
/// `listening_port` as our own client-facing port.
pub async fn perform(leader_addr: &str, listening_port: u16) -> Result<Handshake> {
    let mut stream = tokio::time::timeout(STEP_TIMEOUT, TcpStream::connect(leader_addr))
        .await
        .context("timed out dialing leader")?
        .with_context(|| format!("failed to dial leader at {}", leader_addr))?;
    let mut buf = BytesMut::with_capacity(4096);

    let reply = exchange(&mut stream, &mut buf, &Command::Ping).await?;
    expect_simple(&reply, "PONG").context("unexpected reply to handshake PING")?;
    info!("handshake: leader answered PING");

    let announce = Command::ReplConf(ReplConf::ListeningPort(listening_port));
    let reply = exchange(&mut stream, &mut buf, &announce).await?;
    expect_simple(&reply, "OK").context("unexpected reply to REPLCONF listening-port")?;
    info!("handshake: announced listening port {}", listening_port);

    let capa = Command::ReplConf(ReplConf::Capa(vec!["psync2".to_owned()]));
    let reply = exchange(&mut stream, &mut buf, &capa).await?;
    expect_simple(&reply, "OK").context("unexpected reply to REPLCONF capa")?;
    info!("handshake: announced capabilities");

    let psync = Command::Psync {
        repl_id: "?".to_owned(),
        offset: "-1".to_owned(),
    };
    let reply = exchange(&mut stream, &mut buf, &psync).await?;
    let repl_id = parse_full_resync(&reply)?;
    read_snapshot(&mut stream, &mut buf)
        .await
        .context("failed to read snapshot blob")?;
    info!("handshake: full resync complete, leader replication id {}", repl_id);

    Ok(Handshake {
        stream,
        leftover: buf,
        repl_id,
    })
}

/// Send one command and read one reply frame, each under the step
/// deadline.
async fn exchange(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    command: &Command,
) -> Result<RespValue> {
    let payload = RespEncoder::encode(&command.encode());
    tokio::time::timeout(STEP_TIMEOUT, stream.write_all(&payload))
        .await
        .context("timed out writing handshake command")?
        .context("failed writing to leader")?;
    tokio::time::timeout(STEP_TIMEOUT, read_frame(stream, buf))
        .await
        .context("timed out awaiting handshake reply")?
}

async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<RespValue> {
    loop {
        if let Some(frame) = RespParser::parse(buf)? {
            return Ok(frame);
        }
        let n = stream
            .read_buf(buf)
            .await
            .context("failed reading from leader")?;
        if n == 0 {
            bail!("leader closed the connection mid-handshake");
        }
    }
}

fn expect_simple(reply: &RespValue, expected: &str) -> Result<()> {
    match reply {
        RespValue::SimpleString(text) if text == expected => Ok(()),
        other => Err(anyhow!("expected +{}, got {}", expected, other)),
    }
}

/// `+FULLRESYNC <replid> <offset>`; yields the replication id.
fn parse_full_resync(reply: &RespValue) -> Result<String> {
    let RespValue::SimpleString(text) = reply else {
        bail!("expected +FULLRESYNC, got {}", reply);
    };
    let mut parts = text.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("FULLRESYNC"), Some(repl_id), Some(_offset)) if repl_id.len() == REPL_ID_LEN => {
            Ok(repl_id.to_owned())
        }
        _ => bail!("malformed FULLRESYNC reply: {:?}", text),
    }
}

/// Read the `$<n>\r\n` header and then exactly `n` blob bytes. The blob is
/// not CRLF-terminated and its content is opaque: it is discarded. Bytes
/// the leader pipelined after the blob stay in `buf`.
async fn read_snapshot(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<()> {
    let blob_len = tokio::time::timeout(STEP_TIMEOUT, read_blob_header(stream, buf))
        .await
        .context("timed out reading snapshot header")??;
    while buf.len() < blob_len {
        let n = tokio::time::timeout(STEP_TIMEOUT, stream.read_buf(buf))
            .await
            .context("timed out reading snapshot body")?
            .context("failed reading from leader")?;
        if n == 0 {
            bail!("leader closed the connection inside the snapshot blob");
        }
    }
    buf.advance(blob_len);
    Ok(())
}

async fn read_blob_header(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<usize> {
    loop {
        if let Some(end) = buf.windows(2).position(|window| window == b"\r\n") {
            let line = buf.split_to(end + 2);
            let header = &line[..end];
            if header.first() != Some(&b'$') {
                bail!("malformed snapshot header: {:?}", header);
            }
            let text = std::str::from_utf8(&header[1..])
                .map_err(|_| anyhow!("snapshot length is not ASCII"))?;
            return text
                .parse::<usize>()
                .with_context(|| format!("malformed snapshot length {:?}", text));
        }
        let n = stream
            .read_buf(buf)
            .await
            .context("failed reading from leader")?;
        if n == 0 {
            bail!("leader closed the connection before the snapshot");
        }
    }
}
