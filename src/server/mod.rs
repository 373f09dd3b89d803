//! Server runtime
//!
//! Binds the listener, runs the accept loop and wires the role engine
//! together: a leader serves clients immediately, a replica first walks
//! the handshake with its leader and only then starts draining accepted
//! clients.

mod connection;

pub use connection::Connection;

use crate::config::ServerConfig;
use crate::executor::Executor;
use crate::replication::{handshake, Replication};
use crate::store::{spawn_sweeper, MemoryStore, SharedStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Bind the configured address and run until `shutdown` fires.
///
/// Startup failures (bind error, replica handshake failure) propagate out
/// and map to a nonzero exit code in `main`.
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    info!("listening on {}", addr);
    serve(listener, config, shutdown).await
}

/// Run the server on an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let store: SharedStore = Arc::new(Mutex::new(MemoryStore::new()));

    // The listener is bound before the handshake, but no client is read
    // from until the handshake has brought us to steady state.
    let (replication, leader_link) = match &config.replicaof {
        None => (Replication::leader(), None),
        Some(leader_addr) => {
            let listening_port = listener
                .local_addr()
                .context("listener has no local address")?
                .port();
            let outcome = handshake::perform(leader_addr, listening_port)
                .await
                .context("replica handshake failed")?;
            let replication = Replication::replica(leader_addr.clone(), outcome.repl_id);
            let link = Connection::leader_link(outcome.stream, outcome.leftover);
            (replication, Some(link))
        }
    };
    info!("running as {}", replication.role().as_info_str());

    let executor = Arc::new(Executor::new(store.clone(), Arc::new(replication)));

    spawn_sweeper(store, shutdown.clone());

    if let Some(link) = leader_link {
        let executor = Arc::clone(&executor);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = link.run(executor, shutdown).await {
                error!("leader connection failed: {:#}", e);
            }
        });
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested, no longer accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                        continue;
                    }
                };
                info!("new connection from {}", peer);

                let executor = Arc::clone(&executor);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = Connection::new(socket).run(executor, shutdown).await {
                        error!("connection from {} closed: {:#}", peer, e);
                    } else {
                        info!("connection from {} closed", peer);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Spin up a leader on an ephemeral port; returns its address.
    async fn start_leader(shutdown: CancellationToken) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ServerConfig {
            port: addr.port(),
            replicaof: None,
        };
        tokio::spawn(async move {
            serve(listener, config, shutdown).await.unwrap();
        });
        addr.to_string()
    }

    /// Spin up a replica of `leader_addr`; returns its address.
    async fn start_replica(leader_addr: &str, shutdown: CancellationToken) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ServerConfig {
            port: addr.port(),
            replicaof: Some(leader_addr.to_owned()),
        };
        tokio::spawn(async move {
            serve(listener, config, shutdown).await.unwrap();
        });
        addr.to_string()
    }

    async fn send(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_all(payload).await.unwrap();
    }

    /// Read until `expected` bytes have arrived (and assert equality).
    async fn expect_reply(stream: &mut TcpStream, expected: &[u8]) {
        let mut received = vec![0u8; expected.len()];
        stream.read_exact(&mut received).await.unwrap();
        assert_eq!(
            &received[..],
            expected,
            "reply was {:?}",
            String::from_utf8_lossy(&received)
        );
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let shutdown = CancellationToken::new();
        let addr = start_leader(shutdown.clone()).await;

        let mut client = TcpStream::connect(&addr).await.unwrap();
        send(&mut client, b"*1\r\n$4\r\nPING\r\n").await;
        expect_reply(&mut client, b"+PONG\r\n").await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let shutdown = CancellationToken::new();
        let addr = start_leader(shutdown.clone()).await;

        let mut client = TcpStream::connect(&addr).await.unwrap();
        send(&mut client, b"*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n").await;
        expect_reply(&mut client, b"$3\r\nhey\r\n").await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let shutdown = CancellationToken::new();
        let addr = start_leader(shutdown.clone()).await;

        let mut client = TcpStream::connect(&addr).await.unwrap();
        send(&mut client, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n").await;
        expect_reply(&mut client, b"+OK\r\n").await;
        send(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await;
        expect_reply(&mut client, b"$1\r\nv\r\n").await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_set_with_ttl_expires() {
        let shutdown = CancellationToken::new();
        let addr = start_leader(shutdown.clone()).await;

        let mut client = TcpStream::connect(&addr).await.unwrap();
        send(
            &mut client,
            b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nPX\r\n$3\r\n100\r\n",
        )
        .await;
        expect_reply(&mut client, b"+OK\r\n").await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        send(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await;
        expect_reply(&mut client, b"$-1\r\n").await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_connection_open() {
        let shutdown = CancellationToken::new();
        let addr = start_leader(shutdown.clone()).await;

        let mut client = TcpStream::connect(&addr).await.unwrap();
        send(&mut client, b"*1\r\n$8\r\nFLUSHALL\r\n").await;
        let mut reply = Vec::new();
        client.read_buf(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"-ERR unknown command"));

        // still serviceable
        send(&mut client, b"*1\r\n$4\r\nPING\r\n").await;
        expect_reply(&mut client, b"+PONG\r\n").await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_malformed_frame_errors_and_closes() {
        let shutdown = CancellationToken::new();
        let addr = start_leader(shutdown.clone()).await;

        let mut client = TcpStream::connect(&addr).await.unwrap();
        send(&mut client, b"@bogus\r\n").await;
        let mut reply = Vec::new();
        client.read_buf(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"-ERR protocol error"));

        // the server hangs up after a framing violation
        let mut scratch = [0u8; 8];
        let n = client.read(&mut scratch).await.unwrap();
        assert_eq!(n, 0);
        shutdown.cancel();
    }

    /// Walk the replica handshake by hand against a live leader and leave
    /// the socket subscribed, returning it plus the leader's reported
    /// replication id.
    async fn manual_replica_handshake(addr: &str) -> (TcpStream, String) {
        let mut replica = TcpStream::connect(addr).await.unwrap();

        send(&mut replica, b"*1\r\n$4\r\nPING\r\n").await;
        expect_reply(&mut replica, b"+PONG\r\n").await;

        send(
            &mut replica,
            b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n",
        )
        .await;
        expect_reply(&mut replica, b"+OK\r\n").await;

        send(
            &mut replica,
            b"*3\r\n$8\r\nREPLCONF\r\n$4\r\ncapa\r\n$6\r\npsync2\r\n",
        )
        .await;
        expect_reply(&mut replica, b"+OK\r\n").await;

        send(&mut replica, b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n").await;

        // +FULLRESYNC <40 hex> 0\r\n
        let mut buf = BytesMut::new();
        while !buf.windows(2).any(|w| w == b"\r\n") {
            replica.read_buf(&mut buf).await.unwrap();
        }
        let line_end = buf.windows(2).position(|w| w == b"\r\n").unwrap();
        let line = String::from_utf8(buf[..line_end].to_vec()).unwrap();
        let _ = buf.split_to(line_end + 2);
        let mut parts = line.split_whitespace();
        assert_eq!(parts.next(), Some("+FULLRESYNC"));
        let repl_id = parts.next().unwrap().to_owned();
        assert_eq!(repl_id.len(), 40);
        assert_eq!(parts.next(), Some("0"));

        // $88\r\n then exactly 88 blob bytes, no trailing CRLF
        while !buf.windows(2).any(|w| w == b"\r\n") {
            replica.read_buf(&mut buf).await.unwrap();
        }
        let header_end = buf.windows(2).position(|w| w == b"\r\n").unwrap();
        assert_eq!(&buf[..header_end], b"$88");
        let _ = buf.split_to(header_end + 2);
        while buf.len() < 88 {
            replica.read_buf(&mut buf).await.unwrap();
        }
        let _ = buf.split_to(88);
        assert!(buf.is_empty(), "unexpected bytes after snapshot blob");

        // give the leader a beat to finish registering the sink
        tokio::time::sleep(Duration::from_millis(50)).await;

        (replica, repl_id)
    }

    #[tokio::test]
    async fn test_psync_handshake_and_propagation() {
        let shutdown = CancellationToken::new();
        let addr = start_leader(shutdown.clone()).await;

        let (mut replica, _repl_id) = manual_replica_handshake(&addr).await;

        // a write from a separate client is fanned out verbatim
        let mut client = TcpStream::connect(&addr).await.unwrap();
        send(&mut client, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n").await;
        expect_reply(&mut client, b"+OK\r\n").await;

        expect_reply(&mut replica, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n").await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_wait_counts_acknowledged_replicas() {
        let shutdown = CancellationToken::new();
        let addr = start_leader(shutdown.clone()).await;

        let (mut replica, _repl_id) = manual_replica_handshake(&addr).await;

        let mut client = TcpStream::connect(&addr).await.unwrap();
        let set_wire = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";
        send(&mut client, set_wire).await;
        expect_reply(&mut client, b"+OK\r\n").await;
        expect_reply(&mut replica, set_wire).await;

        // acknowledge everything propagated so far
        let ack = format!(
            "*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n${}\r\n{}\r\n",
            set_wire.len().to_string().len(),
            set_wire.len()
        );
        send(&mut replica, ack.as_bytes()).await;
        // allow the ack to land before WAIT samples the registry
        tokio::time::sleep(Duration::from_millis(50)).await;

        send(&mut client, b"*3\r\n$4\r\nWAIT\r\n$1\r\n1\r\n$3\r\n500\r\n").await;
        expect_reply(&mut client, b":1\r\n").await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_replica_serves_propagated_writes() {
        let shutdown = CancellationToken::new();
        let leader_addr = start_leader(shutdown.clone()).await;
        let replica_addr = start_replica(&leader_addr, shutdown.clone()).await;

        // the replica registers itself asynchronously and propagation is
        // asynchronous too, so write-then-read until the value lands
        let mut client = TcpStream::connect(&leader_addr).await.unwrap();
        let mut replica_client = TcpStream::connect(&replica_addr).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            send(&mut client, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n").await;
            expect_reply(&mut client, b"+OK\r\n").await;

            send(&mut replica_client, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await;
            let mut reply = Vec::new();
            replica_client.read_buf(&mut reply).await.unwrap();
            if reply == b"$1\r\nv\r\n" {
                break;
            }
            assert_eq!(&reply[..], b"$-1\r\n");
            assert!(
                tokio::time::Instant::now() < deadline,
                "write never reached the replica"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // INFO on the replica reports the slave role
        send(
            &mut replica_client,
            b"*2\r\n$4\r\nINFO\r\n$11\r\nreplication\r\n",
        )
        .await;
        let mut reply = Vec::new();
        replica_client.read_buf(&mut reply).await.unwrap();
        assert!(String::from_utf8_lossy(&reply).contains("role:slave"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_replica_stays_quiet_and_acks_getack() {
        let shutdown = CancellationToken::new();

        // scripted leader socket: accept the replica's handshake by hand
        let leader_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let leader_addr = leader_listener.local_addr().unwrap().to_string();

        let leader_task = tokio::spawn(async move {
            let (mut socket, _) = leader_listener.accept().await.unwrap();
            let mut buf = BytesMut::new();

            // PING, REPLCONF listening-port, REPLCONF capa
            for reply in [&b"+PONG\r\n"[..], &b"+OK\r\n"[..], &b"+OK\r\n"[..]] {
                let mut scratch = [0u8; 256];
                let n = socket.read(&mut scratch).await.unwrap();
                assert!(n > 0);
                socket.write_all(reply).await.unwrap();
            }
            // PSYNC
            let mut scratch = [0u8; 256];
            let n = socket.read(&mut scratch).await.unwrap();
            assert!(n > 0);
            let repl_id = "e".repeat(40);
            let blob = b"NOT-A-REAL-SNAPSHOT";
            let preamble = format!("+FULLRESYNC {} 0\r\n${}\r\n", repl_id, blob.len());
            socket.write_all(preamble.as_bytes()).await.unwrap();
            socket.write_all(blob).await.unwrap();

            // propagate a write, then ask for an ack
            let set_wire = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";
            socket.write_all(set_wire).await.unwrap();
            let getack_wire = b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n";
            socket.write_all(getack_wire).await.unwrap();

            // the only traffic back must be REPLCONF ACK <set_wire len>
            let expected = format!(
                "*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n${}\r\n{}\r\n",
                set_wire.len().to_string().len(),
                set_wire.len()
            );
            while buf.len() < expected.len() {
                let n = socket.read_buf(&mut buf).await.unwrap();
                assert!(n > 0, "replica hung up");
            }
            assert_eq!(&buf[..], expected.as_bytes());
        });

        let _replica_addr = start_replica(&leader_addr, shutdown.clone()).await;
        leader_task.await.unwrap();
        shutdown.cancel();
    }
}
