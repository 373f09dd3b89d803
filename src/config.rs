//! CLI surface
//!
//! Two knobs: the listener port and an optional leader to replicate from.
//! `--replicaof` takes the conventional `"<host> <port>"` form and is
//! normalized into a dialable `host:port` address at startup.

use anyhow::{bail, Result};
use clap::Parser;

/// Command-line options.
#[derive(Debug, Parser)]
#[command(
    name = "replidb",
    about = "In-memory key-value server with single-leader replication",
    version
)]
pub struct Options {
    /// Port the server listens on
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// Run as a replica of the given leader, formatted as "<host> <port>"
    #[arg(long, value_name = "HOST PORT")]
    pub replicaof: Option<String>,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,

    /// `host:port` of the leader when running as a replica
    pub replicaof: Option<String>,
}

impl ServerConfig {
    pub fn from_options(options: Options) -> Result<Self> {
        let replicaof = options
            .replicaof
            .as_deref()
            .map(parse_leader_addr)
            .transpose()?;
        Ok(ServerConfig {
            port: options.port,
            replicaof,
        })
    }
}

/// Turn the CLI's `"host port"` into a dialable `host:port`.
fn parse_leader_addr(raw: &str) -> Result<String> {
    let mut parts = raw.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(host), Some(port), None) => {
            if port.parse::<u16>().is_err() {
                bail!("invalid leader port {:?} in --replicaof", port);
            }
            Ok(format!("{}:{}", host, port))
        }
        _ => bail!("--replicaof expects \"<host> <port>\", got {:?}", raw),
    }
}
