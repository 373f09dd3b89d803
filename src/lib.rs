//! replidb - a lightweight in-memory key-value server with single-leader
//! replication
//!
//! The crate is organized around clear, minimal interfaces:
//! - `protocol` owns the wire format, `command` the typed command set
//! - `store` holds the TTL-aware data and its background sweep
//! - `executor` applies commands; `replication` carries the role state
//! - `server` ties listener, connections and roles together

pub mod command;
pub mod config;
pub mod executor;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod store;

/// Re-export commonly used types
pub use command::{Command, CommandError, ReplConf};
pub use executor::{ExecOutcome, Executor};
pub use protocol::{RespError, RespValue};
pub use store::MemoryStore;
