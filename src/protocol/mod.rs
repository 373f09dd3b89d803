//! RESP wire protocol
//!
//! Frame types plus the incremental parser and encoder. Everything above
//! this module works in terms of `RespValue`; raw bytes stop here.

mod resp;
mod types;

pub use resp::{RespEncoder, RespParser};
pub use types::{RespError, RespValue};
