//! RESP frame types

use bytes::Bytes;
use std::fmt;

/// One unit of the wire encoding.
///
/// `Null` is only representable on the wire as the length `-1` bulk string
/// (`$-1\r\n`). Bulk strings are binary-safe and may contain CR and LF;
/// simple strings and errors must not.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple strings: +OK\r\n
    SimpleString(String),

    /// Errors: -ERR message\r\n
    Error(String),

    /// Integers: :1000\r\n
    Integer(i64),

    /// Bulk strings: $6\r\nfoobar\r\n
    BulkString(Bytes),

    /// Null bulk string: $-1\r\n
    Null,

    /// Arrays: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Create a simple string
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Create an error
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    /// Create an integer
    pub fn integer(i: i64) -> Self {
        RespValue::Integer(i)
    }

    /// Create a bulk string from bytes
    pub fn bulk_string(b: impl Into<Bytes>) -> Self {
        RespValue::BulkString(b.into())
    }

    /// Create a null value
    pub fn null() -> Self {
        RespValue::Null
    }

    /// Create an array
    pub fn array(v: Vec<RespValue>) -> Self {
        RespValue::Array(v)
    }

    /// Try to extract array elements
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Try to extract bulk string bytes
    pub fn as_bulk_string(&self) -> Option<&Bytes> {
        match self {
            RespValue::BulkString(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "SimpleString({})", s),
            RespValue::Error(e) => write!(f, "Error({})", e),
            RespValue::Integer(i) => write!(f, "Integer({})", i),
            RespValue::BulkString(b) => write!(f, "BulkString({} bytes)", b.len()),
            RespValue::Null => write!(f, "Null"),
            RespValue::Array(items) => write!(f, "Array({} elements)", items.len()),
        }
    }
}

/// Malformed-input errors raised by the parser.
///
/// An *incomplete* frame is not an error: the parser reports it as
/// `Ok(None)` and the caller retries once more bytes arrive. Every variant
/// here is a protocol violation that the connection cannot recover from.
#[derive(Debug, Clone, PartialEq)]
pub enum RespError {
    /// Unknown type tag or structural violation
    InvalidProtocol(String),

    /// Non-UTF-8 payload where text is required
    InvalidUtf8,

    /// Length header or integer frame that does not parse as an i64
    InvalidInteger(String),
}

impl fmt::Display for RespError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespError::InvalidProtocol(msg) => write!(f, "invalid protocol: {}", msg),
            RespError::InvalidUtf8 => write!(f, "invalid UTF-8"),
            RespError::InvalidInteger(raw) => write!(f, "invalid integer: {:?}", raw),
        }
    }
}

impl std::error::Error for RespError {}
