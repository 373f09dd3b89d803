//! RESP2 parser and encoder
//!
//! The parser is incremental: each successful call consumes exactly one
//! complete frame from the buffer, leaving it positioned just past the
//! frame's trailing CRLF. Bulk string bodies are consumed by their length
//! prefix, never by scanning for CRLF, so payloads containing CRLF survive
//! intact.

use super::types::{RespError, RespValue};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";

/// Incremental RESP frame parser.
pub struct RespParser;

impl RespParser {
    /// Parse one frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` when a complete frame was consumed,
    /// `Ok(None)` when the buffer ends mid-frame (await more bytes and
    /// retry), and `Err` on a protocol violation. Nothing is consumed
    /// unless a whole frame was decoded.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
        match Self::decode(&buf[..])? {
            Some((frame, consumed)) => {
                buf.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Decode one frame from `input`, returning it with the number of
    /// bytes it occupies on the wire.
    fn decode(input: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
        let Some(&tag) = input.first() else {
            return Ok(None);
        };
        match tag {
            b'+' => Self::decode_simple_string(input),
            b'-' => Self::decode_error(input),
            b':' => Self::decode_integer(input),
            b'$' => Self::decode_bulk_string(input),
            b'*' => Self::decode_array(input),
            other => Err(RespError::InvalidProtocol(format!(
                "unknown type tag 0x{:02x}",
                other
            ))),
        }
    }

    /// Parse simple string: +OK\r\n
    fn decode_simple_string(input: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
        let Some((line, consumed)) = Self::take_line(input) else {
            return Ok(None);
        };
        let text = std::str::from_utf8(line).map_err(|_| RespError::InvalidUtf8)?;
        Ok(Some((RespValue::SimpleString(text.to_owned()), consumed)))
    }

    /// Parse error: -Error message\r\n
    fn decode_error(input: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
        let Some((line, consumed)) = Self::take_line(input) else {
            return Ok(None);
        };
        let text = std::str::from_utf8(line).map_err(|_| RespError::InvalidUtf8)?;
        Ok(Some((RespValue::Error(text.to_owned()), consumed)))
    }

    /// Parse integer: :1000\r\n
    fn decode_integer(input: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
        let Some((line, consumed)) = Self::take_line(input) else {
            return Ok(None);
        };
        Ok(Some((RespValue::Integer(Self::parse_i64(line)?), consumed)))
    }

    /// Parse bulk string: $6\r\nfoobar\r\n or $-1\r\n (null)
    fn decode_bulk_string(input: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
        let Some((header, header_len)) = Self::take_line(input) else {
            return Ok(None);
        };
        let declared = Self::parse_i64(header)?;
        if declared == -1 {
            return Ok(Some((RespValue::Null, header_len)));
        }
        if declared < 0 {
            return Err(RespError::InvalidProtocol(format!(
                "invalid bulk string length {}",
                declared
            )));
        }

        // The length prefix governs consumption; the body may contain CRLF.
        let body_len = declared as usize;
        let total = header_len + body_len + CRLF.len();
        if input.len() < total {
            return Ok(None);
        }
        let body = &input[header_len..header_len + body_len];
        if &input[header_len + body_len..total] != CRLF {
            return Err(RespError::InvalidProtocol(
                "bulk string body is not CRLF-terminated".to_owned(),
            ));
        }
        Ok(Some((
            RespValue::BulkString(Bytes::copy_from_slice(body)),
            total,
        )))
    }

    /// Parse array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    fn decode_array(input: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
        let Some((header, header_len)) = Self::take_line(input) else {
            return Ok(None);
        };
        let declared = Self::parse_i64(header)?;
        if declared == -1 {
            return Ok(Some((RespValue::Null, header_len)));
        }
        if declared < 0 {
            return Err(RespError::InvalidProtocol(format!(
                "invalid array length {}",
                declared
            )));
        }

        let mut consumed = header_len;
        let mut items = Vec::with_capacity(declared as usize);
        for _ in 0..declared {
            match Self::decode(&input[consumed..])? {
                Some((item, item_len)) => {
                    items.push(item);
                    consumed += item_len;
                }
                // An element is still in flight; consume nothing.
                None => return Ok(None),
            }
        }
        Ok(Some((RespValue::Array(items), consumed)))
    }

    /// Locate the CRLF that ends the line opened by the type tag at
    /// `input[0]`. Returns the line body (tag and CRLF stripped) and the
    /// full on-wire length of the line.
    fn take_line(input: &[u8]) -> Option<(&[u8], usize)> {
        let body = input.get(1..)?;
        let end = body.windows(CRLF.len()).position(|window| window == CRLF)?;
        Some((&body[..end], 1 + end + CRLF.len()))
    }

    fn parse_i64(line: &[u8]) -> Result<i64, RespError> {
        let text = std::str::from_utf8(line).map_err(|_| RespError::InvalidUtf8)?;
        text.parse::<i64>()
            .map_err(|_| RespError::InvalidInteger(text.to_owned()))
    }
}

/// RESP2 encoder
pub struct RespEncoder;

impl RespEncoder {
    /// Encode a frame to bytes
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_to(&mut buf, value);
        buf.freeze()
    }

    /// Encode a frame into an existing buffer
    pub fn encode_to(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Error(e) => {
                buf.put_u8(b'-');
                buf.put_slice(e.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Integer(i) => {
                buf.put_u8(b':');
                buf.put_slice(i.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(bytes) => {
                buf.put_u8(b'$');
                buf.put_slice(bytes.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(bytes);
                buf.put_slice(CRLF);
            }
            RespValue::Null => {
                buf.put_slice(b"$-1\r\n");
            }
            RespValue::Array(items) => {
                buf.put_u8(b'*');
                buf.put_slice(items.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for item in items {
                    Self::encode_to(buf, item);
                }
            }
        }
    }
}
