//! Typed command model
//!
//! Turns decoded RESP arrays into the closed set of recognized commands
//! and encodes commands back into the all-bulk-string array form used for
//! propagation and replica-to-leader traffic. Command names and option
//! tokens are matched case-insensitively on ASCII.

use crate::protocol::RespValue;
use bytes::Bytes;
use std::fmt;

/// A recognized client or replication command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Echo(Bytes),
    /// INFO <section>; `replication` is the only section today.
    Info(String),
    Get(Bytes),
    Set {
        key: Bytes,
        value: Bytes,
        ttl_ms: Option<u64>,
    },
    ReplConf(ReplConf),
    /// PSYNC <replid> <offset>; the initial replica request is `?` / `-1`.
    Psync {
        repl_id: String,
        offset: String,
    },
    Wait {
        num_replicas: u64,
        timeout_ms: u64,
    },
}

/// The recognized REPLCONF token forms.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplConf {
    ListeningPort(u16),
    Capa(Vec<String>),
    GetAck,
    Ack(u64),
}

/// Rejection reasons for inputs that framed correctly but do not name a
/// valid command invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    UnknownCommand(String),
    BadArguments(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::UnknownCommand(name) => write!(f, "unknown command '{}'", name),
            CommandError::BadArguments(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CommandError {}

impl Command {
    /// Parse a decoded array frame into a command.
    pub fn parse(frame: &RespValue) -> Result<Command, CommandError> {
        let items = match frame.as_array() {
            Some(items) if !items.is_empty() => items,
            _ => {
                return Err(CommandError::BadArguments(
                    "expected a non-empty command array".to_owned(),
                ))
            }
        };
        let name = bulk_text(&items[0])?;
        let args = &items[1..];

        if name.eq_ignore_ascii_case("PING") {
            expect_arity(name, args, 0)?;
            Ok(Command::Ping)
        } else if name.eq_ignore_ascii_case("ECHO") {
            expect_arity(name, args, 1)?;
            Ok(Command::Echo(bulk_bytes(&args[0])?))
        } else if name.eq_ignore_ascii_case("INFO") {
            expect_arity(name, args, 1)?;
            let section = bulk_text(&args[0])?.to_ascii_lowercase();
            if section != "replication" {
                return Err(CommandError::BadArguments(format!(
                    "unsupported INFO section '{}'",
                    section
                )));
            }
            Ok(Command::Info(section))
        } else if name.eq_ignore_ascii_case("GET") {
            expect_arity(name, args, 1)?;
            Ok(Command::Get(bulk_bytes(&args[0])?))
        } else if name.eq_ignore_ascii_case("SET") {
            Self::parse_set(args)
        } else if name.eq_ignore_ascii_case("REPLCONF") {
            Self::parse_replconf(args)
        } else if name.eq_ignore_ascii_case("PSYNC") {
            expect_arity(name, args, 2)?;
            Ok(Command::Psync {
                repl_id: bulk_text(&args[0])?.to_owned(),
                offset: bulk_text(&args[1])?.to_owned(),
            })
        } else if name.eq_ignore_ascii_case("WAIT") {
            expect_arity(name, args, 2)?;
            Ok(Command::Wait {
                num_replicas: integer_arg(&args[0], "WAIT num_replicas")?,
                timeout_ms: integer_arg(&args[1], "WAIT timeout_ms")?,
            })
        } else {
            Err(CommandError::UnknownCommand(name.to_owned()))
        }
    }

    /// SET key value [PX milliseconds]
    fn parse_set(args: &[RespValue]) -> Result<Command, CommandError> {
        if args.len() != 2 && args.len() != 4 {
            return Err(CommandError::BadArguments(
                "wrong number of arguments for 'SET' command".to_owned(),
            ));
        }
        let key = bulk_bytes(&args[0])?;
        let value = bulk_bytes(&args[1])?;
        let ttl_ms = if args.len() == 4 {
            let option = bulk_text(&args[2])?;
            if !option.eq_ignore_ascii_case("PX") {
                return Err(CommandError::BadArguments(format!(
                    "unsupported SET option '{}'",
                    option
                )));
            }
            Some(integer_arg(&args[3], "SET PX milliseconds")?)
        } else {
            None
        };
        Ok(Command::Set { key, value, ttl_ms })
    }

    /// REPLCONF is a variadic key/value token list; only the handful of
    /// forms used by the replication handshake and ack flow are accepted.
    fn parse_replconf(args: &[RespValue]) -> Result<Command, CommandError> {
        let tokens: Vec<&str> = args
            .iter()
            .map(bulk_text)
            .collect::<Result<_, CommandError>>()?;
        let Some(first) = tokens.first() else {
            return Err(CommandError::BadArguments(
                "REPLCONF expects at least one token".to_owned(),
            ));
        };

        let conf = if first.eq_ignore_ascii_case("listening-port") {
            expect_token_count(&tokens, 2)?;
            let port = tokens[1].parse::<u16>().map_err(|_| {
                CommandError::BadArguments(format!(
                    "invalid REPLCONF listening-port '{}'",
                    tokens[1]
                ))
            })?;
            ReplConf::ListeningPort(port)
        } else if first.eq_ignore_ascii_case("capa") {
            // capa <word> may repeat: capa eof capa psync2
            if tokens.len() % 2 != 0 {
                return Err(CommandError::BadArguments(
                    "REPLCONF capa expects key/value pairs".to_owned(),
                ));
            }
            let mut capabilities = Vec::with_capacity(tokens.len() / 2);
            for pair in tokens.chunks(2) {
                if !pair[0].eq_ignore_ascii_case("capa") {
                    return Err(CommandError::BadArguments(format!(
                        "unexpected REPLCONF token '{}'",
                        pair[0]
                    )));
                }
                capabilities.push(pair[1].to_owned());
            }
            ReplConf::Capa(capabilities)
        } else if first.eq_ignore_ascii_case("GETACK") {
            expect_token_count(&tokens, 2)?;
            if tokens[1] != "*" {
                return Err(CommandError::BadArguments(format!(
                    "REPLCONF GETACK expects '*', got '{}'",
                    tokens[1]
                )));
            }
            ReplConf::GetAck
        } else if first.eq_ignore_ascii_case("ACK") {
            expect_token_count(&tokens, 2)?;
            let offset = tokens[1].parse::<u64>().map_err(|_| {
                CommandError::BadArguments(format!("invalid REPLCONF ACK offset '{}'", tokens[1]))
            })?;
            ReplConf::Ack(offset)
        } else {
            return Err(CommandError::BadArguments(format!(
                "unrecognized REPLCONF token '{}'",
                first
            )));
        };
        Ok(Command::ReplConf(conf))
    }

    /// Encode the command as the array-of-bulk-strings frame used on the
    /// wire. Bulk strings keep binary payloads intact, which is why the
    /// replication link never uses the simple-string form.
    pub fn encode(&self) -> RespValue {
        let parts: Vec<Bytes> = match self {
            Command::Ping => vec![Bytes::from_static(b"PING")],
            Command::Echo(payload) => vec![Bytes::from_static(b"ECHO"), payload.clone()],
            Command::Info(section) => {
                vec![Bytes::from_static(b"INFO"), Bytes::from(section.clone())]
            }
            Command::Get(key) => vec![Bytes::from_static(b"GET"), key.clone()],
            Command::Set { key, value, ttl_ms } => {
                let mut parts = vec![Bytes::from_static(b"SET"), key.clone(), value.clone()];
                if let Some(ms) = ttl_ms {
                    parts.push(Bytes::from_static(b"PX"));
                    parts.push(Bytes::from(ms.to_string()));
                }
                parts
            }
            Command::ReplConf(conf) => {
                let mut parts = vec![Bytes::from_static(b"REPLCONF")];
                match conf {
                    ReplConf::ListeningPort(port) => {
                        parts.push(Bytes::from_static(b"listening-port"));
                        parts.push(Bytes::from(port.to_string()));
                    }
                    ReplConf::Capa(capabilities) => {
                        for capability in capabilities {
                            parts.push(Bytes::from_static(b"capa"));
                            parts.push(Bytes::from(capability.clone()));
                        }
                    }
                    ReplConf::GetAck => {
                        parts.push(Bytes::from_static(b"GETACK"));
                        parts.push(Bytes::from_static(b"*"));
                    }
                    ReplConf::Ack(offset) => {
                        parts.push(Bytes::from_static(b"ACK"));
                        parts.push(Bytes::from(offset.to_string()));
                    }
                }
                parts
            }
            Command::Psync { repl_id, offset } => vec![
                Bytes::from_static(b"PSYNC"),
                Bytes::from(repl_id.clone()),
                Bytes::from(offset.clone()),
            ],
            Command::Wait {
                num_replicas,
                timeout_ms,
            } => vec![
                Bytes::from_static(b"WAIT"),
                Bytes::from(num_replicas.to_string()),
                Bytes::from(timeout_ms.to_string()),
            ],
        };
        RespValue::Array(parts.into_iter().map(RespValue::BulkString).collect())
    }
}

fn bulk_text(value: &RespValue) -> Result<&str, CommandError> {
    let bytes = value.as_bulk_string().ok_or_else(|| {
        CommandError::BadArguments("expected a bulk string argument".to_owned())
    })?;
    std::str::from_utf8(bytes)
        .map_err(|_| CommandError::BadArguments("argument is not valid UTF-8".to_owned()))
}

fn bulk_bytes(value: &RespValue) -> Result<Bytes, CommandError> {
    value.as_bulk_string().cloned().ok_or_else(|| {
        CommandError::BadArguments("expected a bulk string argument".to_owned())
    })
}

fn integer_arg(value: &RespValue, what: &str) -> Result<u64, CommandError> {
    bulk_text(value)?.parse::<u64>().map_err(|_| {
        CommandError::BadArguments(format!("{} must be a non-negative integer", what))
    })
}

fn expect_arity(name: &str, args: &[RespValue], expected: usize) -> Result<(), CommandError> {
    if args.len() != expected {
        return Err(CommandError::BadArguments(format!(
            "wrong number of arguments for '{}' command",
            name.to_ascii_uppercase()
        )));
    }
    Ok(())
}

fn expect_token_count(tokens: &[&str], expected: usize) -> Result<(), CommandError> {
    if tokens.len() != expected {
        return Err(CommandError::BadArguments(format!(
            "wrong number of tokens for REPLCONF {}",
            tokens[0]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_frame(parts: &[&str]) -> RespValue {
        RespValue::Array(
            parts
                .iter()
                .map(|part| RespValue::bulk_string(part.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_parse_ping() {
        let cmd = Command::parse(&command_frame(&["PING"])).unwrap();
        assert_eq!(cmd, Command::Ping);

        // names are case-insensitive
        let cmd = Command::parse(&command_frame(&["ping"])).unwrap();
        assert_eq!(cmd, Command::Ping);
    }

    #[test]
    fn test_parse_echo() {
        let cmd = Command::parse(&command_frame(&["Echo", "hey"])).unwrap();
        assert_eq!(cmd, Command::Echo(Bytes::from("hey")));

        assert!(Command::parse(&command_frame(&["ECHO"])).is_err());
        assert!(Command::parse(&command_frame(&["ECHO", "a", "b"])).is_err());
    }

    #[test]
    fn test_parse_info() {
        let cmd = Command::parse(&command_frame(&["INFO", "Replication"])).unwrap();
        assert_eq!(cmd, Command::Info("replication".to_owned()));

        assert!(Command::parse(&command_frame(&["INFO", "keyspace"])).is_err());
    }

    #[test]
    fn test_parse_get() {
        let cmd = Command::parse(&command_frame(&["GET", "k"])).unwrap();
        assert_eq!(cmd, Command::Get(Bytes::from("k")));
    }

    #[test]
    fn test_parse_set() {
        let cmd = Command::parse(&command_frame(&["SET", "k", "v"])).unwrap();
        assert_eq!(
            cmd,
            Command::Set {
                key: Bytes::from("k"),
                value: Bytes::from("v"),
                ttl_ms: None,
            }
        );
    }

    #[test]
    fn test_parse_set_with_px() {
        let cmd = Command::parse(&command_frame(&["set", "k", "v", "px", "100"])).unwrap();
        assert_eq!(
            cmd,
            Command::Set {
                key: Bytes::from("k"),
                value: Bytes::from("v"),
                ttl_ms: Some(100),
            }
        );

        assert!(Command::parse(&command_frame(&["SET", "k", "v", "EX", "100"])).is_err());
        assert!(Command::parse(&command_frame(&["SET", "k", "v", "PX", "-5"])).is_err());
        assert!(Command::parse(&command_frame(&["SET", "k", "v", "PX"])).is_err());
    }

    #[test]
    fn test_parse_replconf_forms() {
        let cmd = Command::parse(&command_frame(&["REPLCONF", "listening-port", "6380"])).unwrap();
        assert_eq!(cmd, Command::ReplConf(ReplConf::ListeningPort(6380)));

        let cmd =
            Command::parse(&command_frame(&["REPLCONF", "capa", "eof", "capa", "psync2"])).unwrap();
        assert_eq!(
            cmd,
            Command::ReplConf(ReplConf::Capa(vec!["eof".to_owned(), "psync2".to_owned()]))
        );

        let cmd = Command::parse(&command_frame(&["REPLCONF", "GETACK", "*"])).unwrap();
        assert_eq!(cmd, Command::ReplConf(ReplConf::GetAck));

        let cmd = Command::parse(&command_frame(&["REPLCONF", "ACK", "154"])).unwrap();
        assert_eq!(cmd, Command::ReplConf(ReplConf::Ack(154)));

        assert!(Command::parse(&command_frame(&["REPLCONF", "GETACK", "x"])).is_err());
        assert!(Command::parse(&command_frame(&["REPLCONF", "ACK", "nope"])).is_err());
        assert!(Command::parse(&command_frame(&["REPLCONF", "bogus", "1"])).is_err());
    }

    #[test]
    fn test_parse_psync() {
        let cmd = Command::parse(&command_frame(&["PSYNC", "?", "-1"])).unwrap();
        assert_eq!(
            cmd,
            Command::Psync {
                repl_id: "?".to_owned(),
                offset: "-1".to_owned(),
            }
        );
    }

    #[test]
    fn test_parse_wait() {
        let cmd = Command::parse(&command_frame(&["WAIT", "2", "500"])).unwrap();
        assert_eq!(
            cmd,
            Command::Wait {
                num_replicas: 2,
                timeout_ms: 500,
            }
        );

        assert!(Command::parse(&command_frame(&["WAIT", "-1", "500"])).is_err());
    }

    #[test]
    fn test_parse_unknown_command() {
        let err = Command::parse(&command_frame(&["FLUSHALL"])).unwrap_err();
        assert_eq!(err, CommandError::UnknownCommand("FLUSHALL".to_owned()));
    }

    #[test]
    fn test_parse_rejects_non_array() {
        assert!(Command::parse(&RespValue::simple_string("PING")).is_err());
        assert!(Command::parse(&RespValue::Array(vec![])).is_err());
    }

    #[test]
    fn test_encode_round_trip() {
        let commands = vec![
            Command::Ping,
            Command::Echo(Bytes::from("hey")),
            Command::Info("replication".to_owned()),
            Command::Get(Bytes::from("k")),
            Command::Set {
                key: Bytes::from("k"),
                value: Bytes::from("v"),
                ttl_ms: None,
            },
            Command::Set {
                key: Bytes::from("k"),
                value: Bytes::from_static(b"bin\r\nary"),
                ttl_ms: Some(250),
            },
            Command::ReplConf(ReplConf::ListeningPort(6380)),
            Command::ReplConf(ReplConf::Capa(vec!["psync2".to_owned()])),
            Command::ReplConf(ReplConf::GetAck),
            Command::ReplConf(ReplConf::Ack(42)),
            Command::Psync {
                repl_id: "?".to_owned(),
                offset: "-1".to_owned(),
            },
            Command::Wait {
                num_replicas: 1,
                timeout_ms: 100,
            },
        ];
        for command in commands {
            let reparsed = Command::parse(&command.encode()).unwrap();
            assert_eq!(reparsed, command);
        }
    }

    #[test]
    fn test_encode_uses_bulk_strings_only() {
        let frame = Command::Set {
            key: Bytes::from("k"),
            value: Bytes::from("v"),
            ttl_ms: Some(9),
        }
        .encode();
        let items = frame.as_array().unwrap();
        assert_eq!(items.len(), 5);
        assert!(items
            .iter()
            .all(|item| matches!(item, RespValue::BulkString(_))));
    }
}
