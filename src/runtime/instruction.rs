//! Tagged control messages routed through the single dispatch channel.

use crate::irc::message::Prefix;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Multi-producer handle onto the dispatch channel.
pub type InstructionSender = mpsc::UnboundedSender<Instruction>;
pub type InstructionReceiver = mpsc::UnboundedReceiver<Instruction>;

/// Identifies one socket connection so late lifecycle reports from a
/// superseded connection can be told apart from current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Connect,
    Receiving(ConnectionId),
    Sending(ConnectionId),
    Connected,
    DiscoReceiving(ConnectionId),
    DiscoSending(ConnectionId),
    Remote(Vec<u8>),
    Command {
        prefix: Prefix,
        sender: String,
        cmd: String,
        arg: String,
    },
    Join(String),
    Part(String),
    Link {
        channel: String,
        url: String,
    },
    Schedule {
        unixtime: i64,
        command: String,
        args: Vec<Value>,
    },
    Periodic {
        name: String,
        period: u64,
        command: String,
        args: Vec<Value>,
    },
    Scheduled {
        cmd: String,
        arg: String,
        sender: String,
    },
    Ping,
    Reconnect {
        force: bool,
    },
    Quit,
    Reload {
        destination: Option<String>,
    },
    Address(String),
    Msg {
        destination: String,
        text: String,
    },
    Send(Vec<String>),
    Message(String),
    Prefix(String),
    Instances,
    Identified(String),
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("instruction `{0}` can only be raised inside the runtime")]
    Reserved(String),
    #[error("instruction `{name}` expects {expected}")]
    BadArguments { name: String, expected: &'static str },
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid argument payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl Instruction {
    /// Wire name, as used on the control channel and in schedule entries.
    pub fn name(&self) -> &str {
        match self {
            Self::Connect => "connect",
            Self::Receiving(_) => "receiving",
            Self::Sending(_) => "sending",
            Self::Connected => "connected",
            Self::DiscoReceiving(_) => "disco_receiving",
            Self::DiscoSending(_) => "disco_sending",
            Self::Remote(_) => "remote",
            Self::Command { .. } => "command",
            Self::Join(_) => "join",
            Self::Part(_) => "part",
            Self::Link { .. } => "link",
            Self::Schedule { .. } => "schedule",
            Self::Periodic { .. } => "periodic",
            Self::Scheduled { .. } => "scheduled",
            Self::Ping => "ping",
            Self::Reconnect { .. } => "reconnect",
            Self::Quit => "quit",
            Self::Reload { .. } => "reload",
            Self::Address(_) => "address",
            Self::Msg { .. } => "msg",
            Self::Send(_) => "send",
            Self::Message(_) => "message",
            Self::Prefix(_) => "prefix",
            Self::Instances => "instances",
            Self::Identified(_) => "identified",
            Self::Unknown(name) => name,
        }
    }

    /// Build an instruction from its wire name and JSON argument tuple.
    ///
    /// Unknown names decode to [`Instruction::Unknown`] so the dispatch loop
    /// can log and drop them; malformed arguments are an error.
    pub fn decode(name: &str, args: &[Value]) -> Result<Self, DecodeError> {
        let mut args = Args { name, args, next: 0 };
        let instruction = match name {
            "connect" => Self::Connect,
            "receiving" | "sending" | "connected" | "disco_receiving" | "disco_sending" => {
                return Err(DecodeError::Reserved(name.to_string()))
            }
            "remote" => Self::Remote(args.string("a raw line")?.into_bytes()),
            "command" => {
                let prefix = args.string("(address, sender, cmd, arg)")?;
                let parsed = crate::irc::message::Message::parse(format!(":{prefix} X").as_bytes());
                Self::Command {
                    prefix: parsed.prefix,
                    sender: args.string("(address, sender, cmd, arg)")?,
                    cmd: args.string("(address, sender, cmd, arg)")?,
                    arg: args.optional_string().unwrap_or_default(),
                }
            }
            "join" => Self::Join(args.string("a channel")?),
            "part" => Self::Part(args.string("a channel")?),
            "link" => Self::Link {
                channel: args.string("(channel, url)")?,
                url: args.string("(channel, url)")?,
            },
            "schedule" => Self::Schedule {
                unixtime: args.integer("(unixtime, command, args)")?,
                command: args.string("(unixtime, command, args)")?,
                args: args.list(),
            },
            "periodic" => Self::Periodic {
                name: args.string("(name, period, command, args)")?,
                period: u64::try_from(args.integer("(name, period, command, args)")?)
                    .map_err(|_| args.bad("a non-negative period"))?,
                command: args.string("(name, period, command, args)")?,
                args: args.list(),
            },
            "scheduled" => Self::Scheduled {
                cmd: args.string("(cmd, arg, sender)")?,
                arg: args.string("(cmd, arg, sender)")?,
                sender: args.string("(cmd, arg, sender)")?,
            },
            "ping" => Self::Ping,
            "reconnect" => Self::Reconnect {
                force: args.optional_bool().unwrap_or(true),
            },
            "quit" => Self::Quit,
            "reload" => Self::Reload {
                destination: args.optional_string(),
            },
            "address" => Self::Address(args.string("an address")?),
            "msg" => Self::Msg {
                destination: args.string("(destination, text)")?,
                text: args.string("(destination, text)")?,
            },
            "send" => {
                let mut parts = Vec::new();
                while let Some(part) = args.optional_string() {
                    parts.push(part);
                }
                if parts.is_empty() {
                    return Err(args.bad("at least one protocol argument"));
                }
                Self::Send(parts)
            }
            "message" => Self::Message(args.string("a text")?),
            "prefix" => Self::Prefix(args.string("a prefix")?),
            "instances" => Self::Instances,
            "identified" => Self::Identified(args.string("a nick")?),
            other => Self::Unknown(other.to_string()),
        };
        Ok(instruction)
    }

    /// Decode one control-channel line: `instruction[ base64(json array)]`.
    pub fn from_wire_line(line: &str) -> Result<Self, DecodeError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (name, payload) = line.split_once(' ').unwrap_or((line, ""));
        let payload = payload.trim();
        if payload.is_empty() {
            return Self::decode(name, &[]);
        }
        let raw = STANDARD.decode(payload)?;
        let args: Vec<Value> = serde_json::from_slice(&raw)?;
        Self::decode(name, &args)
    }
}

/// Encode a control-channel line for `name` with a JSON argument tuple.
pub fn encode_wire_line(name: &str, args: &[Value]) -> String {
    if args.is_empty() {
        return name.to_string();
    }
    let payload = serde_json::to_vec(args).unwrap_or_else(|_| b"[]".to_vec());
    format!("{name} {}", STANDARD.encode(payload))
}

struct Args<'a> {
    name: &'a str,
    args: &'a [Value],
    next: usize,
}

impl<'a> Args<'a> {
    fn bad(&self, expected: &'static str) -> DecodeError {
        DecodeError::BadArguments {
            name: self.name.to_string(),
            expected,
        }
    }

    fn take(&mut self) -> Option<&'a Value> {
        let value = self.args.get(self.next);
        self.next += 1;
        value
    }

    fn string(&mut self, expected: &'static str) -> Result<String, DecodeError> {
        self.optional_string().ok_or_else(|| self.bad(expected))
    }

    fn optional_string(&mut self) -> Option<String> {
        match self.take()? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn integer(&mut self, expected: &'static str) -> Result<i64, DecodeError> {
        match self.take() {
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| self.bad(expected)),
            Some(Value::String(s)) => s.trim().parse().map_err(|_| self.bad(expected)),
            _ => Err(self.bad(expected)),
        }
    }

    fn optional_bool(&mut self) -> Option<bool> {
        self.take().and_then(Value::as_bool)
    }

    fn list(&mut self) -> Vec<Value> {
        match self.take() {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_bare_names() {
        assert_eq!(Instruction::from_wire_line("quit").unwrap(), Instruction::Quit);
        assert_eq!(Instruction::from_wire_line("ping\n").unwrap(), Instruction::Ping);
        assert_eq!(
            Instruction::from_wire_line("reload").unwrap(),
            Instruction::Reload { destination: None }
        );
    }

    #[test]
    fn decodes_base64_argument_tuple() {
        let line = encode_wire_line("join", &[json!("#rust")]);
        assert!(line.starts_with("join "));
        assert_eq!(
            Instruction::from_wire_line(&line).unwrap(),
            Instruction::Join("#rust".into())
        );
    }

    #[test]
    fn decodes_schedule_with_nested_args() {
        let line = encode_wire_line(
            "schedule",
            &[json!(1_700_000_000), json!("msg"), json!(["#c", "tea time"])],
        );
        assert_eq!(
            Instruction::from_wire_line(&line).unwrap(),
            Instruction::Schedule {
                unixtime: 1_700_000_000,
                command: "msg".into(),
                args: vec![json!("#c"), json!("tea time")],
            }
        );
    }

    #[test]
    fn unknown_names_survive_decoding() {
        let decoded = Instruction::from_wire_line("frobnicate").unwrap();
        assert_eq!(decoded, Instruction::Unknown("frobnicate".into()));
        assert_eq!(decoded.name(), "frobnicate");
    }

    #[test]
    fn lifecycle_names_are_reserved() {
        assert!(matches!(
            Instruction::from_wire_line("disco_receiving"),
            Err(DecodeError::Reserved(_))
        ));
    }

    #[test]
    fn missing_arguments_are_rejected() {
        assert!(matches!(
            Instruction::decode("msg", &[json!("#c")]),
            Err(DecodeError::BadArguments { .. })
        ));
        assert!(matches!(
            Instruction::from_wire_line("join !!!not-base64"),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn command_parses_address() {
        let decoded = Instruction::decode(
            "command",
            &[json!("nick!user@host"), json!("#c"), json!("echo"), json!("hi")],
        )
        .unwrap();
        match decoded {
            Instruction::Command { prefix, sender, cmd, arg } => {
                assert_eq!(prefix.address().as_deref(), Some("nick!user@host"));
                assert_eq!(sender, "#c");
                assert_eq!(cmd, "echo");
                assert_eq!(arg, "hi");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
