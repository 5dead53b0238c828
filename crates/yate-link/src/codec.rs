//! Wire codec for the external-module protocol.
//!
//! Every command is one line. Fields are separated by `:`; field content is
//! escaped so that `:` and control characters never appear raw. `%` doubles
//! to `%%`, any other escaped byte is `%` followed by the byte plus 64.

use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;
use tokio_util::codec::{Decoder, Encoder};

use crate::{Error, Message, MessageReply};

/// Lines longer than this are a protocol violation, not a framing hiccup.
const MAX_LINE_LENGTH: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect {
        role: String,
    },
    Message(Message),
    MessageReply(MessageReply),
    Install {
        priority: Option<u32>,
        name: String,
    },
    InstallReply {
        priority: u32,
        name: String,
        success: bool,
    },
    SetLocal {
        name: String,
        value: String,
    },
    SetLocalReply {
        name: String,
        value: String,
        success: bool,
    },
}

pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '%' {
            out.push_str("%%");
        } else if ch == ':' || (ch as u32) < 32 {
            out.push('%');
            out.push((ch as u8 + 64) as char);
        } else {
            out.push(ch);
        }
    }
    out
}

pub fn unescape(encoded: &str) -> Result<String, Error> {
    let mut out = String::with_capacity(encoded.len());
    let mut chars = encoded.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(esc) if (64..128).contains(&(esc as u32)) => out.push((esc as u8 - 64) as char),
            other => {
                return Err(Error::Protocol(format!(
                    "invalid escape sequence %{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

fn encode_params(params: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in params {
        out.push(':');
        out.push_str(&escape(key));
        out.push('=');
        out.push_str(&escape(value));
    }
    out
}

fn parse_params(tokens: &[&str]) -> Result<BTreeMap<String, String>, Error> {
    let mut params = BTreeMap::new();
    for token in tokens {
        let (key, value) = match token.split_once('=') {
            Some((key, value)) => (unescape(key)?, unescape(value)?),
            None => (unescape(token)?, String::new()),
        };
        params.insert(key, value);
    }
    Ok(params)
}

fn parse_bool(token: &str) -> bool {
    token == "true"
}

impl Command {
    pub fn encode_line(&self) -> String {
        match self {
            Command::Connect { role } => format!("%%>connect:{}", escape(role)),
            Command::Message(msg) => format!(
                "%%>message:{}:{}:{}:{}{}",
                escape(&msg.id),
                msg.time,
                escape(&msg.name),
                escape(&msg.return_value),
                encode_params(&msg.params),
            ),
            Command::MessageReply(reply) => format!(
                "%%<message:{}:{}:{}:{}{}",
                escape(&reply.id),
                if reply.processed { "true" } else { "false" },
                escape(&reply.name),
                escape(&reply.return_value),
                encode_params(&reply.params),
            ),
            Command::Install { priority, name } => {
                let priority = priority.map(|p| p.to_string()).unwrap_or_default();
                format!("%%>install:{}:{}", priority, escape(name))
            }
            Command::InstallReply {
                priority,
                name,
                success,
            } => format!(
                "%%<install:{}:{}:{}",
                priority,
                escape(name),
                if *success { "true" } else { "false" }
            ),
            Command::SetLocal { name, value } => {
                format!("%%>setlocal:{}:{}", escape(name), escape(value))
            }
            Command::SetLocalReply {
                name,
                value,
                success,
            } => format!(
                "%%<setlocal:{}:{}:{}",
                escape(name),
                escape(value),
                if *success { "true" } else { "false" }
            ),
        }
    }

    /// Parses one line. Returns `None` for verbs this client has no use for
    /// (`%%>watch` confirmations and the like), which callers skip.
    pub fn parse_line(line: &str) -> Result<Option<Command>, Error> {
        let tokens: Vec<&str> = line.split(':').collect();
        let missing = || Error::Protocol(format!("truncated command line {line:?}"));

        let command = match tokens[0] {
            "%%>connect" => Command::Connect {
                role: unescape(tokens.get(1).ok_or_else(missing)?)?,
            },
            "%%>message" => {
                if tokens.len() < 5 {
                    return Err(missing());
                }
                Command::Message(Message {
                    id: unescape(tokens[1])?,
                    time: tokens[2].parse().unwrap_or(0),
                    name: unescape(tokens[3])?,
                    return_value: unescape(tokens[4])?,
                    params: parse_params(&tokens[5..])?,
                })
            }
            "%%<message" => {
                if tokens.len() < 5 {
                    return Err(missing());
                }
                Command::MessageReply(MessageReply {
                    id: unescape(tokens[1])?,
                    processed: parse_bool(tokens[2]),
                    name: unescape(tokens[3])?,
                    return_value: unescape(tokens[4])?,
                    params: parse_params(&tokens[5..])?,
                })
            }
            "%%>install" => {
                if tokens.len() < 3 {
                    return Err(missing());
                }
                Command::Install {
                    priority: tokens[1].parse().ok(),
                    name: unescape(tokens[2])?,
                }
            }
            "%%<install" => {
                if tokens.len() < 4 {
                    return Err(missing());
                }
                Command::InstallReply {
                    priority: tokens[1].parse().unwrap_or(0),
                    name: unescape(tokens[2])?,
                    success: parse_bool(tokens[3]),
                }
            }
            "%%>setlocal" => {
                if tokens.len() < 3 {
                    return Err(missing());
                }
                Command::SetLocal {
                    name: unescape(tokens[1])?,
                    value: unescape(tokens[2])?,
                }
            }
            "%%<setlocal" => {
                if tokens.len() < 4 {
                    return Err(missing());
                }
                Command::SetLocalReply {
                    name: unescape(tokens[1])?,
                    value: unescape(tokens[2])?,
                    success: parse_bool(tokens[3]),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(command))
    }
}

/// Newline-delimited [`Command`] framing for use with `tokio_util`.
#[derive(Debug, Default)]
pub struct ExtCodec;

impl Decoder for ExtCodec {
    type Item = Command;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(Error::Protocol("command line exceeds maximum length".into()));
                }
                return Ok(None);
            };
            let line = src.split_to(pos + 1);
            let line = std::str::from_utf8(&line[..pos])
                .map_err(|_| Error::Protocol("command line is not valid utf-8".into()))?
                .trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            match Command::parse_line(line)? {
                Some(command) => return Ok(Some(command)),
                None => {
                    tracing::debug!(line, "skipping unsupported command from switch");
                    continue;
                }
            }
        }
    }
}

impl Encoder<Command> for ExtCodec {
    type Error = Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Error> {
        let line = item.encode_line();
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
