//! # Wire Protocol
//!
//! Commands travel as a sequence of length-prefixed string segments:
//!
//! ```text
//! $<byte-length>\n<argument>\n
//! ```
//!
//! one segment per argument, verb first, concatenated with no overall frame
//! length and no terminator beyond the last segment's own `\n`. For example
//! `SET mykey myvalue` is encoded as:
//!
//! ```text
//! $3\nSET\n$5\nmykey\n$7\nmyvalue\n
//! ```
//!
//! Outbound frames prefix the encoded command with the 16 raw bytes of the
//! request identifier. Inbound frames carry the same identifier followed by
//! the raw payload; how the payload is delimited depends on the [`Framing`].
//!
//! Reply payloads are passed back to callers untouched. An empty payload means
//! "no value".

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Width of the request identifier carried in front of every frame.
pub const REQUEST_ID_LEN: usize = 16;

/// Width of the payload length field used by [`Framing::LengthPrefixed`].
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Encode arguments into the segment format, in order.
///
/// The length is the byte length of the UTF-8 encoding, not the char count.
pub fn encode_args<I, S>(args: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for arg in args {
        let arg = arg.as_ref();
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.push(b'\n');
        out.extend_from_slice(arg.as_bytes());
        out.push(b'\n');
    }
    out
}

/// Parse one segment from the front of `input`.
///
/// Returns `Ok(None)` when `input` holds only part of a segment, and the
/// decoded argument together with the number of bytes consumed otherwise.
pub fn parse_segment(input: &[u8]) -> Result<Option<(String, usize)>> {
    if input.is_empty() {
        return Ok(None);
    }
    if input[0] != b'$' {
        return Err(Error::invalid_parameter(format!(
            "segment must start with '$', found byte 0x{:02x}",
            input[0]
        )));
    }

    let Some(newline) = input.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };

    let len_field = std::str::from_utf8(&input[1..newline])
        .map_err(|_| Error::invalid_parameter("segment length is not valid UTF-8"))?;
    let len: usize = len_field
        .parse()
        .map_err(|_| Error::invalid_parameter(format!("invalid segment length '{}'", len_field)))?;

    let start = newline + 1;
    let end = start
        .checked_add(len)
        .ok_or_else(|| Error::invalid_parameter(format!("segment length {} is out of range", len)))?;
    if input.len() <= end {
        return Ok(None);
    }
    if input[end] != b'\n' {
        return Err(Error::invalid_parameter("segment is not terminated by '\\n'"));
    }

    let value = String::from_utf8(input[start..end].to_vec())
        .map_err(|_| Error::invalid_parameter("segment is not valid UTF-8"))?;
    Ok(Some((value, end + 1)))
}

/// Parse every segment in a complete buffer.
///
/// Unlike [`parse_segment`], a truncated trailing segment is an error here.
pub fn parse_args(input: &[u8]) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut offset = 0;
    while offset < input.len() {
        match parse_segment(&input[offset..])? {
            Some((arg, consumed)) => {
                args.push(arg);
                offset += consumed;
            }
            None => return Err(Error::invalid_parameter("truncated segment")),
        }
    }
    Ok(args)
}

/// How inbound frames are delimited on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One transport read is one frame: 16 id bytes, then whatever else that
    /// read returned. Compatible with existing servers, but a stream may
    /// merge or split deliveries, so replies that arrive back to back can be
    /// misattributed.
    #[default]
    Delivery,

    /// `<16 id bytes><u32 big-endian payload length><payload>`.
    LengthPrefixed,
}

impl Framing {
    /// Build an inbound frame in this framing.
    pub fn encode_reply(&self, id: &[u8; REQUEST_ID_LEN], payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(REQUEST_ID_LEN + LENGTH_PREFIX_LEN + payload.len());
        frame.extend_from_slice(id);
        if *self == Framing::LengthPrefixed {
            frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        }
        frame.extend_from_slice(payload);
        frame
    }
}

/// Modifier clauses accepted after the value of a SET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOption {
    /// Expire after the given number of seconds
    Ex(u64),
    /// Expire after the given number of milliseconds
    Px(u64),
    /// Only set if the key does not exist
    Nx,
    /// Only set if the key already exists
    Xx,
    /// Retain the existing time to live
    KeepTtl,
    /// Return the previous value
    Get,
    /// Raw clause passed through as-is
    Other(Vec<String>),
}

impl SetOption {
    fn push_args(&self, out: &mut Vec<String>) {
        match self {
            SetOption::Ex(secs) => {
                out.push("EX".to_string());
                out.push(secs.to_string());
            }
            SetOption::Px(millis) => {
                out.push("PX".to_string());
                out.push(millis.to_string());
            }
            SetOption::Nx => out.push("NX".to_string()),
            SetOption::Xx => out.push("XX".to_string()),
            SetOption::KeepTtl => out.push("KEEPTTL".to_string()),
            SetOption::Get => out.push("GET".to_string()),
            SetOption::Other(clause) => out.extend(clause.iter().cloned()),
        }
    }
}

/// A command the client knows how to issue.
///
/// Flat argument lists (`MultiSet::args`, `HashSet::fields`) alternate
/// key/value or field/value and must have an even length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Retrieve a value by its key
    Get { key: String },

    /// Store a value, with optional modifier clauses
    Set {
        key: String,
        value: String,
        options: Vec<SetOption>,
    },

    /// Delete one or more keys
    Del { keys: Vec<String> },

    /// Count how many of the keys exist
    Exists { keys: Vec<String> },

    /// Append to the string stored at key
    Append { key: String, value: String },

    /// Set several keys at once: `k1 v1 k2 v2 ...`
    MultiSet { args: Vec<String> },

    /// Set fields of a hash: `f1 v1 f2 v2 ...`
    HashSet { key: String, fields: Vec<String> },

    /// Read one field of a hash
    HashGet { key: String, field: String },

    /// Read the listed fields of a hash
    HashGetAll { key: String, fields: Vec<String> },

    /// Remove fields from a hash
    HashDel { key: String, fields: Vec<String> },
}

impl Command {
    /// The verb sent as the first segment.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Del { .. } => "DEL",
            Command::Exists { .. } => "EXISTS",
            Command::Append { .. } => "APPEND",
            Command::MultiSet { .. } => "MSET",
            Command::HashSet { .. } => "HSET",
            Command::HashGet { .. } => "HGET",
            Command::HashGetAll { .. } => "HGETALL",
            Command::HashDel { .. } => "HDEL",
        }
    }

    /// All segments of the command, verb first.
    pub fn args(&self) -> Vec<String> {
        let mut out = vec![self.verb().to_string()];
        match self {
            Command::Get { key } => out.push(key.clone()),
            Command::Set {
                key,
                value,
                options,
            } => {
                out.push(key.clone());
                out.push(value.clone());
                for option in options {
                    option.push_args(&mut out);
                }
            }
            Command::Del { keys } | Command::Exists { keys } => out.extend(keys.iter().cloned()),
            Command::Append { key, value } => {
                out.push(key.clone());
                out.push(value.clone());
            }
            Command::MultiSet { args } => out.extend(args.iter().cloned()),
            Command::HashGet { key, field } => {
                out.push(key.clone());
                out.push(field.clone());
            }
            Command::HashSet { key, fields }
            | Command::HashGetAll { key, fields }
            | Command::HashDel { key, fields } => {
                out.push(key.clone());
                out.extend(fields.iter().cloned());
            }
        }
        out
    }

    /// Reject malformed argument lists before anything reaches the wire.
    pub fn validate(&self) -> Result<()> {
        match self {
            Command::Del { keys } | Command::Exists { keys } => {
                if keys.is_empty() {
                    return Err(Error::invalid_parameter(format!(
                        "{} requires at least one key",
                        self.verb()
                    )));
                }
            }
            Command::MultiSet { args } => {
                if args.is_empty() {
                    return Err(Error::invalid_parameter("MSET requires at least one key/value pair"));
                }
                if args.len() % 2 == 1 {
                    return Err(Error::invalid_parameter("missing values in input for MSET command"));
                }
            }
            Command::HashSet { key, fields } => {
                if key.is_empty() || fields.is_empty() {
                    return Err(Error::invalid_parameter("missing key or fields for HSET command"));
                }
                if fields.len() % 2 == 1 {
                    return Err(Error::invalid_parameter("missing values in input for HSET command"));
                }
            }
            Command::HashGet { key, field } => {
                if key.is_empty() || field.is_empty() {
                    return Err(Error::invalid_parameter("missing key or field for HGET command"));
                }
            }
            Command::HashGetAll { key, fields } | Command::HashDel { key, fields } => {
                if key.is_empty() || fields.is_empty() {
                    return Err(Error::invalid_parameter(format!(
                        "missing key or fields for {} command",
                        self.verb()
                    )));
                }
            }
            Command::Get { .. } | Command::Set { .. } | Command::Append { .. } => {}
        }
        Ok(())
    }

    /// Encoded segments, ready to be prefixed with a request id.
    pub fn encode(&self) -> Vec<u8> {
        encode_args(self.args())
    }

    /// Rebuild a command from decoded segments.
    ///
    /// Verbs are matched case-insensitively. Arity is checked, the deeper
    /// rules of [`Command::validate`] are not.
    pub fn from_args(args: Vec<String>) -> Result<Command> {
        let mut parts = args.into_iter();
        let verb = parts
            .next()
            .ok_or_else(|| Error::invalid_parameter("empty command"))?
            .to_uppercase();
        let rest: Vec<String> = parts.collect();

        let need = |n: usize| require_args(&verb, rest.len(), n);

        let command = match verb.as_str() {
            "GET" => {
                need(1)?;
                Command::Get { key: rest[0].clone() }
            }
            "SET" => {
                need(2)?;
                let mut rest = rest.clone().into_iter();
                let key = rest.next().unwrap_or_default();
                let value = rest.next().unwrap_or_default();
                let clause: Vec<String> = rest.collect();
                let options = if clause.is_empty() {
                    Vec::new()
                } else {
                    vec![SetOption::Other(clause)]
                };
                Command::Set {
                    key,
                    value,
                    options,
                }
            }
            "DEL" => Command::Del { keys: rest.clone() },
            "EXISTS" => Command::Exists { keys: rest.clone() },
            "APPEND" => {
                need(2)?;
                Command::Append {
                    key: rest[0].clone(),
                    value: rest[1].clone(),
                }
            }
            "MSET" => Command::MultiSet { args: rest.clone() },
            "HGET" => {
                need(2)?;
                Command::HashGet {
                    key: rest[0].clone(),
                    field: rest[1].clone(),
                }
            }
            "HSET" | "HGETALL" | "HDEL" => {
                need(1)?;
                let key = rest[0].clone();
                let fields = rest[1..].to_vec();
                match verb.as_str() {
                    "HSET" => Command::HashSet { key, fields },
                    "HGETALL" => Command::HashGetAll { key, fields },
                    _ => Command::HashDel { key, fields },
                }
            }
            other => {
                return Err(Error::invalid_parameter(format!("unknown command '{}'", other)));
            }
        };
        Ok(command)
    }
}

fn require_args(verb: &str, have: usize, need: usize) -> Result<()> {
    if have < need {
        Err(Error::invalid_parameter(format!(
            "{} command requires {} argument(s)",
            verb, need
        )))
    } else {
        Ok(())
    }
}
