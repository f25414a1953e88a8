//! Request decoding, dispatch against the store, and reply encoding.
//!
//! A request buffer is decoded according to the server's [`WireFormat`]:
//!
//! - [`WireFormat::Line`]: `SET <key> <value>`, `GET <key>`, `DEL <key>`,
//!   terminated by `\n` or `\r\n`. The value of `SET` is the rest of the line.
//! - [`WireFormat::Json`]: one object per buffer, e.g.
//!   `{"operation":"SET","key":"k","value":"v"}`.
//!
//! Validation runs in a fixed order (parse, operation, key, value) and the
//! first failure decides the rejection. Every request, accepted or rejected,
//! records exactly one `info` or `error` event of its own before its reply
//! is produced.

use serde_json::{Map, Value as JsonValue};
use tracing::{error, info};

use crate::{Store, value::Value};

/// Largest request buffer the server accepts, in bytes.
pub const MAX_REQUEST_LEN: usize = 1024;
/// Largest key, in bytes.
pub const MAX_KEY_LEN: usize = 256;
/// Largest value, in bytes as rendered on the wire.
pub const MAX_VALUE_LEN: usize = 1024;

/// Request encoding accepted by a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum WireFormat {
    /// Whitespace-separated `VERB key [value]` lines.
    Line,
    /// One JSON object per read.
    #[default]
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Set,
    Get,
    Del,
}

impl Verb {
    /// Matches the exact, case-sensitive verb name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "SET" => Some(Verb::Set),
            "GET" => Some(Verb::Get),
            "DEL" => Some(Verb::Del),
            _ => None,
        }
    }
}

/// A validated request, ready to run against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Set { key: Vec<u8>, value: Value },
    Get { key: Vec<u8> },
    Del { key: Vec<u8> },
}

/// Why a request buffer was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("failed to parse request: {0}")]
    Parse(String),
    #[error("request exceeds {} bytes", MAX_REQUEST_LEN)]
    TooLarge,
    #[error("unknown operation {}", .0.as_deref().unwrap_or("<missing>"))]
    UnknownOperation(Option<String>),
    #[error("key is missing or empty")]
    MissingKey,
    #[error("key exceeds {} bytes", MAX_KEY_LEN)]
    KeyTooLong,
    #[error("SET requires a value")]
    MissingValue,
    #[error("value exceeds {} bytes", MAX_VALUE_LEN)]
    ValueTooLong,
    #[error("unexpected argument after key")]
    TrailingArgument,
}

impl RequestError {
    pub fn rejection(&self) -> Rejection {
        match self {
            RequestError::Parse(_) | RequestError::TooLarge => Rejection::Parse,
            RequestError::UnknownOperation(_) => Rejection::UnknownOperation,
            RequestError::MissingKey
            | RequestError::KeyTooLong
            | RequestError::MissingValue
            | RequestError::ValueTooLong
            | RequestError::TrailingArgument => Rejection::Malformed,
        }
    }
}

/// Wire-visible class of a rejected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Parse,
    UnknownOperation,
    Malformed,
}

/// Outcome of one request, before encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Rendered value found by `GET`.
    Value(String),
    Ok,
    NotFound,
    Deleted,
    Error,
    Rejected(Rejection),
}

impl Reply {
    pub fn encode(&self, format: WireFormat) -> Vec<u8> {
        match (self, format) {
            (Reply::Value(value), _) => {
                let mut encoded = Vec::with_capacity(value.len() + 1);
                encoded.extend_from_slice(value.as_bytes());
                encoded.push(b'\n');
                encoded
            }
            (Reply::Ok, _) => b"OK\n".to_vec(),
            (Reply::NotFound, _) => b"Not Found\n".to_vec(),
            (Reply::Deleted, _) => b"Deleted\n".to_vec(),
            (Reply::Error, _) | (Reply::Rejected(_), WireFormat::Line) => b"ERROR\n".to_vec(),
            (Reply::Rejected(Rejection::Parse), WireFormat::Json) => {
                b"ERROR: Invalid JSON".to_vec()
            }
            (Reply::Rejected(Rejection::UnknownOperation), WireFormat::Json) => {
                b"ERROR: Unknown operation".to_vec()
            }
            (Reply::Rejected(Rejection::Malformed), WireFormat::Json) => {
                b"ERROR: Key or operation missing".to_vec()
            }
        }
    }
}

/// Decodes and validates one request buffer.
pub fn decode(format: WireFormat, buf: &[u8]) -> Result<Request, RequestError> {
    if buf.len() > MAX_REQUEST_LEN {
        return Err(RequestError::TooLarge);
    }
    match format {
        WireFormat::Line => decode_line(buf),
        WireFormat::Json => decode_json(buf),
    }
}

fn decode_line(buf: &[u8]) -> Result<Request, RequestError> {
    let line = std::str::from_utf8(buf).map_err(|err| RequestError::Parse(err.to_string()))?;
    let line = line.trim_end_matches(['\r', '\n']);

    let (verb, rest) = next_token(line);
    let verb = parse_verb(verb)?;
    let (key, rest) = next_token(rest);
    let key = validate_key(key)?;

    match verb {
        Verb::Set => {
            let value = rest.trim_start();
            if value.is_empty() {
                return Err(RequestError::MissingValue);
            }
            let value = validate_value(Value::Text(value.to_string()))?;
            Ok(Request::Set { key, value })
        }
        _ if !rest.trim().is_empty() => Err(RequestError::TrailingArgument),
        Verb::Get => Ok(Request::Get { key }),
        Verb::Del => Ok(Request::Del { key }),
    }
}

/// Splits off the first whitespace-delimited token of `input`.
fn next_token(input: &str) -> (Option<&str>, &str) {
    let input = input.trim_start();
    if input.is_empty() {
        return (None, input);
    }
    let end = input.find(char::is_whitespace).unwrap_or(input.len());
    (Some(&input[..end]), &input[end..])
}

fn decode_json(buf: &[u8]) -> Result<Request, RequestError> {
    let mut fields: Map<String, JsonValue> =
        serde_json::from_slice(buf).map_err(|err| RequestError::Parse(err.to_string()))?;

    let verb = parse_verb(fields.get("operation").and_then(JsonValue::as_str))?;
    let key = validate_key(fields.get("key").and_then(JsonValue::as_str))?;

    match verb {
        Verb::Set => {
            let value = fields
                .remove("value")
                .filter(|value| !value.is_null())
                .ok_or(RequestError::MissingValue)?;
            let value = validate_value(Value::Json(value))?;
            Ok(Request::Set { key, value })
        }
        Verb::Get => Ok(Request::Get { key }),
        Verb::Del => Ok(Request::Del { key }),
    }
}

fn parse_verb(name: Option<&str>) -> Result<Verb, RequestError> {
    let name = name.ok_or(RequestError::UnknownOperation(None))?;
    Verb::parse(name).ok_or_else(|| RequestError::UnknownOperation(Some(name.to_string())))
}

fn validate_key(key: Option<&str>) -> Result<Vec<u8>, RequestError> {
    match key {
        None | Some("") => Err(RequestError::MissingKey),
        Some(key) if key.len() > MAX_KEY_LEN => Err(RequestError::KeyTooLong),
        Some(key) => Ok(key.as_bytes().to_vec()),
    }
}

fn validate_value(value: Value) -> Result<Value, RequestError> {
    if value.wire_len() > MAX_VALUE_LEN {
        return Err(RequestError::ValueTooLong);
    }
    Ok(value)
}

/// Runs a validated request against the store.
pub fn execute(store: &mut Store, request: Request) -> Reply {
    match request {
        Request::Get { key } => match store.get(&key) {
            Some(value) => {
                info!(key = %lossy(&key), %value, "GET succeeded");
                Reply::Value(value.to_string())
            }
            None => {
                info!(key = %lossy(&key), "GET found no entry");
                Reply::NotFound
            }
        },
        Request::Set { key, value } => {
            info!(key = %lossy(&key), %value, "SET succeeded");
            store.set(key, value);
            Reply::Ok
        }
        Request::Del { key } => match store.delete(&key) {
            Some(_) => {
                info!(key = %lossy(&key), "DEL succeeded");
                Reply::Deleted
            }
            None => {
                info!(key = %lossy(&key), "DEL found no entry");
                Reply::Error
            }
        },
    }
}

/// Records a rejected request and produces its reply.
pub fn reject(err: &RequestError) -> Reply {
    error!(error = %err, "rejected request");
    Reply::Rejected(err.rejection())
}

/// Decodes, validates and executes one request buffer.
pub fn handle(store: &mut Store, format: WireFormat, buf: &[u8]) -> Reply {
    match decode(format, buf) {
        Ok(request) => execute(store, request),
        Err(err) => reject(&err),
    }
}

fn lossy(key: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(key)
}
