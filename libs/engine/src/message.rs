//! Line-protocol decoding: one JSON object per line, discriminated by `type`.
//!
//! Decoding is purely structural. Whether a RECORD's stream has a schema, or
//! whether its fields conform, is decided later by the engine.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

// ════════════════════════════════════════════════════════════════
//  Messages
// ════════════════════════════════════════════════════════════════

/// One decoded protocol line.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Schema(SchemaMessage),
    Record(RecordMessage),
    State(StateMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaMessage {
    pub stream: String,
    /// JSON Schema of the stream's records (an object).
    pub schema: Value,
    pub key_properties: Vec<String>,
    /// Explicit column order for new columns; defaults to `properties` order.
    pub column_order: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordMessage {
    pub stream: String,
    pub record: Map<String, Value>,
    pub time_extracted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateMessage {
    /// Opaque checkpoint blob, echoed back once the data before it is durable.
    pub value: Value,
}

// ════════════════════════════════════════════════════════════════
//  Errors
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MalformedReason {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("line is not a JSON object")]
    NotAnObject,

    #[error("missing 'type'")]
    MissingType,

    #[error("unrecognized type '{0}'")]
    UnknownType(String),

    #[error("{kind} message missing '{field}'")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("{kind} field '{field}' must be {expected}")]
    WrongShape {
        kind: &'static str,
        field: &'static str,
        expected: &'static str,
    },

    #[error("invalid time_extracted '{0}'")]
    BadTimestamp(String),
}

/// A line that could not be turned into a `Message`.
///
/// Keeps the stream name when the line carried one, so the engine can halt
/// just that stream.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("malformed message{}: {reason}", stream_suffix(.stream))]
pub struct MalformedMessage {
    pub stream: Option<String>,
    pub reason: MalformedReason,
}

fn stream_suffix(stream: &Option<String>) -> String {
    match stream {
        Some(s) => format!(" for stream '{s}'"),
        None => String::new(),
    }
}

impl MalformedMessage {
    fn new(stream: Option<String>, reason: MalformedReason) -> Self {
        Self { stream, reason }
    }
}

// ════════════════════════════════════════════════════════════════
//  Decoder
// ════════════════════════════════════════════════════════════════

/// Loose wire shape. Fields are taken out of the object by hand (not via
/// serde) so an explicit `null` stays distinguishable from an absent key.
struct RawMessage {
    kind: Option<Value>,
    stream: Option<Value>,
    schema: Option<Value>,
    key_properties: Option<Value>,
    column_order: Option<Value>,
    record: Option<Value>,
    time_extracted: Option<Value>,
    value: Option<Value>,
}

impl RawMessage {
    fn from_map(mut map: Map<String, Value>) -> Self {
        Self {
            kind: map.remove("type"),
            stream: map.remove("stream"),
            schema: map.remove("schema"),
            key_properties: map.remove("key_properties"),
            column_order: map.remove("column_order"),
            record: map.remove("record"),
            time_extracted: map.remove("time_extracted"),
            value: map.remove("value"),
        }
    }
}

pub fn decode(line: &str) -> Result<Message, MalformedMessage> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| MalformedMessage::new(None, MalformedReason::Json(e.to_string())))?;
    let raw = match value {
        Value::Object(map) => RawMessage::from_map(map),
        _ => return Err(MalformedMessage::new(None, MalformedReason::NotAnObject)),
    };

    // Stream name is picked up early so every later error can carry it.
    let stream = raw.stream.as_ref().and_then(Value::as_str).map(str::to_string);

    let kind = match &raw.kind {
        Some(Value::String(s)) => s.clone(),
        Some(_) | None => return Err(MalformedMessage::new(stream, MalformedReason::MissingType)),
    };

    match kind.as_str() {
        "SCHEMA" => decode_schema(raw, stream),
        "RECORD" => decode_record(raw, stream),
        "STATE" => decode_state(raw, stream),
        other => Err(MalformedMessage::new(
            stream,
            MalformedReason::UnknownType(other.to_string()),
        )),
    }
}

/// Decode one raw input line (newline already stripped). Bytes that are not
/// UTF-8 are reported like any other unparseable line.
pub fn decode_bytes(raw: &[u8]) -> Result<Message, MalformedMessage> {
    let line = std::str::from_utf8(raw).map_err(|e| {
        MalformedMessage::new(None, MalformedReason::Json(format!("invalid UTF-8: {e}")))
    })?;
    decode(line)
}

fn require_stream(
    raw_stream: &Option<Value>,
    stream: &Option<String>,
    kind: &'static str,
) -> Result<String, MalformedMessage> {
    match (raw_stream, stream) {
        (None, _) | (Some(Value::Null), _) => Err(MalformedMessage::new(
            None,
            MalformedReason::MissingField { kind, field: "stream" },
        )),
        (Some(_), Some(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(MalformedMessage::new(
            None,
            MalformedReason::WrongShape {
                kind,
                field: "stream",
                expected: "a non-empty string",
            },
        )),
    }
}

fn string_list(
    value: Option<Value>,
    kind: &'static str,
    field: &'static str,
    stream: &str,
) -> Result<Option<Vec<String>>, MalformedMessage> {
    let wrong = || {
        MalformedMessage::new(
            Some(stream.to_string()),
            MalformedReason::WrongShape { kind, field, expected: "an array of strings" },
        )
    };
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(wrong()),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(wrong()),
    }
}

fn decode_schema(raw: RawMessage, stream: Option<String>) -> Result<Message, MalformedMessage> {
    const KIND: &str = "SCHEMA";
    let stream = require_stream(&raw.stream, &stream, KIND)?;

    let schema = match raw.schema {
        None | Some(Value::Null) => {
            return Err(MalformedMessage::new(
                Some(stream),
                MalformedReason::MissingField { kind: KIND, field: "schema" },
            ));
        }
        Some(v @ Value::Object(_)) => v,
        Some(_) => {
            return Err(MalformedMessage::new(
                Some(stream),
                MalformedReason::WrongShape { kind: KIND, field: "schema", expected: "an object" },
            ));
        }
    };

    let key_properties = string_list(raw.key_properties, KIND, "key_properties", &stream)?
        .unwrap_or_default();
    let column_order = string_list(raw.column_order, KIND, "column_order", &stream)?;

    Ok(Message::Schema(SchemaMessage {
        stream,
        schema,
        key_properties,
        column_order,
    }))
}

fn decode_record(raw: RawMessage, stream: Option<String>) -> Result<Message, MalformedMessage> {
    const KIND: &str = "RECORD";
    let stream = require_stream(&raw.stream, &stream, KIND)?;

    let record = match raw.record {
        None | Some(Value::Null) => {
            return Err(MalformedMessage::new(
                Some(stream),
                MalformedReason::MissingField { kind: KIND, field: "record" },
            ));
        }
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(MalformedMessage::new(
                Some(stream),
                MalformedReason::WrongShape { kind: KIND, field: "record", expected: "an object" },
            ));
        }
    };

    let time_extracted = match raw.time_extracted {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => match DateTime::parse_from_rfc3339(&s) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(_) => {
                return Err(MalformedMessage::new(Some(stream), MalformedReason::BadTimestamp(s)));
            }
        },
        Some(other) => {
            return Err(MalformedMessage::new(
                Some(stream),
                MalformedReason::BadTimestamp(other.to_string()),
            ));
        }
    };

    Ok(Message::Record(RecordMessage {
        stream,
        record,
        time_extracted,
    }))
}

fn decode_state(raw: RawMessage, stream: Option<String>) -> Result<Message, MalformedMessage> {
    match raw.value {
        Some(value) => Ok(Message::State(StateMessage { value })),
        None => Err(MalformedMessage::new(
            stream,
            MalformedReason::MissingField { kind: "STATE", field: "value" },
        )),
    }
}
