//! Helper wire protocol
//!
//! Newline-delimited JSON in both directions. Outgoing lines are
//! `{ action, data, transactionId? }`; incoming lines are either a
//! transaction response (carries `transactionId`) or an event (carries
//! `event`).

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

/// Keys that belong to the protocol rather than the response payload
const PROTOCOL_KEYS: [&str; 3] = ["transactionId", "error", "identifier"];

/// Incoming lines beyond this size without a newline are discarded
const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

/// Request sent to the helper
#[derive(Debug, Serialize)]
pub struct OutgoingRequest<'a> {
    pub action: &'a str,
    pub data: Option<&'a Value>,
    #[serde(rename = "transactionId", skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<&'a str>,
}

impl OutgoingRequest<'_> {
    /// Serialize as one protocol line, newline included
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Response to a transactional request
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResponse {
    pub transaction_id: String,
    /// Payload on success, helper error message on failure
    pub outcome: std::result::Result<Value, String>,
}

/// Unsolicited event from the helper
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event: String,
    pub guid: Option<String>,
    pub process: Option<String>,
    /// `data` field, `Null` when absent
    pub data: Value,
    /// Remaining top-level fields
    pub extra: Map<String, Value>,
}

/// A decoded incoming line
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Response(TransactionResponse),
    Event(EventEnvelope),
    /// Valid JSON that is neither a response nor an event
    Anomaly(Value),
}

/// Decode one protocol line
pub fn decode_line(line: &str) -> serde_json::Result<IncomingMessage> {
    let value: Value = serde_json::from_str(line)?;
    let Value::Object(mut object) = value else {
        return Ok(IncomingMessage::Anomaly(value));
    };

    if let Some(id) = object.get("transactionId").and_then(Value::as_str) {
        let transaction_id = id.to_string();
        let outcome = response_outcome(&mut object);
        return Ok(IncomingMessage::Response(TransactionResponse {
            transaction_id,
            outcome,
        }));
    }

    if let Some(event) = object.get("event").and_then(Value::as_str) {
        let event = event.to_string();
        object.remove("event");
        let guid = take_string(&mut object, "guid");
        let process = take_string(&mut object, "process");
        let data = object.remove("data").unwrap_or(Value::Null);
        return Ok(IncomingMessage::Event(EventEnvelope {
            event,
            guid,
            process,
            data,
            extra: object,
        }));
    }

    Ok(IncomingMessage::Anomaly(Value::Object(object)))
}

/// Interpret a transaction response body
///
/// An `error` field rejects. Otherwise the nested `data` field wins, and
/// without one the whole object minus protocol keys is the payload.
fn response_outcome(object: &mut Map<String, Value>) -> std::result::Result<Value, String> {
    match object.get("error") {
        None | Some(Value::Null) => {}
        Some(Value::String(message)) => return Err(message.clone()),
        Some(other) => return Err(other.to_string()),
    }

    if let Some(data) = object.remove("data") {
        return Ok(data);
    }

    for key in PROTOCOL_KEYS {
        object.remove(key);
    }
    Ok(Value::Object(std::mem::take(object)))
}

fn take_string(object: &mut Map<String, Value>, key: &str) -> Option<String> {
    match object.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

/// Splits a byte stream into protocol lines
///
/// A trailing partial line is held until its newline arrives. Exact
/// duplicate lines within one batch are collapsed to their first
/// occurrence; the helper is known to deliver some lines twice.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly read bytes, returning the complete lines of this batch
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            if self.pending.len() > MAX_PENDING_BYTES {
                warn!(
                    "Discarding {} buffered bytes without a line terminator",
                    self.pending.len()
                );
                self.pending.clear();
            }
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        let text = String::from_utf8_lossy(&complete);

        let mut seen = HashSet::new();
        text.split('\n')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| seen.insert(*line))
            .map(str::to_string)
            .collect()
    }

    /// Bytes waiting for a newline
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
