//! Text protocol for room broadcasts.
//!
//! Every inbound text frame is classified fresh, with no per-connection state:
//! ```text
//! {"type":"msg","body":"hi"} ──► Inbound::Broadcast ──► {"from":"<session>","body":"hi"}   (others)
//! anything else              ──► Inbound::Plain     ──► "[Broadcast] <text>"               (others)
//!                                                   └─► "You sent: <text>"                 (sender)
//! ```
//!
//! Malformed input is never an error: it simply falls through to the
//! plain-text shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::room::SessionId;

/// `type` value that marks a structured broadcast request.
pub const BROADCAST_TYPE: &str = "msg";

/// Prefix of a plain-text message relayed to the other members.
pub const BROADCAST_PREFIX: &str = "[Broadcast] ";

/// Prefix of the acknowledgement returned to a plain-text sender.
pub const ACK_PREFIX: &str = "You sent: ";

/// Outbound request shape, used by clients and tests.
#[derive(Debug, Serialize)]
struct Request<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    body: &'a Value,
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound<'a> {
    /// `{"type":"msg","body":...}`: relay `body` tagged with the sender.
    Broadcast { body: Value },
    /// Anything else: relay the raw text and acknowledge the sender.
    Plain(&'a str),
}

impl<'a> Inbound<'a> {
    /// Parse then classify a raw text frame.
    ///
    /// A missing or `null` body becomes the empty string. Non-string bodies
    /// are kept as-is and forwarded verbatim.
    ///
    /// Anything `serde_json` refuses is plain text. That includes escapes
    /// naming a lone UTF-16 surrogate (`"\ud800"`), which cannot be held in
    /// a Rust `String`, so such a request is relayed verbatim as text.
    pub fn classify(raw: &'a str) -> Self {
        // Only a JSON object can carry a `type`; arrays and scalars are text.
        let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(raw) else {
            return Inbound::Plain(raw);
        };
        match fields.get("type") {
            Some(Value::String(kind)) if kind == BROADCAST_TYPE => {
                let body = match fields.remove("body") {
                    None | Some(Value::Null) => Value::String(String::new()),
                    Some(body) => body,
                };
                Inbound::Broadcast { body }
            }
            _ => Inbound::Plain(raw),
        }
    }

    /// Whether this is the structured shape.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Inbound::Broadcast { .. })
    }
}

/// Structured delivery sent to every member except the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub from: SessionId,
    pub body: Value,
}

impl Delivery {
    pub fn new(from: SessionId, body: impl Into<Value>) -> Self {
        Self {
            from,
            body: body.into(),
        }
    }

    /// Serialize to the JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Build a structured broadcast request frame.
pub fn encode_request(body: impl Into<Value>) -> Result<String, ProtocolError> {
    let body = body.into();
    Ok(serde_json::to_string(&Request {
        kind: BROADCAST_TYPE,
        body: &body,
    })?)
}

/// Plain-text relay sent to the other members.
pub fn broadcast_text(raw: &str) -> String {
    format!("{BROADCAST_PREFIX}{raw}")
}

/// Plain-text acknowledgement sent back to the sender.
pub fn ack_text(raw: &str) -> String {
    format!("{ACK_PREFIX}{raw}")
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
