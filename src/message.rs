//! Wire message protocol.
//!
//! Every frame exchanged with the bridge is one newline-free UTF-8 JSON
//! object carrying a mandatory `type` tag:
//!
//! ```text
//! {"type":"ping"}
//! {"type":"register","address":"some-address","headers":{}}
//! {"type":"send","address":"echo","body":"hi","headers":{},"replyAddress":"R1"}
//! {"type":"rec","address":"R1","body":"hi","headers":{}}
//! {"type":"err","address":"R1","headers":{},"failureCode":500,"failureType":"RECIPIENT_FAILURE","message":"boom"}
//! ```
//!
//! [`Message`] maps each tag onto its own variant. [`decode`] fails closed:
//! an unknown tag is an error the caller logs and discards, never a panic.
//! [`encode`] omits absent optional fields instead of writing `null`, so
//! frames stay byte-stable for golden comparisons.

// Rust guideline compliant 2026-02

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CodecError;

/// Frame headers, a string-keyed JSON object.
pub type Headers = Map<String, Value>;

/// Every `type` tag the protocol defines.
const KNOWN_TYPES: [&str; 7] = [
    "ping",
    "register",
    "unregister",
    "publish",
    "send",
    "rec",
    "err",
];

/// One frame of the bridge protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Keepalive, client to broker.
    Ping,
    /// Subscribe the connection to an address.
    Register {
        /// Channel address.
        address: String,
        /// Frame headers.
        #[serde(default)]
        headers: Headers,
    },
    /// Drop the connection's subscription to an address.
    Unregister {
        /// Channel address.
        address: String,
        /// Frame headers.
        #[serde(default)]
        headers: Headers,
    },
    /// Fire-and-forget delivery to every subscriber of an address.
    Publish {
        /// Channel address.
        address: String,
        /// JSON payload.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        body: Value,
        /// Frame headers.
        #[serde(default)]
        headers: Headers,
    },
    /// Point-to-point delivery, optionally expecting a reply.
    #[serde(rename_all = "camelCase")]
    Send {
        /// Channel address.
        address: String,
        /// JSON payload.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        body: Value,
        /// Frame headers.
        #[serde(default)]
        headers: Headers,
        /// Where the receiver should send its reply.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_address: Option<String>,
    },
    /// Content delivered broker to client.
    #[serde(rename = "rec")]
    Receive {
        /// Channel or reply address.
        address: String,
        /// JSON payload.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        body: Value,
        /// Frame headers.
        #[serde(default)]
        headers: Headers,
    },
    /// Failure delivered broker to client.
    #[serde(rename = "err", rename_all = "camelCase")]
    Error {
        /// Channel or reply address. Bridge-level failures carry none.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
        /// Frame headers.
        #[serde(default)]
        headers: Headers,
        /// Numeric failure code.
        #[serde(default)]
        failure_code: i64,
        /// Failure category, e.g. `RECIPIENT_FAILURE`.
        #[serde(default)]
        failure_type: String,
        /// Human-readable failure message.
        #[serde(default)]
        message: String,
    },
}

/// Payload of an `err` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContent {
    /// Numeric failure code.
    pub failure_code: i64,
    /// Failure category.
    pub failure_type: String,
    /// Human-readable message.
    pub message: String,
}

impl ErrorContent {
    /// Build an error payload.
    pub fn new(
        failure_code: i64,
        failure_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            failure_code,
            failure_type: failure_type.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} - {}", self.failure_code, self.failure_type, self.message)
    }
}

impl Message {
    /// `{"type":"ping"}`.
    pub fn ping() -> Self {
        Self::Ping
    }

    /// A `register` frame with empty headers.
    pub fn register(address: impl Into<String>) -> Self {
        Self::Register {
            address: address.into(),
            headers: Headers::new(),
        }
    }

    /// An `unregister` frame with empty headers.
    pub fn unregister(address: impl Into<String>) -> Self {
        Self::Unregister {
            address: address.into(),
            headers: Headers::new(),
        }
    }

    /// A `publish` frame with empty headers.
    pub fn publish(address: impl Into<String>, body: Value) -> Self {
        Self::Publish {
            address: address.into(),
            body,
            headers: Headers::new(),
        }
    }

    /// A `send` frame with empty headers.
    pub fn send(address: impl Into<String>, body: Value, reply_address: Option<String>) -> Self {
        Self::Send {
            address: address.into(),
            body,
            headers: Headers::new(),
            reply_address,
        }
    }

    /// A `rec` frame with empty headers.
    pub fn rec(address: impl Into<String>, body: Value) -> Self {
        Self::Receive {
            address: address.into(),
            body,
            headers: Headers::new(),
        }
    }

    /// An addressed `err` frame with empty headers.
    pub fn error(address: impl Into<String>, content: ErrorContent) -> Self {
        Self::Error {
            address: Some(address.into()),
            headers: Headers::new(),
            failure_code: content.failure_code,
            failure_type: content.failure_type,
            message: content.message,
        }
    }

    /// Replace the frame's headers. `ping` has none and is returned as is.
    pub fn with_headers(mut self, new_headers: Headers) -> Self {
        match &mut self {
            Self::Ping => {}
            Self::Register { headers, .. }
            | Self::Unregister { headers, .. }
            | Self::Publish { headers, .. }
            | Self::Send { headers, .. }
            | Self::Receive { headers, .. }
            | Self::Error { headers, .. } => *headers = new_headers,
        }
        self
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Register { .. } => "register",
            Self::Unregister { .. } => "unregister",
            Self::Publish { .. } => "publish",
            Self::Send { .. } => "send",
            Self::Receive { .. } => "rec",
            Self::Error { .. } => "err",
        }
    }

    /// The frame's address, if it has one.
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::Ping => None,
            Self::Register { address, .. }
            | Self::Unregister { address, .. }
            | Self::Publish { address, .. }
            | Self::Send { address, .. }
            | Self::Receive { address, .. } => Some(address),
            Self::Error { address, .. } => address.as_deref(),
        }
    }

    /// The content body of `publish`, `send` and `rec` frames.
    pub fn body(&self) -> Option<&Value> {
        match self {
            Self::Publish { body, .. } | Self::Send { body, .. } | Self::Receive { body, .. } => {
                Some(body)
            }
            _ => None,
        }
    }

    /// The frame's headers (`None` for `ping`).
    pub fn headers(&self) -> Option<&Headers> {
        match self {
            Self::Ping => None,
            Self::Register { headers, .. }
            | Self::Unregister { headers, .. }
            | Self::Publish { headers, .. }
            | Self::Send { headers, .. }
            | Self::Receive { headers, .. }
            | Self::Error { headers, .. } => Some(headers),
        }
    }

    /// The failure payload of an `err` frame.
    pub fn error_content(&self) -> Option<ErrorContent> {
        match self {
            Self::Error {
                failure_code,
                failure_type,
                message,
                ..
            } => Some(ErrorContent::new(*failure_code, failure_type.clone(), message.clone())),
            _ => None,
        }
    }
}

/// Compact one-line rendering used in traffic logs.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping => f.write_str("[ping]"),
            Self::Register { address, .. } | Self::Unregister { address, .. } => {
                write!(f, "[{}] {}", self.kind(), address)
            }
            Self::Publish { address, body, .. } | Self::Receive { address, body, .. } => {
                write!(f, "[{}] {} # {}", self.kind(), address, body)
            }
            Self::Send {
                address,
                body,
                reply_address,
                ..
            } => {
                write!(f, "[send] {} # {}", address, body)?;
                if let Some(reply) = reply_address {
                    write!(f, " (reply to {reply})")?;
                }
                Ok(())
            }
            Self::Error {
                address,
                failure_code,
                failure_type,
                message,
                ..
            } => write!(
                f,
                "[err] {} {} {} - {}",
                address.as_deref().unwrap_or("-"),
                failure_code,
                failure_type,
                message
            ),
        }
    }
}

/// Encode a frame as a single-line JSON string.
///
/// # Errors
///
/// [`CodecError::EmptyAddress`] for an addressable frame with an empty
/// address.
pub fn encode(message: &Message) -> Result<String, CodecError> {
    if message.address().is_some_and(str::is_empty) {
        return Err(CodecError::EmptyAddress(message.kind()));
    }
    Ok(serde_json::to_string(message)?)
}

/// Decode a received frame.
///
/// Only JSON well-formedness and the tag are checked; an empty address is
/// accepted as received.
///
/// # Errors
///
/// [`CodecError::Malformed`] for bad JSON or a shape that does not match
/// its tag, [`CodecError::MissingType`] and [`CodecError::UnknownType`] for
/// a missing or unrecognised tag.
pub fn decode(text: &str) -> Result<Message, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?;
    if !KNOWN_TYPES.contains(&kind) {
        return Err(CodecError::UnknownType(kind.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

/// Truncate a raw frame for inclusion in a log line.
pub(crate) fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(120)
        .map_or(text.len(), |(idx, _)| idx);
    &text[..end]
}
