//! Error taxonomy for the bridge client and mock broker.
//!
//! Decode failures and protocol misuse are recovered locally (logged, frame
//! dropped) and only surface through [`CodecError`] when a caller encodes or
//! decodes directly. Request outcomes use [`RequestError`]; everything the
//! public handles can refuse is a [`BusError`].

// Rust guideline compliant 2026-02

use std::fmt;

use crate::message::ErrorContent;

/// Why a client reached its terminal `Closed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `EventBus::close` was called.
    Requested,
    /// The configured number of consecutive failed opens was reached.
    AttemptsExhausted {
        /// Consecutive failed opens at the time of giving up.
        attempts: u32,
    },
    /// The transport dropped and `autoReconnect` is off.
    ReconnectDisabled,
    /// The client handle was dropped, or its connection task is gone.
    Shutdown,
}

impl CloseReason {
    /// Whether the close was the consumer's own doing rather than a failure.
    pub fn is_requested(self) -> bool {
        matches!(self, Self::Requested | Self::Shutdown)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("closed by request"),
            Self::AttemptsExhausted { attempts } => {
                write!(f, "gave up after {attempts} failed connection attempts")
            }
            Self::ReconnectDisabled => f.write_str("connection lost and reconnect is disabled"),
            Self::Shutdown => f.write_str("event bus shut down"),
        }
    }
}

/// Failure to encode or decode a wire frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Not JSON, or JSON that does not fit the tagged frame shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// JSON object without a string `type` field.
    #[error("frame has no type tag")]
    MissingType,
    /// A `type` tag this protocol does not define.
    #[error("unknown frame type '{0}'")]
    UnknownType(String),
    /// An addressable frame with an empty address.
    #[error("'{0}' frame requires a non-empty address")]
    EmptyAddress(&'static str),
}

/// Failure outcome of a `send` request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    /// The broker answered with an `err` frame.
    #[error("request failed: {0}")]
    Failed(ErrorContent),
    /// The connection closed for good before a reply arrived.
    #[error("request cancelled: {0}")]
    Cancelled(CloseReason),
}

/// Errors returned by the public client and broker handles.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The client already reached `Closed`.
    #[error("event bus is closed")]
    Closed,
    /// Connection options failed validation.
    #[error("invalid connection options: {0}")]
    InvalidOptions(String),
    /// A frame could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The mock broker refused the operation.
    #[error("mock broker: {0}")]
    Broker(String),
    /// Socket-level failure while binding or accepting.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_display() {
        assert_eq!(
            CloseReason::AttemptsExhausted { attempts: 3 }.to_string(),
            "gave up after 3 failed connection attempts"
        );
        assert_eq!(CloseReason::Requested.to_string(), "closed by request");
    }

    #[test]
    fn test_requested_vs_failure() {
        assert!(CloseReason::Requested.is_requested());
        assert!(CloseReason::Shutdown.is_requested());
        assert!(!CloseReason::ReconnectDisabled.is_requested());
        assert!(!CloseReason::AttemptsExhausted { attempts: 1 }.is_requested());
    }

    #[test]
    fn test_request_error_carries_reason() {
        let err = RequestError::Cancelled(CloseReason::Requested);
        assert_eq!(err.to_string(), "request cancelled: closed by request");
    }
}
