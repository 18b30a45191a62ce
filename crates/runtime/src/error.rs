//! Error types for the tiller runtime.

use thiserror::Error;
use tiller_protocol::ErrorPayload;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the transport, connection, or dispatcher.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure (byte stream communication).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Write attempted after the byte stream went away.
    #[error("Transport closed")]
    TransportClosed,

    /// Malformed frame: implausible length prefix or truncated stream.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Protocol invariant violated (unmatched response id, reserved
    /// method misuse, double dispose).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection was torn down while calls were outstanding, or a
    /// call was issued after teardown.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Structured failure reported by the remote peer's handler.
    #[error("{name}: {message}")]
    Remote {
        /// Error type name (e.g., "Error", "TargetClosedError")
        name: String,
        /// Human-readable error message
        message: String,
        /// Remote stack trace or error chain, if available
        stack: Option<String>,
    },

    /// No object registered under the guid.
    #[error("Object not found: {guid}")]
    ObjectNotFound { guid: String },

    /// Handler registration rejected (unknown or duplicate method).
    #[error("Registration error: {0}")]
    Registration(String),

    /// Timeout waiting for an object or operation.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal channel closed unexpectedly.
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

impl Error {
    /// Converts a wire error payload into [`Error::Remote`].
    pub fn from_payload(payload: ErrorPayload) -> Self {
        Error::Remote {
            name: payload.name.unwrap_or_else(|| "Error".to_string()),
            message: payload.message,
            stack: payload.stack,
        }
    }

    /// Serializes this error as a wire payload, as the dispatcher does for
    /// handler failures.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Error::Remote {
                name,
                message,
                stack,
            } => ErrorPayload {
                message: message.clone(),
                name: Some(name.clone()),
                stack: stack.clone(),
            },
            Error::ObjectNotFound { .. } | Error::ConnectionClosed => ErrorPayload {
                message: self.to_string(),
                name: Some("TargetClosedError".to_string()),
                stack: None,
            },
            other => ErrorPayload {
                message: other.to_string(),
                name: Some("Error".to_string()),
                stack: None,
            },
        }
    }

    /// Returns the error name if this is a Remote error.
    pub fn error_name(&self) -> Option<&str> {
        match self {
            Error::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Returns the stack trace if this is a Remote error with a stack.
    pub fn stack_trace(&self) -> Option<&str> {
        match self {
            Error::Remote { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }

    /// Returns true if the failure means the target object is gone.
    pub fn is_target_closed(&self) -> bool {
        match self {
            Error::ObjectNotFound { .. } | Error::ConnectionClosed => true,
            Error::Remote { name, .. } => name == "TargetClosedError",
            _ => false,
        }
    }
}
