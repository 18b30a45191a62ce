//! Framed JSON message shapes.
//!
//! Every frame on the wire is exactly one of these: a request (has `id` and
//! `guid`), a response (has `id` only), or an event (has `guid` only).
//! The reserved bookkeeping methods `__create__`, `__dispose__` and
//! `__adopt__` are regular events addressed to the parent object's guid.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Event method announcing a new remote object under the addressed parent.
pub const METHOD_CREATE: &str = "__create__";
/// Event method announcing that the addressed object was torn down.
pub const METHOD_DISPOSE: &str = "__dispose__";
/// Event method re-parenting an object under the addressed parent.
pub const METHOD_ADOPT: &str = "__adopt__";

/// Metadata attached to every request.
///
/// Carries timing information and optional caller location for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Unix timestamp in milliseconds
    #[serde(rename = "wallTime")]
    pub wall_time: i64,
    /// Whether this is an internal call (not user-facing API)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal: Option<bool>,
    /// Source location where the API was called
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Optional title for the operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Source code location for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    /// Source file path
    pub file: String,
    /// Line number (1-indexed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i32>,
    /// Column number (1-indexed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<i32>,
}

impl Metadata {
    /// Create minimal metadata with the current timestamp.
    pub fn now() -> Self {
        Self {
            wall_time: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
            internal: Some(false),
            location: None,
            title: None,
        }
    }
}

/// Command request addressed to a remote object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request ID for correlating responses
    pub id: u32,
    /// Guid of the target object (format: "type@counter")
    #[serde(
        serialize_with = "serialize_arc_str",
        deserialize_with = "deserialize_arc_str"
    )]
    pub guid: Arc<str>,
    /// Method name to invoke
    pub method: String,
    /// Method parameters as JSON object
    pub params: Value,
    /// Metadata with timing and location information
    pub metadata: Metadata,
}

/// Serde helpers for `Arc<str>` serialization.
pub fn serialize_arc_str<S>(arc: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(arc)
}

pub fn deserialize_arc_str<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    Ok(Arc::from(s.as_str()))
}

/// Response to a previously issued request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Request ID this response correlates to
    pub id: u32,
    /// Success result (mutually exclusive with error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error result (mutually exclusive with result)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorWrapper>,
}

/// Wrapper for the error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorWrapper {
    pub error: ErrorPayload,
}

/// Serialized handler failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error message
    pub message: String,
    /// Error type name (e.g., "TimeoutError", "TargetClosedError")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Stack trace or error chain, if available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Fire-and-forget event emitted by a remote object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Guid of the object that emitted the event
    #[serde(
        serialize_with = "serialize_arc_str",
        deserialize_with = "deserialize_arc_str"
    )]
    pub guid: Arc<str>,
    /// Event method name
    pub method: String,
    /// Event parameters as JSON object
    pub params: Value,
}

/// Discriminated union of incoming protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// Response message (has `id` field)
    Response(Response),
    /// Event message (no `id` field)
    Event(Event),
    /// Unknown message type (forward-compatible catch-all)
    Unknown(Value),
}

/// Wire representation of a reference to another remote object.
///
/// Commands whose declared result is a channel carry `{"guid": "..."}` in
/// place of the object itself; both peers resolve it against their registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub guid: String,
}

impl ChannelRef {
    pub fn new(guid: impl Into<String>) -> Self {
        Self { guid: guid.into() }
    }
}
