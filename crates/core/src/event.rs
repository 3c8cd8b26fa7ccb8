//! Push events decoded from the server's event stream, and the state
//! machine of the connection that carries them.

use serde::{Deserialize, Serialize};

/// The `event:` type of a decoded push message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Session metadata (usually the URL to POST calls to).
    Endpoint,
    /// A JSON-RPC reply carrying the `id` of the call it answers.
    Message,
    /// A server-side error, matched to the currently pending call.
    Error,
    /// Anything else; logged and ignored.
    Other(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "endpoint" => Self::Endpoint,
            "message" => Self::Message,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Endpoint => "endpoint",
            Self::Message => "message",
            Self::Error => "error",
            Self::Other(name) => name,
        }
    }
}

/// One fully reassembled push message, before structured parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub kind: EventKind,
    pub payload: String,
}

impl RawEvent {
    pub fn new(kind: EventKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Lifecycle of the long-lived event stream connection.
///
/// ```text
/// Disconnected → Connecting → Streaming → Backoff → Connecting | Closed
/// ```
///
/// `Closed` is terminal for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Disconnected,
    Connecting,
    Streaming,
    Backoff,
    Closed,
}

impl StreamState {
    pub fn is_streaming(self) -> bool {
        self == Self::Streaming
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Backoff => "backoff",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}
