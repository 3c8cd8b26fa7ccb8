//! Error types for the DroidPilot domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`SessionError`] is the
//! single funnel every fatal session condition is reported through.

use thiserror::Error;

use crate::protocol::RequestId;

/// The top-level error type for all DroidPilot operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Transport errors ---
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // --- Oracle errors ---
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the HTTP plumbing underneath a session.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Server returned status {status_code}: {message}")]
    BadStatus { status_code: u16, message: String },

    #[error("Stream read failed: {0}")]
    Read(String),

    #[error("Event stream closed after {failures} consecutive failures")]
    StreamClosed { failures: u32 },

    #[error("Request id {0} is already pending")]
    DuplicateId(RequestId),

    #[error("Invalid endpoint URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP client setup failed: {0}")]
    Client(String),
}

/// Failures talking to the reasoning oracle.
#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by oracle, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Oracle returned an empty answer")]
    EmptyAnswer,

    #[error("Oracle not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Every way an automation session can end other than success.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Connection failed: {0}")]
    Transport(#[from] TransportError),

    #[error("No reply to {method} (id {id}) after {attempts} attempts")]
    CorrelationTimeout {
        id: RequestId,
        method: String,
        attempts: u32,
    },

    #[error("Failed to send {method} after {attempts} attempts: {reason}")]
    SendFailed {
        method: String,
        attempts: u32,
        reason: String,
    },

    #[error("Failed to parse oracle answer as a call: {answer}")]
    OracleParse { answer: String },

    #[error("Maximum iterations reached ({max}). Task may be too complex.")]
    BudgetExhausted { max: u32 },

    #[error("Error communicating with oracle: {0}")]
    Oracle(#[from] OracleError),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Another task is already running")]
    Busy,

    #[error("Query cannot be empty")]
    EmptyQuery,
}

impl SessionError {
    /// Whether this failure was caused by the network rather than by the
    /// oracle or the iteration budget.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::CorrelationTimeout { .. } | Self::SendFailed { .. }
        )
    }

    /// Whether the session hit its iteration ceiling.
    pub fn is_budget(&self) -> bool {
        matches!(self, Self::BudgetExhausted { .. })
    }
}
