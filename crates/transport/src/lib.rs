//! Request/response plumbing over a server-pushed event stream.
//!
//! Outbound calls are POSTed by the [`Dispatcher`]; their replies arrive
//! asynchronously on a long-lived GET owned by the [`EventStreamReader`],
//! which hands every decoded event to the [`Correlator`] to be matched back
//! to the waiting caller by id.
//!
//! ```text
//!  caller ──register──▶ Correlator ◀──deliver── EventStreamReader ◀── GET (SSE)
//!    │                      ▲
//!    └──send_with_retry──▶ Dispatcher ──POST──▶ server
//! ```

pub mod correlator;
pub mod dispatcher;
pub mod sse;
pub mod stream;

pub use correlator::{Correlator, Reply, WaitPolicy, Waiter};
pub use dispatcher::{Dispatcher, SendPolicy};
pub use sse::{LineBuffer, SseDecoder};
pub use stream::{EventStreamReader, StreamSettings};

use std::time::Duration;

use droidpilot_config::ServerConfig;
use droidpilot_core::error::{SessionError, TransportError};
use droidpilot_core::event::{RawEvent, StreamState};
use tokio_util::sync::CancellationToken;

/// Receives what the stream reader decodes.
pub trait EventSink: Send + Sync {
    /// Called for every complete event, in arrival order.
    fn deliver(&self, event: RawEvent);

    /// Called once when the reader gives up reconnecting.
    fn stream_closed(&self, error: TransportError);
}

/// What callers waiting on the stream may observe and request.
pub trait StreamControl: Send + Sync {
    fn state(&self) -> StreamState;

    /// Ask for a fresh connection attempt as soon as possible.
    fn reconnect(&self);
}

/// Build the HTTP client shared by the stream reader and the dispatcher.
///
/// No overall request timeout is set: the event stream stays open for the
/// whole session. Calls set their own per-request timeout.
pub fn build_client(server: &ServerConfig) -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .connect_timeout(server.connect_timeout())
        .user_agent(server.user_agent.clone())
        .build()
        .map_err(|e| TransportError::Client(e.to_string()))
}

/// Sleep for `duration` unless the session is cancelled first.
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(SessionError::Cancelled)
        } else {
            Ok(())
        };
    }

    tokio::select! {
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
