//! The long-lived event stream connection.
//!
//! A single background task owns the GET request and its body. It decodes
//! the body with [`SseDecoder`] and hands each event to an [`EventSink`] in
//! arrival order. On a failed connect, a non-success status, a read error,
//! or prolonged silence it backs off and reconnects; after
//! `max_failures` consecutive failures it closes for good and tells the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use droidpilot_config::AppConfig;
use droidpilot_core::error::TransportError;
use droidpilot_core::event::StreamState;
use futures::StreamExt;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sse::SseDecoder;
use crate::{EventSink, StreamControl};

/// Connection and reconnection settings for the event stream.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub max_failures: u32,
    pub backoff: Duration,
    pub backoff_cap: Duration,
    pub inactivity_timeout: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            url: config.server.stream_url.clone(),
            max_failures: config.engine.max_stream_failures.max(1),
            backoff: config.engine.reconnect_backoff(),
            backoff_cap: config.engine.reconnect_backoff_cap(),
            inactivity_timeout: config.engine.inactivity_timeout(),
        }
    }

    /// Delay before the next attempt: the base delay scaled by the
    /// consecutive-failure count, capped.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        self.backoff
            .saturating_mul(failures.max(1))
            .min(self.backoff_cap)
    }
}

/// Why one connection's read loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// Reconnection disabled or session cancelled.
    Stopped,
    /// The server closed the body.
    Eof,
    /// Nothing arrived within the inactivity window.
    Idle,
}

struct Inner {
    client: reqwest::Client,
    settings: StreamSettings,
    sink: Arc<dyn EventSink>,
    state: watch::Sender<StreamState>,
    reconnect_enabled: AtomicBool,
    running: AtomicBool,
    wake: Notify,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the event stream for one session.
///
/// Cloning yields another handle to the same reader.
#[derive(Clone)]
pub struct EventStreamReader {
    inner: Arc<Inner>,
}

impl EventStreamReader {
    /// Create a reader. `cancel` is the session's token; the reader stops
    /// when it or its own child token is cancelled.
    pub fn new(
        client: reqwest::Client,
        settings: StreamSettings,
        sink: Arc<dyn EventSink>,
        cancel: &CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                client,
                settings,
                sink,
                state,
                reconnect_enabled: AtomicBool::new(true),
                running: AtomicBool::new(false),
                wake: Notify::new(),
                cancel: cancel.child_token(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Open the stream in a background task. A no-op while the task is
    /// already running, after `stop()`, or once the stream has closed.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() || !inner.reconnect_enabled.load(Ordering::SeqCst) {
            debug!("Event stream stopped; not starting");
            return;
        }
        if self.state().is_closed() {
            debug!("Event stream closed; not starting");
            return;
        }
        if inner.running.swap(true, Ordering::SeqCst) {
            debug!("Event stream already running");
            return;
        }

        info!(url = %inner.settings.url, "Starting event stream");
        let handle = tokio::spawn(Arc::clone(inner).run());
        if let Ok(mut task) = inner.task.lock() {
            *task = Some(handle);
        }
    }

    /// Disable reconnection and close the socket. Returns immediately;
    /// the background task exits at its next await point.
    pub fn stop(&self) {
        self.inner.reconnect_enabled.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();
        self.inner.wake.notify_waiters();
    }

    /// `stop()` and wait for the background task to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.inner.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Event stream task ended abnormally");
            }
        }
    }

    pub fn state(&self) -> StreamState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for the stream to reach `Streaming`. Returns
    /// `false` on timeout or if the stream closed instead.
    pub async fn wait_until_streaming(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| s.is_streaming() || s.is_closed()))
            .await
        {
            Ok(Ok(state)) => state.is_streaming(),
            _ => false,
        }
    }
}

impl StreamControl for EventStreamReader {
    fn state(&self) -> StreamState {
        EventStreamReader::state(self)
    }

    fn reconnect(&self) {
        if self.state().is_closed() || !self.inner.reconnect_enabled.load(Ordering::SeqCst) {
            return;
        }
        if self.is_running() {
            // Cut a pending backoff short.
            self.inner.wake.notify_one();
        } else {
            self.start();
        }
    }
}

impl Inner {
    fn set_state(&self, state: StreamState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Stream state changed");
        }
    }

    fn should_run(&self) -> bool {
        self.reconnect_enabled.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    async fn run(self: Arc<Self>) {
        let mut failures: u32 = 0;

        while self.should_run() {
            self.set_state(StreamState::Connecting);

            match self.connect_and_read(&mut failures).await {
                Ok(StreamEnd::Stopped) => break,
                Ok(StreamEnd::Eof) => info!("Event stream closed by server, reconnecting"),
                Ok(StreamEnd::Idle) => warn!(
                    idle_secs = self.settings.inactivity_timeout.as_secs(),
                    "No stream activity, reconnecting"
                ),
                Err(e) => {
                    failures += 1;
                    warn!(
                        error = %e,
                        failures,
                        max = self.settings.max_failures,
                        "Event stream failure"
                    );
                }
            }

            if !self.should_run() {
                break;
            }

            if failures >= self.settings.max_failures {
                error!(failures, "Too many consecutive stream failures, giving up");
                self.set_state(StreamState::Closed);
                self.running.store(false, Ordering::SeqCst);
                self.sink.stream_closed(TransportError::StreamClosed { failures });
                return;
            }

            self.set_state(StreamState::Backoff);
            let delay = self.settings.backoff_for(failures);
            debug!(delay_ms = delay.as_millis() as u64, "Backing off before reconnect");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => debug!("Reconnect requested, skipping backoff"),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(StreamState::Disconnected);
        self.running.store(false, Ordering::SeqCst);
        debug!("Event stream task exited");
    }

    /// One connection: issue the GET, then read until it ends.
    async fn connect_and_read(&self, failures: &mut u32) -> Result<StreamEnd, TransportError> {
        let request = self
            .client
            .get(&self.settings.url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive")
            .send();

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(StreamEnd::Stopped),
            response = request => response.map_err(|e| TransportError::Connect(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::BadStatus {
                status_code: status.as_u16(),
                message: status.canonical_reason().unwrap_or("").to_string(),
            });
        }

        *failures = 0;
        self.set_state(StreamState::Streaming);
        info!(url = %self.settings.url, "Event stream connected");

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut last_line = Instant::now();

        loop {
            let idle = self
                .settings
                .inactivity_timeout
                .saturating_sub(last_line.elapsed());

            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(StreamEnd::Stopped),
                next = tokio::time::timeout(idle, body.next()) => next,
            };

            let bytes = match next {
                Err(_) => return Ok(StreamEnd::Idle),
                Ok(None) => {
                    if decoder.has_partial() {
                        debug!("Discarding unterminated event at end of stream");
                    }
                    return Ok(StreamEnd::Eof);
                }
                Ok(Some(Err(e))) => return Err(TransportError::Read(e.to_string())),
                Ok(Some(Ok(bytes))) => bytes,
            };

            if bytes.contains(&b'\n') {
                last_line = Instant::now();
            }

            for event in decoder.feed(&bytes)? {
                debug!(event = %event.kind.as_str(), bytes = event.payload.len(), "Stream event");
                self.sink.deliver(event);
            }

            if !self.reconnect_enabled.load(Ordering::SeqCst) {
                return Ok(StreamEnd::Stopped);
            }
        }
    }
}
