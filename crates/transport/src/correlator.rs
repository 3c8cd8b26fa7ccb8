//! Matches asynchronous push events back to the calls that caused them.
//!
//! A waiter is registered for an id **before** its call is sent, so a fast
//! reply can never arrive ahead of the slot that receives it. Each pending
//! wait is removed exactly once: by the event that completes it, by its
//! final timeout, or by session teardown.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use droidpilot_config::EngineConfig;
use droidpilot_core::error::{SessionError, TransportError};
use droidpilot_core::event::{EventKind, RawEvent};
use droidpilot_core::protocol::{RequestId, response_id};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{EventSink, StreamControl, sleep_or_cancel};

/// A reply routed to a waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A `message` event whose id matched (or the lenient fallback).
    Message(String),
    /// An `error` event routed to this wait.
    Error(String),
}

impl Reply {
    pub fn payload(&self) -> &str {
        match self {
            Self::Message(p) | Self::Error(p) => p,
        }
    }

    pub fn into_payload(self) -> String {
        match self {
            Self::Message(p) | Self::Error(p) => p,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

type Slot = oneshot::Sender<Result<Reply, TransportError>>;

struct PendingWait {
    method: String,
    created_at: Instant,
    retries: u32,
    slot: Slot,
}

/// The receiving half of a registered wait.
#[derive(Debug)]
pub struct Waiter {
    id: RequestId,
    method: String,
    rx: oneshot::Receiver<Result<Reply, TransportError>>,
}

impl Waiter {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

/// Timeout and retry bounds for one correlation wait.
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub attempts: u32,
    pub retry_delay: Duration,
    pub reconnect_settle: Duration,
}

impl WaitPolicy {
    pub fn from_config(engine: &EngineConfig) -> Self {
        Self {
            timeout: engine.call_timeout(),
            attempts: engine.wait_retries.max(1),
            retry_delay: engine.wait_retry_delay(),
            reconnect_settle: engine.reconnect_settle(),
        }
    }
}

/// Issues ids, holds the pending-wait table, and routes events into it.
pub struct Correlator {
    next_id: AtomicI64,
    pending: DashMap<RequestId, PendingWait>,
    closed: Mutex<Option<TransportError>>,
    endpoint: Mutex<Option<String>>,
    policy: WaitPolicy,
}

impl Correlator {
    pub fn new(policy: WaitPolicy) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            pending: DashMap::new(),
            closed: Mutex::new(None),
            endpoint: Mutex::new(None),
            policy,
        }
    }

    /// Assign the next correlation id. Ids start at 1 and are never reused
    /// by this correlator.
    pub fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Peek at the id the next call will receive.
    pub fn peek_next_id(&self) -> RequestId {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Register a wait for `id`. Must happen before the call is sent.
    pub fn register(&self, id: RequestId, method: &str) -> Result<Waiter, TransportError> {
        if let Some(err) = self.closed_error() {
            return Err(err);
        }

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id) {
            Entry::Occupied(_) => return Err(TransportError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingWait {
                    method: method.to_string(),
                    created_at: Instant::now(),
                    retries: 0,
                    slot: tx,
                });
            }
        }

        // The stream may have closed after the first check; its sweep
        // would have missed this entry.
        if let Some(err) = self.closed_error() {
            self.pending.remove(&id);
            return Err(err);
        }

        debug!(id, method, "Registered pending wait");
        Ok(Waiter {
            id,
            method: method.to_string(),
            rx,
        })
    }

    /// Complete the wait for `id`. Returns `false` when nothing was pending
    /// under that id (already completed, timed out, or never registered).
    pub fn complete(&self, id: RequestId, reply: Reply) -> bool {
        match self.pending.remove(&id) {
            Some((_, wait)) => {
                debug!(
                    id,
                    method = %wait.method,
                    waited_ms = wait.created_at.elapsed().as_millis() as u64,
                    retries = wait.retries,
                    "Completed pending wait"
                );
                // The waiter may have given up already; nothing to do then.
                let _ = wait.slot.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Remove a wait without completing it.
    pub fn forget(&self, id: RequestId) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop every pending wait. Their waiters observe cancellation.
    pub fn clear(&self) {
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            debug!(dropped, "Cleared pending waits");
        }
    }

    /// The session URL advertised by the last `endpoint` event, if any.
    pub fn session_endpoint(&self) -> Option<String> {
        self.endpoint.lock().ok().and_then(|e| e.clone())
    }

    fn closed_error(&self) -> Option<TransportError> {
        self.closed.lock().ok().and_then(|c| c.clone())
    }

    fn pending_ids(&self) -> Vec<RequestId> {
        self.pending.iter().map(|entry| *entry.key()).collect()
    }

    fn oldest_pending(&self) -> Option<RequestId> {
        self.pending
            .iter()
            .min_by_key(|entry| (entry.value().created_at, *entry.key()))
            .map(|entry| *entry.key())
    }

    fn route_message(&self, payload: String) {
        match response_id(&payload) {
            Ok(Some(id)) => {
                if !self.complete(id, Reply::Message(payload)) {
                    debug!(id, "Dropping reply with no pending wait");
                }
            }
            Ok(None) => {
                debug!(payload = %payload, "Ignoring message without a response id");
            }
            Err(e) => {
                warn!(error = %e, "Malformed message payload");
                // Lenient fallback: hand it to the only waiter rather than
                // leave that waiter to time out.
                let ids = self.pending_ids();
                if let [only] = ids.as_slice() {
                    if self.complete(*only, Reply::Message(payload)) {
                        info!(id = *only, "Delivered malformed payload to sole pending wait");
                    }
                } else {
                    debug!(pending = ids.len(), "Dropping malformed payload");
                }
            }
        }
    }

    fn route_error(&self, payload: String) {
        error!(payload = %payload, "Server error event");

        let target = match response_id(&payload) {
            Ok(Some(id)) if self.is_pending(id) => Some(id),
            Ok(Some(id)) => {
                debug!(id, "Dropping server error for a wait that is no longer pending");
                return;
            }
            // No readable id: fall back to the oldest wait.
            Ok(None) | Err(_) => self.oldest_pending(),
        };

        match target {
            Some(id) => {
                self.complete(id, Reply::Error(payload));
            }
            None => debug!("Server error with no pending wait"),
        }
    }

    /// Block the calling task until `waiter` is completed.
    ///
    /// Each attempt waits `policy.timeout`. Between attempts, if the stream
    /// is not currently streaming, a reconnect is forced. Cancellation fails
    /// the wait immediately. Exhausting the attempts removes the wait and
    /// returns [`SessionError::CorrelationTimeout`].
    pub async fn wait(
        &self,
        waiter: Waiter,
        stream: &dyn StreamControl,
        cancel: &CancellationToken,
    ) -> Result<Reply, SessionError> {
        let Waiter { id, method, mut rx } = waiter;
        let attempts = self.policy.attempts;

        for attempt in 1..=attempts {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.forget(id);
                    return Err(SessionError::Cancelled);
                }
                reply = &mut rx => {
                    return match reply {
                        Ok(Ok(reply)) => Ok(reply),
                        Ok(Err(e)) => Err(SessionError::Transport(e)),
                        // Slot dropped by `clear()` during teardown.
                        Err(_) => Err(SessionError::Cancelled),
                    };
                }
                _ = tokio::time::sleep(self.policy.timeout) => {}
            }

            if let Some(mut wait) = self.pending.get_mut(&id) {
                wait.retries = attempt;
            }
            warn!(id, method = %method, attempt, attempts, "Timed out waiting for reply");

            if attempt == attempts {
                break;
            }

            if let Err(e) = sleep_or_cancel(self.policy.retry_delay, cancel).await {
                self.forget(id);
                return Err(e);
            }

            let state = stream.state();
            if !state.is_streaming() {
                info!(id, %state, "Stream not live, forcing reconnect before retry");
                stream.reconnect();
                if let Err(e) = sleep_or_cancel(self.policy.reconnect_settle, cancel).await {
                    self.forget(id);
                    return Err(e);
                }
            }
        }

        self.forget(id);

        // A reply may have landed between the last timeout and removal.
        if let Ok(Ok(reply)) = rx.try_recv() {
            return Ok(reply);
        }

        Err(SessionError::CorrelationTimeout {
            id,
            method,
            attempts,
        })
    }
}

impl EventSink for Correlator {
    fn deliver(&self, event: RawEvent) {
        let RawEvent { kind, payload } = event;
        match kind {
            EventKind::Endpoint => {
                info!(endpoint = %payload, "Session endpoint advertised");
                if let Ok(mut endpoint) = self.endpoint.lock() {
                    *endpoint = Some(payload);
                }
            }
            EventKind::Message => self.route_message(payload),
            EventKind::Error => self.route_error(payload),
            EventKind::Other(name) => {
                debug!(event = %name, payload = %payload, "Ignoring unrecognized event type");
            }
        }
    }

    fn stream_closed(&self, error: TransportError) {
        error!(error = %error, "Event stream closed; failing pending waits");
        if let Ok(mut closed) = self.closed.lock() {
            *closed = Some(error.clone());
        }
        for id in self.pending_ids() {
            if let Some((_, wait)) = self.pending.remove(&id) {
                let _ = wait.slot.send(Err(error.clone()));
            }
        }
    }
}
