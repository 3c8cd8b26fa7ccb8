//! The iteration controller.
//!
//! Drives one session through Init (select device), Discover (list tools)
//! and a bounded Loop of oracle consultations. Every call goes through the
//! same register → send → wait sequence, so a reply can never beat its
//! waiter into the pending table.

use std::sync::Arc;
use std::time::Duration;

use droidpilot_config::{AppConfig, DeviceConfig};
use droidpilot_core::error::SessionError;
use droidpilot_core::protocol::{JsonRpcRequest, count_tools};
use droidpilot_core::{Oracle, SessionObserver};
use droidpilot_transport::{
    Correlator, Dispatcher, EventSink, EventStreamReader, Reply, StreamSettings, WaitPolicy,
    sleep_or_cancel,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::parse::{self, Answer};
use crate::session::IterationState;

/// Runs a single automation session against one server connection.
pub struct IterationController {
    oracle: Arc<dyn Oracle>,
    observer: Arc<dyn SessionObserver>,
    correlator: Arc<Correlator>,
    reader: EventStreamReader,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    state: IterationState,
    device: DeviceConfig,
    completion_markers: Vec<String>,
    step_delay: Duration,
    connect_grace: Duration,
    calls_sent: u32,
}

impl IterationController {
    /// Wire up a fresh correlator, stream reader and dispatcher for one
    /// session. Nothing touches the network until [`run`](Self::run).
    pub fn new(
        config: &AppConfig,
        client: reqwest::Client,
        oracle: Arc<dyn Oracle>,
        observer: Arc<dyn SessionObserver>,
        cancel: CancellationToken,
    ) -> Result<Self, SessionError> {
        let correlator = Arc::new(Correlator::new(WaitPolicy::from_config(&config.engine)));
        let sink: Arc<dyn EventSink> = correlator.clone();
        let reader = EventStreamReader::new(
            client.clone(),
            StreamSettings::from_config(config),
            sink,
            &cancel,
        );
        let dispatcher = Dispatcher::new(client, config)?;

        Ok(Self {
            oracle,
            observer,
            correlator,
            reader,
            dispatcher,
            cancel,
            state: IterationState::new(config.engine.max_iterations),
            device: config.device.clone(),
            completion_markers: config.engine.completion_markers.clone(),
            step_delay: config.engine.step_delay(),
            connect_grace: config.engine.connect_grace(),
            calls_sent: 0,
        })
    }

    /// Loop passes started so far.
    pub fn iterations(&self) -> u32 {
        self.state.current()
    }

    /// Calls transmitted so far, Init and Discover included.
    pub fn calls_sent(&self) -> u32 {
        self.calls_sent
    }

    /// Run the session to its end and release its resources.
    ///
    /// Returns the result text on success. However it ends, the stream
    /// reader is shut down and every pending wait is dropped before this
    /// returns.
    pub async fn run(&mut self, query: &str) -> Result<String, SessionError> {
        let result = self.drive(query).await;
        self.state.finish();
        self.teardown().await;
        result
    }

    async fn drive(&mut self, query: &str) -> Result<String, SessionError> {
        self.observer.on_status("Connecting to automation server...");
        self.reader.start();

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
            connected = self.reader.wait_until_streaming(self.connect_grace) => connected,
        };
        if !connected {
            // Sends retry on their own; a slow stream is not fatal yet.
            warn!(
                state = %self.reader.state(),
                grace_ms = self.connect_grace.as_millis() as u64,
                "Event stream not live after grace period"
            );
        }

        // Init
        self.observer.on_status("Selecting device...");
        let request = JsonRpcRequest::select_device(
            self.correlator.next_id(),
            &self.device.select_tool,
            &self.device.serial,
            &self.device.device_type,
        );
        let reply = self.call(request).await?;
        if reply.is_error() {
            warn!(payload = %reply.payload(), "Device selection answered with an error");
        }
        info!(device = %self.device.serial, "Device selected");

        // Discover
        self.observer.on_status("Listing tools...");
        let reply = self
            .call(JsonRpcRequest::list_tools(self.correlator.next_id()))
            .await?;
        let tools = count_tools(reply.payload());
        self.state.set_capabilities(reply.into_payload());
        match tools {
            Some(count) => {
                info!(count, "Tools discovered");
                self.observer.on_status(&format!("Discovered {count} tools"));
            }
            None => self.observer.on_status("Tools discovered"),
        }

        // Loop
        while self.state.has_budget() {
            if self.cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }

            let step = self.state.advance();
            let max = self.state.max();
            self.observer
                .on_status(&format!("Processing step {step} of {max}..."));

            let context = self.state.context(query, self.correlator.peek_next_id());
            let answer = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                answer = self.oracle.reason(&context) => answer?,
            };
            debug!(step, chars = answer.len(), "Oracle answered");

            match parse::interpret(&answer, &self.completion_markers)? {
                Answer::Complete(result) => {
                    info!(step, "Oracle signalled completion");
                    return Ok(result);
                }
                Answer::Call(call) => {
                    let request = call.into_request(self.correlator.next_id());
                    let reply = self.call(request).await?;
                    if reply.is_error() {
                        warn!(step, "Call answered with a server error event");
                    }
                    self.state.record(reply.into_payload());
                }
            }

            if self.state.has_budget() {
                sleep_or_cancel(self.step_delay, &self.cancel).await?;
            }
        }

        warn!(max = self.state.max(), "Iteration budget exhausted");
        Err(SessionError::BudgetExhausted {
            max: self.state.max(),
        })
    }

    /// Register, transmit and await one call.
    async fn call(&mut self, request: JsonRpcRequest) -> Result<Reply, SessionError> {
        let waiter = self.correlator.register(request.id, &request.method)?;
        let endpoint = self.correlator.session_endpoint();

        debug!(id = request.id, method = %request.method, "Sending call");
        if let Err(e) = self
            .dispatcher
            .send_with_retry(&request, endpoint.as_deref(), &self.reader, &self.cancel)
            .await
        {
            self.correlator.forget(request.id);
            return Err(e);
        }
        self.calls_sent += 1;

        self.correlator
            .wait(waiter, &self.reader, &self.cancel)
            .await
    }

    async fn teardown(&mut self) {
        self.reader.shutdown().await;
        let dropped = self.correlator.pending_count();
        self.correlator.clear();
        debug!(dropped, "Session resources released");
    }
}
