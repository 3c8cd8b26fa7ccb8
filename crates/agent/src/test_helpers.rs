//! Shared test helpers for controller and engine tests.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use droidpilot_config::AppConfig;
use droidpilot_core::error::{OracleError, SessionError};
use droidpilot_core::{Oracle, OracleContext, SessionObserver};
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// An oracle that answers from a script.
///
/// Each call to `reason` pops the next answer. Once the script runs out it
/// repeats the fallback answer, or fails with `EmptyAnswer` if there is none.
pub struct ScriptedOracle {
    answers: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    contexts: Mutex<Vec<OracleContext>>,
}

impl ScriptedOracle {
    pub fn new(answers: Vec<&str>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().map(String::from).collect()),
            fallback: None,
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// Answer the same thing forever.
    pub fn repeating(answer: &str) -> Self {
        Self {
            fallback: Some(answer.to_string()),
            ..Self::new(vec![])
        }
    }

    pub fn calls(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn contexts(&self) -> Vec<OracleContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Oracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn reason(&self, context: &OracleContext) -> Result<String, OracleError> {
        self.contexts.lock().unwrap().push(context.clone());
        let next = self.answers.lock().unwrap().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or(OracleError::EmptyAnswer)
    }
}

/// One observer callback, as recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Status(String),
    Result(String),
    Error(String),
    Done,
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Notification>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }

    /// Notifications that end a session: a result or an error.
    pub fn terminal_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|n| matches!(n, Notification::Result(_) | Notification::Error(_)))
            .count()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_status(&self, status: &str) {
        self.events.lock().unwrap().push(Notification::Status(status.into()));
    }

    fn on_result(&self, result: &str) {
        self.events.lock().unwrap().push(Notification::Result(result.into()));
    }

    fn on_error(&self, error: &SessionError) {
        self.events.lock().unwrap().push(Notification::Error(error.to_string()));
    }

    fn on_done(&self) {
        self.events.lock().unwrap().push(Notification::Done);
    }
}

#[derive(Clone)]
struct ServerState {
    tx: broadcast::Sender<(String, String)>,
    received: Arc<Mutex<Vec<Value>>>,
    drop_replies: Arc<AtomicBool>,
}

/// An in-process automation server.
///
/// `GET /mcp/` serves the event stream, opening with an `endpoint` event.
/// `POST /mcp/` records the call and pushes a `message` reply with the
/// same id onto every open stream.
pub struct MockMcpServer {
    pub url: String,
    state: ServerState,
}

impl MockMcpServer {
    pub async fn start() -> Self {
        let (tx, _) = broadcast::channel(64);
        let state = ServerState {
            tx,
            received: Arc::new(Mutex::new(Vec::new())),
            drop_replies: Arc::new(AtomicBool::new(false)),
        };
        let router = Router::new()
            .route("/mcp/", get(stream).post(call))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/mcp/"),
            state,
        }
    }

    /// Accept calls but never answer them.
    pub fn drop_replies(&self, drop: bool) {
        self.state.drop_replies.store(drop, Ordering::SeqCst);
    }

    pub fn received_ids(&self) -> Vec<i64> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|b| b["id"].as_i64())
            .collect()
    }

    pub fn received_methods(&self) -> Vec<String> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|b| b["method"].as_str().map(String::from))
            .collect()
    }
}

async fn stream(
    State(state): State<ServerState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.tx.subscribe();
    let hello = Event::default()
        .event("endpoint")
        .data("/mcp/?session_id=test");
    let replies = BroadcastStream::new(rx).filter_map(|item| async move {
        item.ok()
            .map(|(kind, data)| Ok::<_, Infallible>(Event::default().event(kind).data(data)))
    });
    Sse::new(futures::stream::once(async move { Ok::<_, Infallible>(hello) }).chain(replies))
}

async fn call(State(state): State<ServerState>, axum::Json(body): axum::Json<Value>) -> StatusCode {
    state.received.lock().unwrap().push(body.clone());
    if state.drop_replies.load(Ordering::SeqCst) {
        return StatusCode::ACCEPTED;
    }

    let result = match body["method"].as_str() {
        Some("tools/list") => json!({
            "tools": [
                {"name": "mobile_tap", "description": "Tap the screen"},
                {"name": "mobile_screenshot", "description": "Capture the screen"},
            ]
        }),
        _ => json!({"content": [{"type": "text", "text": "ok"}]}),
    };
    let reply = json!({"jsonrpc": "2.0", "id": body["id"], "result": result});
    let _ = state.tx.send(("message".into(), reply.to_string()));
    StatusCode::ACCEPTED
}

/// Engine settings sized for in-process servers.
pub fn test_config(url: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.stream_url = url.to_string();
    config.device.serial = "emulator-5554".into();
    config.engine.call_timeout_ms = 2_000;
    config.engine.wait_retries = 2;
    config.engine.wait_retry_delay_ms = 10;
    config.engine.send_retries = 2;
    config.engine.send_retry_delay_ms = 10;
    config.engine.reconnect_settle_ms = 10;
    config.engine.reconnect_backoff_ms = 10;
    config.engine.reconnect_backoff_cap_ms = 50;
    config.engine.max_iterations = 3;
    config.engine.step_delay_ms = 0;
    config.engine.connect_grace_ms = 2_000;
    config
}
