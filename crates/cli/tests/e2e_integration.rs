//! End-to-end integration tests for the DroidPilot automation runtime.
//!
//! These tests exercise the full pipeline from a submitted query to the
//! final report: event stream, correlation, dispatch, oracle consultation
//! over HTTP, and observer notifications.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use droidpilot_agent::Engine;
use droidpilot_config::AppConfig;
use droidpilot_core::{SessionError, SessionObserver, SessionOutcome};
use droidpilot_oracle::OpenAiCompatOracle;
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

// ── Mock server ──────────────────────────────────────────────────────────

/// Serves the automation endpoints and a chat-completions endpoint whose
/// answers are scripted.
#[derive(Clone)]
struct Harness {
    events: broadcast::Sender<String>,
    calls: Arc<Mutex<Vec<Value>>>,
    prompts: Arc<Mutex<Vec<String>>>,
    answers: Arc<Mutex<VecDeque<String>>>,
    error_for: Arc<Mutex<Option<String>>>,
}

impl Harness {
    fn new(answers: &[&str]) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            calls: Arc::new(Mutex::new(Vec::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
            answers: Arc::new(Mutex::new(answers.iter().map(|a| a.to_string()).collect())),
            error_for: Arc::new(Mutex::new(None)),
        }
    }

    /// Answer calls to `tool` with an `error` event instead of a message.
    fn fail_tool(&self, tool: &str) {
        *self.error_for.lock().unwrap() = Some(tool.to_string());
    }

    fn call_ids(&self) -> Vec<i64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c["id"].as_i64().unwrap())
            .collect()
    }

    fn methods(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c["method"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    async fn serve(&self) -> String {
        let router = Router::new()
            .route("/mcp/", get(sse_stream).post(mcp_call))
            .route("/v1/chat/completions", post(chat))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }
}

async fn sse_stream(
    State(h): State<Harness>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let replies = BroadcastStream::new(h.events.subscribe()).filter_map(|frame| async move {
        frame.ok().map(|frame| {
            let (kind, data) = frame.split_once('\n').unwrap_or(("message", ""));
            Ok::<_, Infallible>(Event::default().event(kind).data(data))
        })
    });
    let hello = Event::default().event("endpoint").data("/mcp/?session_id=e2e");
    Sse::new(futures::stream::once(async move { Ok::<_, Infallible>(hello) }).chain(replies))
}

async fn mcp_call(State(h): State<Harness>, axum::Json(body): axum::Json<Value>) -> StatusCode {
    h.calls.lock().unwrap().push(body.clone());

    let tool = body["params"]["name"].as_str().unwrap_or_default().to_string();
    let failing = h.error_for.lock().unwrap().clone();
    let frame = if failing.as_deref() == Some(tool.as_str()) {
        let error = json!({
            "jsonrpc": "2.0",
            "id": body["id"],
            "error": {"code": -32000, "message": "tool failed"}
        });
        format!("error\n{error}")
    } else {
        let result = if body["method"] == "tools/list" {
            json!({"tools": [
                {"name": "mobile_take_screenshot"},
                {"name": "mobile_click_on_screen_at_coordinates"},
                {"name": "mobile_launch_app"}
            ]})
        } else {
            json!({"content": [{"type": "text", "text": format!("{tool} ok")}]})
        };
        let message = json!({"jsonrpc": "2.0", "id": body["id"], "result": result});
        format!("message\n{message}")
    };
    let _ = h.events.send(frame);
    StatusCode::ACCEPTED
}

async fn chat(State(h): State<Harness>, axum::Json(body): axum::Json<Value>) -> axum::Json<Value> {
    let prompt = body["messages"][0]["content"].as_str().unwrap_or_default().to_string();
    h.prompts.lock().unwrap().push(prompt);
    let answer = h.answers.lock().unwrap().pop_front().unwrap_or_default();
    axum::Json(json!({
        "choices": [{"message": {"role": "assistant", "content": answer}}]
    }))
}

// ── Observer ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Log(Mutex<Vec<String>>);

impl Log {
    fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl SessionObserver for Log {
    fn on_status(&self, status: &str) {
        self.0.lock().unwrap().push(format!("status: {status}"));
    }
    fn on_result(&self, result: &str) {
        self.0.lock().unwrap().push(format!("result: {result}"));
    }
    fn on_error(&self, error: &SessionError) {
        self.0.lock().unwrap().push(format!("error: {error}"));
    }
    fn on_done(&self) {
        self.0.lock().unwrap().push("done".into());
    }
}

fn config(base: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.stream_url = format!("{base}/mcp/");
    config.device.serial = "emulator-5554".into();
    config.oracle.api_url = format!("{base}/v1");
    config.oracle.api_key = Some("sk-e2e".into());
    config.engine.call_timeout_ms = 2_000;
    config.engine.wait_retries = 2;
    config.engine.wait_retry_delay_ms = 10;
    config.engine.send_retry_delay_ms = 10;
    config.engine.reconnect_settle_ms = 10;
    config.engine.reconnect_backoff_ms = 10;
    config.engine.step_delay_ms = 0;
    config.engine.max_iterations = 4;
    config
}

fn engine(config: &AppConfig) -> (Arc<Engine>, Arc<Log>) {
    let oracle = Arc::new(OpenAiCompatOracle::from_config(&config.oracle).unwrap());
    let engine = Arc::new(Engine::new(config, oracle).unwrap());
    let log = Arc::new(Log::default());
    engine.set_observer(log.clone());
    (engine, log)
}

const LAUNCH: &str = r#"Launching the app:
{"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "mobile_launch_app", "arguments": {"packageName": "com.android.settings"}}}"#;
const SCREENSHOT: &str = r#"{"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "mobile_take_screenshot", "arguments": {}}}"#;
const DONE: &str = r#"{"status": "completed", "message": "Settings are open"}"#;

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_multi_step_session_completes() {
    let harness = Harness::new(&[LAUNCH, SCREENSHOT, DONE]);
    let base = harness.serve().await;
    let (engine, log) = engine(&config(&base));

    let report = engine
        .submit_query("open the settings app")
        .unwrap()
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        SessionOutcome::Completed {
            message: "Settings are open".into()
        }
    );
    assert_eq!(report.iterations, 3);
    assert_eq!(report.calls_sent, 4);
    assert_eq!(
        harness.methods(),
        vec!["tools/call", "tools/list", "tools/call", "tools/call"]
    );

    // Oracle-supplied ids are replaced by the session's own sequence.
    assert_eq!(harness.call_ids(), vec![1, 2, 3, 4]);
    let first = harness.calls.lock().unwrap()[0].clone();
    assert_eq!(first["params"]["name"], "mobile_use_device");
    assert_eq!(first["params"]["arguments"]["device"], "emulator-5554");
    assert_eq!(first["params"]["arguments"]["deviceType"], "android");

    // Every prompt after the first carries the earlier replies.
    let prompts = harness.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[0].contains("mobile_launch_app"));
    assert!(prompts[0].contains("open the settings app"));
    assert!(prompts[2].contains("mobile_launch_app ok"));
    assert!(prompts[2].contains("mobile_take_screenshot ok"));

    let lines = log.lines();
    assert!(lines.contains(&"status: Discovered 3 tools".to_string()));
    assert_eq!(
        &lines[lines.len() - 2..],
        &["result: Settings are open".to_string(), "done".to_string()]
    );
}

#[tokio::test]
async fn e2e_server_error_event_feeds_back_to_oracle() {
    let harness = Harness::new(&[LAUNCH, "TASK_COMPLETED"]);
    harness.fail_tool("mobile_launch_app");
    let base = harness.serve().await;
    let (engine, log) = engine(&config(&base));

    let report = engine.run_query("open settings").await.unwrap();

    assert!(report.is_success());
    let prompts = harness.prompts.lock().unwrap().clone();
    assert!(prompts[1].contains("tool failed"));
    assert!(log.lines().contains(&"result: Task completed successfully!".to_string()));
}

#[tokio::test]
async fn e2e_runaway_oracle_hits_budget() {
    let harness = Harness::new(&[SCREENSHOT; 10]);
    let base = harness.serve().await;
    let (engine, log) = engine(&config(&base));

    let report = engine.run_query("loop forever").await.unwrap();

    assert_eq!(report.iterations, 4);
    assert_eq!(harness.prompts.lock().unwrap().len(), 4);
    assert_eq!(harness.methods().len(), 6);
    match &report.outcome {
        SessionOutcome::Failed { error } => {
            assert!(error.contains("Maximum iterations reached"))
        }
        other => panic!("expected failure, got {other:?}"),
    }
    let lines = log.lines();
    assert!(lines.last().unwrap().starts_with("error: Maximum iterations reached"));
    assert!(!lines.contains(&"done".to_string()));
}

#[tokio::test]
async fn e2e_sessions_run_back_to_back() {
    let harness = Harness::new(&["TASK_COMPLETED", "task is complete"]);
    let base = harness.serve().await;
    let (engine, _log) = engine(&config(&base));

    let first = engine.run_query("first").await.unwrap();
    let second = engine.run_query("second").await.unwrap();

    assert!(first.is_success());
    assert!(second.is_success());
    assert_ne!(first.session_id, second.session_id);
    // Each session uses a fresh id sequence and its own connection.
    assert_eq!(harness.call_ids(), vec![1, 2, 1, 2]);
}

#[tokio::test]
async fn e2e_busy_engine_rejects_second_query() {
    let harness = Harness::new(&[]);
    let base = harness.serve().await;
    let mut cfg = config(&base);
    // Nobody listens here, so Init keeps retrying until cancelled.
    cfg.server.post_url = Some("http://127.0.0.1:9/mcp/".into());
    cfg.engine.send_retries = 50;
    let (engine, log) = engine(&cfg);

    let handle = engine.submit_query("first").unwrap();
    assert!(matches!(engine.submit_query("second"), Err(SessionError::Busy)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(log.lines().last().unwrap(), "error: Session cancelled");
    assert!(!engine.is_busy());
}
