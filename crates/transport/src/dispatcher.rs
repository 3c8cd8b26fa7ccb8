//! Outbound call transmission.
//!
//! A call is "sent" once the server answers its POST with a 2xx status.
//! The reply itself arrives later on the event stream; success bodies are
//! ignored.

use std::time::Duration;

use droidpilot_config::AppConfig;
use droidpilot_core::error::{SessionError, TransportError};
use droidpilot_core::protocol::JsonRpcRequest;
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{StreamControl, sleep_or_cancel};

/// Retry bounds for transmitting one call.
#[derive(Debug, Clone)]
pub struct SendPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
    pub reconnect_settle: Duration,
    pub request_timeout: Duration,
}

impl SendPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            attempts: config.engine.send_retries.max(1),
            retry_delay: config.engine.send_retry_delay(),
            reconnect_settle: config.engine.reconnect_settle(),
            request_timeout: config.engine.call_timeout(),
        }
    }
}

/// POSTs JSON-RPC calls to the automation server.
pub struct Dispatcher {
    client: reqwest::Client,
    policy: SendPolicy,
    post_url: Url,
    stream_url: Url,
    follow_endpoint: bool,
}

fn parse_url(url: &str) -> Result<Url, TransportError> {
    Url::parse(url).map_err(|e| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, config: &AppConfig) -> Result<Self, TransportError> {
        Ok(Self {
            client,
            policy: SendPolicy::from_config(config),
            post_url: parse_url(config.server.post_url())?,
            stream_url: parse_url(&config.server.stream_url)?,
            follow_endpoint: config.server.follow_endpoint,
        })
    }

    pub fn with_policy(mut self, policy: SendPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &SendPolicy {
        &self.policy
    }

    /// Where the next call goes. When following the server's advertised
    /// endpoint, a relative path is resolved against the stream URL.
    pub fn target(&self, endpoint: Option<&str>) -> Url {
        match endpoint {
            Some(path) if self.follow_endpoint => match self.stream_url.join(path) {
                Ok(url) => url,
                Err(e) => {
                    warn!(endpoint = %path, error = %e, "Ignoring unusable session endpoint");
                    self.post_url.clone()
                }
            },
            _ => self.post_url.clone(),
        }
    }

    /// One transmission attempt. Returns the HTTP status on success.
    pub async fn send(&self, url: &Url, request: &JsonRpcRequest) -> Result<u16, TransportError> {
        let response = self
            .client
            .post(url.clone())
            .timeout(self.policy.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::BadStatus {
                status_code: status.as_u16(),
                message,
            });
        }

        Ok(status.as_u16())
    }

    /// Transmit `request`, retrying failed attempts.
    ///
    /// Between attempts, if the stream is not live, a reconnect is forced
    /// and given time to settle. After the last failed attempt the call is
    /// reported as [`SessionError::SendFailed`].
    pub async fn send_with_retry(
        &self,
        request: &JsonRpcRequest,
        endpoint: Option<&str>,
        stream: &dyn StreamControl,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let attempts = self.policy.attempts;
        let url = self.target(endpoint);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                result = self.send(&url, request) => result,
            };

            match result {
                Ok(status) => {
                    debug!(id = request.id, method = %request.method, status, "Call sent");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        id = request.id,
                        method = %request.method,
                        attempt,
                        attempts,
                        error = %e,
                        "Send failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt == attempts {
                break;
            }

            sleep_or_cancel(self.policy.retry_delay, cancel).await?;

            let state = stream.state();
            if !state.is_streaming() {
                info!(%state, "Stream not live, reconnecting before resend");
                stream.reconnect();
                sleep_or_cancel(self.policy.reconnect_settle, cancel).await?;
            }
        }

        Err(SessionError::SendFailed {
            method: request.method.clone(),
            attempts,
            reason: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeStream;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use droidpilot_core::event::StreamState;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone)]
    struct Flaky {
        hits: Arc<AtomicU32>,
        fail_first: u32,
        bodies: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    async fn handler(
        State(flaky): State<Flaky>,
        axum::Json(body): axum::Json<serde_json::Value>,
    ) -> StatusCode {
        let n = flaky.hits.fetch_add(1, Ordering::SeqCst) + 1;
        flaky.bodies.lock().unwrap().push(body);
        if n <= flaky.fail_first {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::ACCEPTED
        }
    }

    async fn serve(fail_first: u32) -> (String, Flaky) {
        let flaky = Flaky {
            hits: Arc::new(AtomicU32::new(0)),
            fail_first,
            bodies: Arc::new(Mutex::new(Vec::new())),
        };
        let router = Router::new()
            .route("/mcp/", post(handler))
            .route("/messages", post(handler))
            .with_state(flaky.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}/mcp/"), flaky)
    }

    fn dispatcher(url: &str, follow_endpoint: bool) -> Dispatcher {
        let mut config = AppConfig::default();
        config.server.stream_url = url.to_string();
        config.server.follow_endpoint = follow_endpoint;
        Dispatcher::new(reqwest::Client::new(), &config)
            .unwrap()
            .with_policy(SendPolicy {
                attempts: 3,
                retry_delay: Duration::from_millis(5),
                reconnect_settle: Duration::from_millis(5),
                request_timeout: Duration::from_secs(5),
            })
    }

    #[test]
    fn invalid_url_is_rejected() {
        let mut config = AppConfig::default();
        config.server.post_url = Some("not a url".into());
        let err = Dispatcher::new(reqwest::Client::new(), &config).err().unwrap();
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
    }

    #[test]
    fn target_follows_endpoint_only_when_enabled() {
        let fixed = dispatcher("http://127.0.0.1:8000/mcp/", false);
        assert_eq!(
            fixed.target(Some("/messages?session_id=abc")).as_str(),
            "http://127.0.0.1:8000/mcp/"
        );

        let following = dispatcher("http://127.0.0.1:8000/mcp/", true);
        assert_eq!(
            following.target(Some("/messages?session_id=abc")).as_str(),
            "http://127.0.0.1:8000/messages?session_id=abc"
        );
        assert_eq!(following.target(None).as_str(), "http://127.0.0.1:8000/mcp/");
    }

    #[tokio::test]
    async fn retries_until_the_server_accepts() {
        let (url, flaky) = serve(2).await;
        let d = dispatcher(&url, false);
        let stream = FakeStream::new(StreamState::Streaming);
        let request = JsonRpcRequest::list_tools(4);

        d.send_with_retry(&request, None, &stream, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(flaky.hits.load(Ordering::SeqCst), 3);
        assert_eq!(stream.reconnects(), 0);
        let bodies = flaky.bodies.lock().unwrap();
        assert!(bodies.iter().all(|b| b["id"] == 4 && b["method"] == "tools/list"));
    }

    #[tokio::test]
    async fn exhaustion_reports_send_failed() {
        let (url, flaky) = serve(u32::MAX).await;
        let d = dispatcher(&url, false);
        let stream = FakeStream::new(StreamState::Backoff);

        let err = d
            .send_with_retry(
                &JsonRpcRequest::list_tools(1),
                None,
                &stream,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            SessionError::SendFailed { method, attempts, reason } => {
                assert_eq!(method, "tools/list");
                assert_eq!(attempts, 3);
                assert!(reason.contains("500"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(flaky.hits.load(Ordering::SeqCst), 3);
        // One forced reconnect between each pair of attempts.
        assert_eq!(stream.reconnects(), 2);
    }

    #[tokio::test]
    async fn posts_to_advertised_endpoint() {
        let (url, flaky) = serve(0).await;
        let d = dispatcher(&url, true);
        let stream = FakeStream::new(StreamState::Streaming);

        d.send_with_retry(
            &JsonRpcRequest::list_tools(9),
            Some("/messages"),
            &stream,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(flaky.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_send_stops_retrying() {
        let (url, flaky) = serve(u32::MAX).await;
        let d = dispatcher(&url, false).with_policy(SendPolicy {
            attempts: 5,
            retry_delay: Duration::from_secs(60),
            reconnect_settle: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
        });
        let stream = FakeStream::new(StreamState::Streaming);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = d
            .send_with_retry(&JsonRpcRequest::list_tools(1), None, &stream, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(flaky.hits.load(Ordering::SeqCst), 1);
    }
}
