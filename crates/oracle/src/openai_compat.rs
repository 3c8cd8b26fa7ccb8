//! OpenAI-compatible chat completions oracle.
//!
//! Works with OpenRouter, OpenAI, Ollama, vLLM and any endpoint exposing
//! `/chat/completions`. One non-streaming request per loop pass.

use async_trait::async_trait;
use droidpilot_config::OracleConfig;
use droidpilot_core::{Oracle, OracleContext, OracleError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::prompt::render_prompt;

/// An oracle backed by an OpenAI-compatible chat model.
pub struct OpenAiCompatOracle {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiCompatOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatOracle")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiCompatOracle {
    /// Build from `[oracle]` config. Fails when no API key is configured.
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                OracleError::NotConfigured(
                    "no API key; set oracle.api_key or DROIDPILOT_API_KEY".into(),
                )
            })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| OracleError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: provider_name(&config.api_url).into(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, prompt: String) -> ApiRequest {
        ApiRequest {
            model: self.model.clone(),
            messages: vec![ApiMessage {
                role: "user".into(),
                content: Some(prompt),
            }],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        }
    }
}

/// Guess a display name from the base URL.
fn provider_name(url: &str) -> &'static str {
    if url.contains("openrouter.ai") {
        "openrouter"
    } else if url.contains("api.openai.com") {
        "openai"
    } else if url.contains("localhost:11434") || url.contains("127.0.0.1:11434") {
        "ollama"
    } else {
        "openai-compatible"
    }
}

#[async_trait]
impl Oracle for OpenAiCompatOracle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reason(&self, context: &OracleContext) -> Result<String, OracleError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(render_prompt(context));

        debug!(
            oracle = %self.name,
            model = %self.model,
            iteration = context.iteration,
            "Consulting oracle"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout(e.to_string())
                } else {
                    OracleError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(OracleError::RateLimited { retry_after_secs });
        }

        if status == 401 || status == 403 {
            return Err(OracleError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Oracle returned error");
            return Err(OracleError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let api_response: ApiResponse =
            response.json().await.map_err(|e| OracleError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        let answer = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(OracleError::EmptyAnswer)?;

        debug!(chars = answer.len(), "Oracle answered");
        Ok(answer)
    }
}

// --- API types ---

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}
