//! Configuration loading, validation, and management for DroidPilot.
//!
//! Loads configuration from `~/.droidpilot/config.toml` with environment
//! variable overrides. Validates all settings at startup.
//!
//! Durations are stored as integer milliseconds so the TOML stays flat;
//! every `*_ms` field has a matching [`Duration`] accessor.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.droidpilot/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Automation server endpoints
    #[serde(default)]
    pub server: ServerConfig,

    /// Retry, timeout and loop tunables
    #[serde(default)]
    pub engine: EngineConfig,

    /// Target device
    #[serde(default)]
    pub device: DeviceConfig,

    /// Reasoning oracle backend
    #[serde(default)]
    pub oracle: OracleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// URL of the long-lived event stream (GET)
    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    /// URL calls are POSTed to; defaults to `stream_url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_url: Option<String>,

    /// POST to the URL advertised by the server's `endpoint` event
    #[serde(default)]
    pub follow_endpoint: bool,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_stream_url() -> String {
    "http://127.0.0.1:8000/mcp/".into()
}
fn default_user_agent() -> String {
    format!("droidpilot/{}", env!("CARGO_PKG_VERSION"))
}
fn default_connect_timeout_ms() -> u64 {
    60_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stream_url: default_stream_url(),
            post_url: None,
            follow_endpoint: false,
            user_agent: default_user_agent(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// The URL calls are sent to before any `endpoint` event is seen.
    pub fn post_url(&self) -> &str {
        self.post_url.as_deref().unwrap_or(&self.stream_url)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Every tunable of the request/response engine and the iteration loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long one correlation wait lasts before it counts as a retry
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Correlation-wait attempts before a call is declared lost
    #[serde(default = "default_retries")]
    pub wait_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub wait_retry_delay_ms: u64,

    /// Transmission attempts before a call is declared unsendable
    #[serde(default = "default_retries")]
    pub send_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub send_retry_delay_ms: u64,

    /// Pause after forcing a reconnect, before retrying
    #[serde(default = "default_reconnect_settle_ms")]
    pub reconnect_settle_ms: u64,

    /// Consecutive stream failures before the stream is closed for good
    #[serde(default = "default_max_stream_failures")]
    pub max_stream_failures: u32,

    /// Base reconnect delay, scaled by the consecutive-failure count
    #[serde(default = "default_retry_delay_ms")]
    pub reconnect_backoff_ms: u64,

    #[serde(default = "default_reconnect_backoff_cap_ms")]
    pub reconnect_backoff_cap_ms: u64,

    /// Silence on an open stream after which it is presumed dead
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,

    /// Loop passes before the session gives up
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Pause between loop passes
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,

    /// How long Init waits for the stream to come up
    #[serde(default = "default_connect_grace_ms")]
    pub connect_grace_ms: u64,

    /// Substrings in an oracle answer that end the session successfully
    #[serde(default = "default_completion_markers")]
    pub completion_markers: Vec<String>,
}

fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_retries() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    3_000
}
fn default_reconnect_settle_ms() -> u64 {
    2_000
}
fn default_max_stream_failures() -> u32 {
    5
}
fn default_reconnect_backoff_cap_ms() -> u64 {
    30_000
}
fn default_inactivity_timeout_ms() -> u64 {
    120_000
}
fn default_max_iterations() -> u32 {
    20
}
fn default_step_delay_ms() -> u64 {
    2_000
}
fn default_connect_grace_ms() -> u64 {
    3_000
}
fn default_completion_markers() -> Vec<String> {
    vec![
        "TASK_COMPLETED".into(),
        "\"status\": \"completed\"".into(),
        "task is complete".into(),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            wait_retries: default_retries(),
            wait_retry_delay_ms: default_retry_delay_ms(),
            send_retries: default_retries(),
            send_retry_delay_ms: default_retry_delay_ms(),
            reconnect_settle_ms: default_reconnect_settle_ms(),
            max_stream_failures: default_max_stream_failures(),
            reconnect_backoff_ms: default_retry_delay_ms(),
            reconnect_backoff_cap_ms: default_reconnect_backoff_cap_ms(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            max_iterations: default_max_iterations(),
            step_delay_ms: default_step_delay_ms(),
            connect_grace_ms: default_connect_grace_ms(),
            completion_markers: default_completion_markers(),
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
    pub fn wait_retry_delay(&self) -> Duration {
        Duration::from_millis(self.wait_retry_delay_ms)
    }
    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }
    pub fn reconnect_settle(&self) -> Duration {
        Duration::from_millis(self.reconnect_settle_ms)
    }
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
    pub fn reconnect_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_cap_ms)
    }
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
    pub fn connect_grace(&self) -> Duration {
        Duration::from_millis(self.connect_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device serial passed to the selection tool
    #[serde(default)]
    pub serial: String,

    #[serde(default = "default_device_type")]
    pub device_type: String,

    /// Server tool that binds the session to a device
    #[serde(default = "default_select_tool")]
    pub select_tool: String,
}

fn default_device_type() -> String {
    "android".into()
}
fn default_select_tool() -> String {
    "mobile_use_device".into()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial: String::new(),
            device_type: default_device_type(),
            select_tool: default_select_tool(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// OpenAI-compatible base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default = "default_oracle_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_api_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "google/gemini-2.5-flash".into()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_oracle_timeout_ms() -> u64 {
    120_000
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            timeout_ms: default_oracle_timeout_ms(),
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for OracleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.droidpilot/config.toml).
    ///
    /// Environment variables take precedence over the file:
    /// - `DROIDPILOT_STREAM_URL`
    /// - `DROIDPILOT_DEVICE`
    /// - `DROIDPILOT_MODEL`
    /// - `DROIDPILOT_MAX_ITERATIONS`
    /// - `DROIDPILOT_API_KEY`, then `OPENROUTER_API_KEY`, then `OPENAI_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup, then re-validate.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("DROIDPILOT_STREAM_URL") {
            self.server.stream_url = url;
        }

        if let Some(serial) = lookup("DROIDPILOT_DEVICE") {
            self.device.serial = serial;
        }

        if let Some(model) = lookup("DROIDPILOT_MODEL") {
            self.oracle.model = model;
        }

        if let Some(max) = lookup("DROIDPILOT_MAX_ITERATIONS") {
            self.engine.max_iterations = max.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "DROIDPILOT_MAX_ITERATIONS must be a positive integer, got '{max}'"
                ))
            })?;
        }

        if self.oracle.api_key.is_none() {
            self.oracle.api_key = lookup("DROIDPILOT_API_KEY")
                .or_else(|| lookup("OPENROUTER_API_KEY"))
                .or_else(|| lookup("OPENAI_API_KEY"));
        }

        self.validate()
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".droidpilot")
    }

    /// Get the default configuration file path.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        reqwest::Url::parse(&self.server.stream_url).map_err(|e| {
            ConfigError::ValidationError(format!(
                "server.stream_url '{}' is not a valid URL: {e}",
                self.server.stream_url
            ))
        })?;

        if let Some(post_url) = &self.server.post_url {
            reqwest::Url::parse(post_url).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "server.post_url '{post_url}' is not a valid URL: {e}"
                ))
            })?;
        }

        let engine = &self.engine;
        for (name, value) in [
            ("engine.max_iterations", engine.max_iterations),
            ("engine.max_stream_failures", engine.max_stream_failures),
            ("engine.send_retries", engine.send_retries),
            ("engine.wait_retries", engine.wait_retries),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{name} must be >= 1")));
            }
        }

        for (name, value) in [
            ("engine.call_timeout_ms", engine.call_timeout_ms),
            ("engine.inactivity_timeout_ms", engine.inactivity_timeout_ms),
            ("server.connect_timeout_ms", self.server.connect_timeout_ms),
            ("oracle.timeout_ms", self.oracle.timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{name} must be > 0")));
            }
        }

        if engine.reconnect_backoff_cap_ms < engine.reconnect_backoff_ms {
            return Err(ConfigError::ValidationError(
                "engine.reconnect_backoff_cap_ms must be >= engine.reconnect_backoff_ms".into(),
            ));
        }

        if self.oracle.temperature < 0.0 || self.oracle.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "oracle.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an oracle API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.oracle.api_key.is_some()
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
