//! Oracle trait — the abstraction over the external reasoning function.
//!
//! An Oracle is consulted once per loop pass. It receives everything the
//! session has learned so far and answers with free-form text that either
//! contains a completion sentinel or a single JSON-RPC call to perform next.
//!
//! Implementations: OpenAI-compatible chat completions (`droidpilot-oracle`),
//! scripted doubles in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::OracleError;
use crate::protocol::RequestId;

/// Everything the oracle may look at when deciding the next step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleContext {
    /// Raw `tools/list` reply from the server.
    pub capabilities: String,

    /// The user's original request text.
    pub query: String,

    /// Raw replies of every prior loop-pass call, oldest first.
    pub transcript: Vec<String>,

    /// 1-based number of the current loop pass.
    pub iteration: u32,

    /// Loop budget for the session.
    pub max_iterations: u32,

    /// The id the next call will be assigned (informational; the controller
    /// overwrites whatever id the oracle writes).
    pub next_id: RequestId,
}

/// The core Oracle trait.
///
/// The iteration controller calls `reason()` without knowing which backend
/// is answering.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// A human-readable name for this oracle (e.g., "openrouter").
    fn name(&self) -> &str;

    /// Produce the next answer for the given context.
    async fn reason(&self, context: &OracleContext) -> Result<String, OracleError>;
}
