//! Oracle backends for DroidPilot.
//!
//! Every backend implements [`droidpilot_core::Oracle`]. The controller
//! only ever sees the trait object.

pub mod openai_compat;
pub mod prompt;

pub use openai_compat::OpenAiCompatOracle;
pub use prompt::render_prompt;

use std::sync::Arc;

use droidpilot_config::OracleConfig;
use droidpilot_core::{Oracle, OracleError};

/// Build the configured oracle.
pub fn from_config(config: &OracleConfig) -> Result<Arc<dyn Oracle>, OracleError> {
    Ok(Arc::new(OpenAiCompatOracle::from_config(config)?))
}
