//! The automation loop of DroidPilot.
//!
//! A session runs in three phases over one server connection:
//!
//! 1. **Init**: select the target device
//! 2. **Discover**: list the server's tools
//! 3. **Loop**: ask the oracle for the next call, send it, await its reply,
//!    and feed the reply back, until the oracle signals completion or the
//!    iteration budget runs out
//!
//! [`Engine`] is the caller-facing entry point; it guarantees that at most
//! one session is active and that exactly one terminal notification is
//! delivered per session.

pub mod controller;
pub mod engine;
pub mod parse;
pub mod session;

#[cfg(test)]
mod test_helpers;

pub use controller::IterationController;
pub use engine::Engine;
pub use parse::{Answer, DEFAULT_RESULT};
pub use session::IterationState;
