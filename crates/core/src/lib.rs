//! # DroidPilot Core
//!
//! Domain types, traits, and error definitions for the DroidPilot mobile
//! automation engine. This crate performs **no I/O** — it defines the model
//! that the transport, oracle, and agent crates implement against.
//!
//! ## Seams
//!
//! - [`Oracle`] — the external reasoning function consulted once per loop pass
//! - [`SessionObserver`] — the four-notification caller surface
//! - [`protocol`] — JSON-RPC wire shapes exchanged with the automation server
//! - [`event`] — decoded push events and the stream connection state machine

pub mod error;
pub mod event;
pub mod observer;
pub mod oracle;
pub mod protocol;
pub mod session;

// Re-export key types at crate root for ergonomics
pub use error::{Error, OracleError, Result, SessionError, TransportError};
pub use event::{EventKind, RawEvent, StreamState};
pub use observer::{NoopObserver, SessionObserver};
pub use oracle::{Oracle, OracleContext};
pub use protocol::{JsonRpcRequest, RequestId, ToolCall};
pub use session::{SessionId, SessionOutcome, SessionReport};
