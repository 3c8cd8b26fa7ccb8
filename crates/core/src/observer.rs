//! Caller-facing notification surface.
//!
//! A session reports progress through exactly four notifications. Every
//! session ends with either `on_result` followed by `on_done`, or a single
//! `on_error`.

use crate::error::SessionError;

/// Receives status, result, error and done notifications from a session.
///
/// Callbacks are invoked from the session task and must not block.
pub trait SessionObserver: Send + Sync {
    fn on_status(&self, status: &str);

    fn on_result(&self, result: &str);

    fn on_error(&self, error: &SessionError);

    fn on_done(&self);
}

/// An observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {
    fn on_status(&self, _status: &str) {}

    fn on_result(&self, _result: &str) {}

    fn on_error(&self, _error: &SessionError) {}

    fn on_done(&self) {}
}
