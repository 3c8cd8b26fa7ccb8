//! Per-session state owned by the iteration controller.

use droidpilot_core::protocol::RequestId;
use droidpilot_core::OracleContext;

/// Loop counter, transcript and terminal flag for one session.
///
/// Created when a query starts and dropped when it ends; only the
/// controller mutates it.
#[derive(Debug, Clone)]
pub struct IterationState {
    current: u32,
    max: u32,
    capabilities: String,
    transcript: Vec<String>,
    terminal: bool,
}

impl IterationState {
    pub fn new(max: u32) -> Self {
        Self {
            current: 0,
            max,
            capabilities: String::new(),
            transcript: Vec::new(),
            terminal: false,
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Whether another loop pass fits in the budget.
    pub fn has_budget(&self) -> bool {
        !self.terminal && self.current < self.max
    }

    /// Start the next loop pass and return its 1-based number.
    pub fn advance(&mut self) -> u32 {
        self.current += 1;
        self.current
    }

    pub fn set_capabilities(&mut self, capabilities: String) {
        self.capabilities = capabilities;
    }

    pub fn capabilities(&self) -> &str {
        &self.capabilities
    }

    pub fn record(&mut self, reply: String) {
        self.transcript.push(reply);
    }

    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    pub fn finish(&mut self) {
        self.terminal = true;
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Snapshot what the oracle sees for the current pass.
    pub fn context(&self, query: &str, next_id: RequestId) -> OracleContext {
        OracleContext {
            capabilities: self.capabilities.clone(),
            query: query.to_string(),
            transcript: self.transcript.clone(),
            iteration: self.current,
            max_iterations: self.max,
            next_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_allows_exactly_max_passes() {
        let mut state = IterationState::new(3);
        let mut passes = 0;
        while state.has_budget() {
            state.advance();
            passes += 1;
        }
        assert_eq!(passes, 3);
        assert_eq!(state.current(), 3);
    }

    #[test]
    fn finishing_ends_the_budget_early() {
        let mut state = IterationState::new(10);
        state.advance();
        state.finish();
        assert!(!state.has_budget());
        assert!(state.is_terminal());
    }

    #[test]
    fn context_reflects_transcript_and_counter() {
        let mut state = IterationState::new(5);
        state.set_capabilities("tools".into());
        state.advance();
        state.record(r#"{"id":3}"#.into());
        state.advance();

        let ctx = state.context("open camera", 4);
        assert_eq!(ctx.capabilities, "tools");
        assert_eq!(ctx.transcript, vec![r#"{"id":3}"#.to_string()]);
        assert_eq!(ctx.iteration, 2);
        assert_eq!(ctx.max_iterations, 5);
        assert_eq!(ctx.next_id, 4);
    }
}
