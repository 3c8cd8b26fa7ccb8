//! Prints session notifications to the terminal.

use droidpilot_core::{SessionError, SessionObserver};

/// Writes status lines to stderr so stdout stays free for results.
pub struct TerminalObserver {
    quiet: bool,
}

impl TerminalObserver {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl SessionObserver for TerminalObserver {
    fn on_status(&self, status: &str) {
        if !self.quiet {
            eprintln!("  ⏳ {status}");
        }
    }

    fn on_result(&self, result: &str) {
        if !self.quiet {
            eprintln!("  ✅ {result}");
        }
    }

    fn on_error(&self, error: &SessionError) {
        if error.is_budget() {
            eprintln!("  ⚠️  {error}");
        } else if error.is_network() {
            eprintln!("  ❌ Network problem: {error}");
        } else {
            eprintln!("  ❌ {error}");
        }
    }

    fn on_done(&self) {
        if !self.quiet {
            eprintln!("  🏁 Done");
        }
    }
}
