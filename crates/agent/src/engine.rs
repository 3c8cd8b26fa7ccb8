//! The caller-facing engine.
//!
//! At most one session runs per engine. A query submitted while another is
//! active is rejected with [`SessionError::Busy`] rather than queued.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use droidpilot_config::AppConfig;
use droidpilot_core::error::{Error, SessionError};
use droidpilot_core::{
    NoopObserver, Oracle, SessionId, SessionObserver, SessionOutcome, SessionReport,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

use crate::controller::IterationController;

type ActiveSlot = Arc<Mutex<Option<CancellationToken>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds the single-session slot for as long as a session lives.
struct ActiveSession {
    slot: ActiveSlot,
    cancel: CancellationToken,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        lock(&self.slot).take();
    }
}

/// Runs automation sessions against one configured server and oracle.
pub struct Engine {
    config: AppConfig,
    client: reqwest::Client,
    oracle: Arc<dyn Oracle>,
    observer: Mutex<Option<Arc<dyn SessionObserver>>>,
    active: ActiveSlot,
}

impl Engine {
    pub fn new(config: &AppConfig, oracle: Arc<dyn Oracle>) -> Result<Self, Error> {
        config.validate().map_err(|e| Error::Config {
            message: e.to_string(),
        })?;
        let client = droidpilot_transport::build_client(&config.server)?;

        Ok(Self {
            config: config.clone(),
            client,
            oracle,
            observer: Mutex::new(None),
            active: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Install the observer for subsequent sessions, replacing any other.
    ///
    /// The slot outlives sessions: each session snapshots it at start and
    /// drops that snapshot at teardown, but the engine keeps the observer
    /// until [`Engine::clear_observer`] or the next `set_observer`.
    pub fn set_observer(&self, observer: Arc<dyn SessionObserver>) {
        *lock(&self.observer) = Some(observer);
    }

    pub fn clear_observer(&self) {
        lock(&self.observer).take();
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Cancel the active session, if any. Its in-flight wait fails fast and
    /// the observer receives a single `Cancelled` error.
    pub fn cancel(&self) {
        if let Some(token) = lock(&self.active).as_ref() {
            info!("Cancelling active session");
            token.cancel();
        }
    }

    /// Start a session in the background.
    ///
    /// Blank queries and queries submitted while busy are rejected here,
    /// before any task is spawned.
    pub fn submit_query(
        self: &Arc<Self>,
        text: &str,
    ) -> Result<JoinHandle<SessionReport>, SessionError> {
        let (session, query) = self.begin(text)?;
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            engine.run_session(session, query).await
        }))
    }

    /// Run a session on the current task.
    ///
    /// Session failures are reported through the observer and in the
    /// returned report; only the up-front rejections are `Err`.
    pub async fn run_query(&self, text: &str) -> Result<SessionReport, SessionError> {
        let (session, query) = self.begin(text)?;
        Ok(self.run_session(session, query).await)
    }

    fn begin(&self, text: &str) -> Result<(ActiveSession, String), SessionError> {
        let query = text.trim();
        if query.is_empty() {
            return Err(SessionError::EmptyQuery);
        }

        let mut active = lock(&self.active);
        if active.is_some() {
            return Err(SessionError::Busy);
        }
        let cancel = CancellationToken::new();
        *active = Some(cancel.clone());
        drop(active);

        Ok((
            ActiveSession {
                slot: Arc::clone(&self.active),
                cancel,
            },
            query.to_string(),
        ))
    }

    async fn run_session(&self, session: ActiveSession, query: String) -> SessionReport {
        let session_id = SessionId::new();
        let span = info_span!("session", id = %session_id);
        self.execute(session, session_id, query).instrument(span).await
    }

    async fn execute(
        &self,
        session: ActiveSession,
        session_id: SessionId,
        query: String,
    ) -> SessionReport {
        let started_at = Utc::now();
        let observer = lock(&self.observer)
            .clone()
            .unwrap_or_else(|| Arc::new(NoopObserver));

        info!(oracle = %self.oracle.name(), query = %query, "Session started");

        let (result, iterations, calls_sent) = match IterationController::new(
            &self.config,
            self.client.clone(),
            Arc::clone(&self.oracle),
            Arc::clone(&observer),
            session.cancel.clone(),
        ) {
            Ok(mut controller) => {
                let result = controller.run(&query).await;
                (result, controller.iterations(), controller.calls_sent())
            }
            Err(e) => (Err(e), 0, 0),
        };

        // Free the slot before notifying, so an observer may submit again.
        drop(session);

        let outcome = match result {
            Ok(message) => {
                info!(iterations, calls_sent, "Session completed");
                observer.on_result(&message);
                observer.on_done();
                SessionOutcome::Completed { message }
            }
            Err(e) => {
                error!(error = %e, iterations, calls_sent, "Session failed");
                observer.on_error(&e);
                SessionOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        SessionReport {
            session_id,
            started_at,
            finished_at: Utc::now(),
            iterations,
            calls_sent,
            outcome,
        }
    }
}
