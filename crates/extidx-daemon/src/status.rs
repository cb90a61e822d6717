//! Observational status endpoint.
//!
//! `GET /status` returns a JSON document:
//!
//! ```json
//! {
//!   "status": 1,
//!   "status_updated_at": 1760000000,
//!   "active_sessions": 2,
//!   "completed_sessions": 10,
//!   "failed_sessions": 1
//! }
//! ```
//!
//! `status` is `0` (idle), `1` (in progress), `2` (failed) or `3`
//! (succeeded). While any session is active the status stays "in progress";
//! otherwise it reflects the outcome of the last finished session.
//!
//! The counters are plain atomics. Nothing in the build path reads them.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

/// Coarse server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerStatus {
    /// No session has run yet.
    Idle = 0,
    /// At least one session is active.
    InProgress = 1,
    /// The last finished session failed.
    Failed = 2,
    /// The last finished session succeeded.
    Succeeded = 3,
}

impl ServerStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::InProgress,
            2 => Self::Failed,
            3 => Self::Succeeded,
            _ => Self::Idle,
        }
    }
}

/// Status document served at `/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Status code, see [`ServerStatus`].
    pub status: u8,
    /// Unix time of the last status change, in seconds.
    pub status_updated_at: u64,
    /// Sessions currently running.
    pub active_sessions: usize,
    /// Sessions that transferred an index.
    pub completed_sessions: u64,
    /// Sessions that ended with an error.
    pub failed_sessions: u64,
}

/// Lock-free session counters.
#[derive(Debug)]
pub struct StatusTracker {
    status: AtomicU8,
    updated_at: AtomicU64,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self {
            status: AtomicU8::new(ServerStatus::Idle as u8),
            updated_at: AtomicU64::new(unix_now()),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

impl StatusTracker {
    /// Creates an idle tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a session start.
    pub fn session_started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.set(ServerStatus::InProgress);
    }

    /// Records a successful session end.
    pub fn session_succeeded(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.finish(ServerStatus::Succeeded);
    }

    /// Records a failed session end.
    pub fn session_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.finish(ServerStatus::Failed);
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        ServerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Consistent-enough snapshot for reporting.
    #[must_use]
    pub fn snapshot(&self) -> StatusReport {
        StatusReport {
            status: self.status.load(Ordering::SeqCst),
            status_updated_at: self.updated_at.load(Ordering::SeqCst),
            active_sessions: self.active.load(Ordering::SeqCst),
            completed_sessions: self.completed.load(Ordering::SeqCst),
            failed_sessions: self.failed.load(Ordering::SeqCst),
        }
    }

    fn finish(&self, outcome: ServerStatus) {
        let previous = self.active.fetch_sub(1, Ordering::SeqCst);
        if previous <= 1 {
            self.set(outcome);
        }
    }

    fn set(&self, status: ServerStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
        self.updated_at.store(unix_now(), Ordering::SeqCst);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Builds the status router.
pub fn router(tracker: Arc<StatusTracker>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .with_state(tracker)
}

async fn status_handler(State(tracker): State<Arc<StatusTracker>>) -> Json<StatusReport> {
    Json(tracker.snapshot())
}

/// Serves the status endpoint until the task is dropped.
///
/// # Errors
///
/// Returns an error if the HTTP server fails.
pub async fn serve(listener: TcpListener, tracker: Arc<StatusTracker>) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "status endpoint listening");
    }
    axum::serve(listener, router(tracker)).await
}
