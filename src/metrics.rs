//! Session statistics.
//!
//! Tracks recording sessions end to end: when they started, how long they
//! recorded, how large the finalized artifact was, and how they ended
//! (committed, discarded, or failed). Bounded histories keep memory flat.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::SessionOutcome;

/// Maximum number of finished sessions to retain in history.
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain in history.
const MAX_ERROR_HISTORY: usize = 20;

/// Record of a finished recording session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    /// Recorded duration in seconds (clock value at stop), 0 if the session
    /// never produced an artifact.
    pub duration_secs: u64,
    /// Finalized artifact size in bytes, 0 if none was produced.
    pub artifact_bytes: u64,
    /// "committed", "discarded", or "failed".
    pub outcome: String,
    pub error_message: Option<String>,
}

/// Record of an error that occurred during operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    /// Category of error (e.g. "capture", "finalize").
    pub error_type: String,
    pub message: String,
    pub session_id: Option<String>,
}

/// Summary statistics across all recorded sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_sessions: u64,
    pub committed_sessions: u64,
    pub discarded_sessions: u64,
    pub failed_sessions: u64,
    /// Average recorded duration (secs) across sessions that stopped.
    pub avg_duration_secs: u64,
    /// Total seconds of audio recorded across all stopped sessions.
    pub total_recorded_secs: u64,
    pub last_error: Option<ErrorRecord>,
}

/// Internal state for a session that has not finished yet.
struct SessionInProgress {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    duration_secs: Option<u64>,
    artifact_bytes: Option<u64>,
}

impl SessionInProgress {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            started_at: Utc::now(),
            duration_secs: None,
            artifact_bytes: None,
        }
    }

    fn to_record(&self, outcome: &str, error_message: Option<String>) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.to_string(),
            started_at: self.started_at,
            duration_secs: self.duration_secs.unwrap_or(0),
            artifact_bytes: self.artifact_bytes.unwrap_or(0),
            outcome: outcome.to_string(),
            error_message,
        }
    }
}

/// Collects and stores per-session statistics.
pub struct MetricsCollector {
    /// History of finished sessions (newest first).
    history: VecDeque<SessionRecord>,
    /// History of errors (newest first).
    errors: VecDeque<ErrorRecord>,
    current: Option<SessionInProgress>,
    total_sessions: u64,
    committed_sessions: u64,
    discarded_sessions: u64,
    failed_sessions: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
            total_sessions: 0,
            committed_sessions: 0,
            discarded_sessions: 0,
            failed_sessions: 0,
        }
    }

    /// Start tracking a new session. A still-open previous session indicates
    /// a state machine bug; it is closed out as failed.
    pub fn start_session(&mut self, session_id: Uuid) {
        if let Some(old) = self.current.take() {
            log::warn!(
                "metrics: session {} still open when {} started",
                old.session_id,
                session_id
            );
            let record = old.to_record("failed", Some("superseded by a new session".to_string()));
            self.add_to_history(record);
            self.failed_sessions += 1;
        }

        log::debug!("metrics: session {} started", session_id);
        self.current = Some(SessionInProgress::new(session_id));
        self.total_sessions += 1;
    }

    /// The session stopped and produced an artifact.
    pub fn session_stopped(&mut self, duration_secs: u64, artifact_bytes: u64) {
        if let Some(ref mut session) = self.current {
            session.duration_secs = Some(duration_secs);
            session.artifact_bytes = Some(artifact_bytes);
            log::info!(
                "metrics: session {} stopped after {}s ({} bytes)",
                session.session_id,
                duration_secs,
                artifact_bytes
            );
        }
    }

    /// The session reached a terminal state.
    pub fn session_finished(&mut self, outcome: SessionOutcome) {
        if let Some(session) = self.current.take() {
            let label = match outcome {
                SessionOutcome::Committed => "committed",
                SessionOutcome::Discarded => "discarded",
            };
            log::debug!("metrics: session {} {}", session.session_id, label);
            self.add_to_history(session.to_record(label, None));
            match outcome {
                SessionOutcome::Committed => self.committed_sessions += 1,
                SessionOutcome::Discarded => self.discarded_sessions += 1,
            }
        }
    }

    /// The session failed outright (acquisition or mid-stream).
    pub fn session_failed(&mut self, error: String) {
        let session_id = self.current.as_ref().map(|s| s.session_id.to_string());

        if let Some(session) = self.current.take() {
            let record = session.to_record("failed", Some(error.clone()));
            log::warn!("metrics: session {} failed: {}", record.session_id, error);
            self.add_to_history(record);
            self.failed_sessions += 1;
        }

        self.record_error("capture".to_string(), error, session_id);
    }

    /// Record an error (not necessarily tied to a session).
    pub fn record_error(&mut self, error_type: String, message: String, session_id: Option<String>) {
        let error = ErrorRecord {
            timestamp: Utc::now(),
            error_type,
            message,
            session_id,
        };

        log::debug!("metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let stopped: Vec<_> = self
            .history
            .iter()
            .filter(|s| s.duration_secs > 0 || s.outcome == "committed")
            .collect();
        let count = stopped.len() as u64;
        let total_recorded: u64 = stopped.iter().map(|s| s.duration_secs).sum();

        MetricsSummary {
            total_sessions: self.total_sessions,
            committed_sessions: self.committed_sessions,
            discarded_sessions: self.discarded_sessions,
            failed_sessions: self.failed_sessions,
            avg_duration_secs: if count > 0 { total_recorded / count } else { 0 },
            total_recorded_secs: total_recorded,
            last_error: self.errors.front().cloned(),
        }
    }

    /// Finished-session history, newest first.
    pub fn get_history(&self) -> Vec<SessionRecord> {
        self.history.iter().cloned().collect()
    }

    /// Error history, newest first.
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    pub fn is_active_session(&self, session_id: Uuid) -> bool {
        self.current
            .as_ref()
            .map(|s| s.session_id == session_id)
            .unwrap_or(false)
    }

    fn add_to_history(&mut self, record: SessionRecord) {
        self.history.push_front(record);
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
