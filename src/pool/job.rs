//! Job record and state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::engine::Message;
use crate::error::JobError;

/// Unique job identifier.
pub type JobId = Uuid;

/// Stand-in for "never" when a deadline would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `from + span`, clamped to roughly 30 years ahead instead of overflowing.
pub(crate) fn saturating_deadline(from: Instant, span: Duration) -> Instant {
    from.checked_add(span).unwrap_or_else(|| from + FAR_FUTURE)
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the dispatch queue.
    Queued,
    /// Handed to a worker.
    Running,
    /// The engine finished normally.
    Completed,
    /// Timed out, crashed, errored or abandoned at shutdown.
    Failed,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Running) | (Queued, Failed) | (Running, Completed) | (Running, Failed)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Exceeded its TTL while queued or running.
    Timeout,
    /// The hosting worker died.
    WorkerCrash,
    /// The engine raised or returned a non-finished status.
    EngineError,
    /// The pool terminated before the job finished.
    PoolShutdown,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::WorkerCrash => "worker_crash",
            Self::EngineError => "engine_error",
            Self::PoolShutdown => "pool_shutdown",
        };
        write!(f, "{s}")
    }
}

/// Failure details recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub message: String,
}

/// One unit of work and its outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub messages: Vec<Message>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `submitted_at + job_ttl`.
    pub deadline: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    /// Monotonic twin of `deadline`, used by the reaper.
    #[serde(skip)]
    expires_at: Instant,
}

impl Job {
    /// Create a queued job that expires `ttl` from now.
    pub fn new(messages: Vec<Message>, ttl: Duration) -> Self {
        let submitted_at = Utc::now();
        let deadline = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| submitted_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            id: Uuid::new_v4(),
            messages,
            status: JobStatus::Queued,
            submitted_at,
            started_at: None,
            completed_at: None,
            deadline,
            result: None,
            error: None,
            expires_at: saturating_deadline(Instant::now(), ttl),
        }
    }

    fn transition_to(&mut self, target: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                state: self.status.to_string(),
                target: target.to_string(),
            });
        }

        self.status = target;
        match target {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            JobStatus::Completed | JobStatus::Failed => self.completed_at = Some(Utc::now()),
            JobStatus::Queued => {}
        }
        Ok(())
    }

    /// Queued → Running.
    pub fn start(&mut self) -> Result<(), JobError> {
        self.transition_to(JobStatus::Running)
    }

    /// Running → Completed with the engine's final state.
    pub fn complete(&mut self, result: serde_json::Value) -> Result<(), JobError> {
        self.transition_to(JobStatus::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    /// Queued/Running → Failed.
    pub fn fail(&mut self, reason: FailureReason, message: impl Into<String>) -> Result<(), JobError> {
        self.transition_to(JobStatus::Failed)?;
        self.error = Some(JobFailure {
            reason,
            message: message.into(),
        });
        Ok(())
    }

    /// Whether the job has outlived its deadline at `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        !self.status.is_terminal() && now > self.expires_at
    }

    /// Wall-clock run time, if the job has started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start).to_std().unwrap_or_default()
        })
    }
}
