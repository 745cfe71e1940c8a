//! Database schema definitions for SQLx.
//!
//! This module contains the database types and structures for the
//! background automation system.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// Arbitrary key/value payload attached to a job at scheduling time.
///
/// The payload is opaque to the engine and interpreted only by the handler
/// that owns the job's type key.
pub type Metadata = serde_json::Map<String, Value>;

/// Lifecycle state of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    /// Scheduled, waiting for its `run_at` time.
    New,
    /// Currently being executed by the engine.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Exhausted its retry budget. Terminal.
    Failed,
    /// Failed, waiting for its next attempt.
    RetryPending,
}

impl JobStatus {
    /// Whether this state ends the record's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Represents a scheduled unit of work in the database.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job, assigned on creation.
    pub id: i64,
    /// Type identifier for the job (used for dispatch).
    pub type_key: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Earliest time this job is eligible for dispatch.
    pub run_at: DateTime<Utc>,
    /// When the engine last began executing this job.
    pub started_at: Option<DateTime<Utc>>,
    /// When the engine last finished executing this job.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last failure message; cleared on success.
    pub fail_reason: Option<String>,
    /// Number of execution attempts made, regardless of outcome.
    pub times_executed: i32,
    /// JSON payload carried for the handler.
    pub metadata: Value,
    /// Timestamp when the job was created.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// An in-memory record handed to silent workers. Never persisted.
    pub(crate) fn ephemeral(type_key: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            type_key: type_key.to_owned(),
            status: JobStatus::Running,
            run_at: now,
            started_at: Some(now),
            finished_at: None,
            fail_reason: None,
            times_executed: 0,
            metadata: Value::Object(Metadata::new()),
            created_at: now,
        }
    }
}
