//! Task metadata: one record per task, owned by the dispatcher.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::TaskConfig;
use super::ids::TaskId;
use super::progress::JobCounts;

/// How a task's input set is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Full input set known up front; fingerprinted with a Merkle root.
    Deterministic,

    /// Inputs produced incrementally, possibly unbounded.
    Dynamic,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Deterministic => f.write_str("deterministic"),
            TaskKind::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// Task status.
///
/// - Idle -> Running <-> Paused
/// - Running -> Completed (every job resolved, failed jobs included)
/// - Running -> Failed (dispatcher-level fault only)
/// - Running/Paused -> Idle (stop)
/// - Running -> Paused (also on hub close)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Was the task cut off with work left? Candidates for `Hub::resume_task`.
    pub fn is_interrupted(self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::Paused | TaskStatus::Failed
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Persisted task record.
///
/// Invariant: `completed_jobs + failed_jobs <= total_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,

    /// Content fingerprint (deterministic tasks only).
    pub merkle_root: Option<String>,

    pub status: TaskStatus,
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,

    /// Config the task was created with; reused on resume.
    pub config: TaskConfig,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskMeta {
    pub fn new(
        id: TaskId,
        name: impl Into<String>,
        kind: TaskKind,
        merkle_root: Option<String>,
        config: TaskConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            merkle_root,
            status: TaskStatus::Idle,
            total_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            config,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a partial update (used by storage adapters).
    pub fn apply(&mut self, update: &TaskUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(total) = update.total_jobs {
            self.total_jobs = total;
        }
        if let Some(completed) = update.completed_jobs {
            self.completed_jobs = completed;
        }
        if let Some(failed) = update.failed_jobs {
            self.failed_jobs = failed;
        }
        if let Some(started_at) = update.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = completed_at;
        }
        self.updated_at = now;
    }
}

/// Partial update for a [`TaskMeta`]. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub total_jobs: Option<u64>,
    pub completed_jobs: Option<u64>,
    pub failed_jobs: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the completion timestamp (task reopened).
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Counters copied from a single counts snapshot.
    pub fn counters(counts: &JobCounts) -> Self {
        Self {
            total_jobs: Some(counts.total),
            completed_jobs: Some(counts.completed),
            failed_jobs: Some(counts.failed),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }
}
