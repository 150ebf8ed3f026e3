//! Job record and status transitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, TaskId};

/// Job status.
///
/// State transitions:
/// - Pending -> Active -> Completed
/// - Pending -> Active -> Failed (non-retryable, or attempts exhausted)
/// - Active -> Pending (retry scheduled, or crash recovery)
/// - Failed -> Pending (administrative reset only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed (possibly delayed by `scheduled_at`).
    Pending,

    /// Claimed by a dispatcher and executing.
    Active,

    /// Finished successfully.
    Completed,

    /// Failed permanently.
    Failed,
}

impl JobStatus {
    /// Is this a terminal state (no further transitions without a reset)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work.
///
/// Design:
/// - Storage adapters hold these records; the dispatcher never mutates them directly.
/// - All state transitions go through the methods below so every adapter
///   applies them the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task_id: TaskId,

    /// Position of the item in the source (creation order).
    pub sequence: u64,

    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub status: JobStatus,

    /// Number of times this job has been claimed (including the current one if Active).
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Not claimable before this instant (retry backoff).
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        id: JobId,
        task_id: TaskId,
        sequence: u64,
        input: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id,
            sequence,
            input,
            output: None,
            error: None,
            status: JobStatus::Pending,
            attempts: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            scheduled_at: None,
        }
    }

    /// Can this job be claimed at `now`?
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Pending -> Active (increments attempts).
    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Active;
        self.attempts += 1;
        self.started_at = Some(now);
        self.scheduled_at = None;
    }

    /// Active -> Completed.
    pub fn mark_completed(&mut self, output: serde_json::Value, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.completed_at = Some(now);
    }

    /// Active -> Failed.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
    }

    /// Active -> Pending, not claimable before `scheduled_at`.
    pub fn schedule_retry(&mut self, error: String, scheduled_at: Option<DateTime<Utc>>) {
        self.status = JobStatus::Pending;
        self.error = Some(error);
        self.scheduled_at = scheduled_at;
    }

    /// Active -> Pending without touching attempts (crash recovery / stop).
    pub fn requeue(&mut self) {
        self.status = JobStatus::Pending;
        self.scheduled_at = None;
    }

    /// Failed -> Pending, attempts start over.
    pub fn reset(&mut self) {
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.error = None;
        self.scheduled_at = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// Filter + pagination for job listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;
    use ulid::Ulid;

    fn job() -> Job {
        Job::new(
            JobId::from_ulid(Ulid::new()),
            TaskId::from_ulid(Ulid::new()),
            0,
            serde_json::json!("hello"),
            Utc::now(),
        )
    }

    #[test]
    fn new_job_is_pending_and_claimable() {
        let j = job();
        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.attempts, 0);
        assert!(j.is_claimable(Utc::now()));
    }

    #[test]
    fn start_attempt_counts_attempts() {
        let mut j = job();
        j.start_attempt(Utc::now());
        assert_eq!(j.status, JobStatus::Active);
        assert_eq!(j.attempts, 1);
        assert!(!j.is_claimable(Utc::now()));
    }

    #[test]
    fn completed_job_has_output_and_no_error() {
        let mut j = job();
        j.start_attempt(Utc::now());
        j.schedule_retry("boom".into(), None);
        j.start_attempt(Utc::now());
        j.mark_completed(serde_json::json!(5), Utc::now());

        assert_eq!(j.status, JobStatus::Completed);
        assert_eq!(j.output, Some(serde_json::json!(5)));
        assert!(j.error.is_none());
        assert_eq!(j.attempts, 2);
    }

    #[test]
    fn delayed_retry_is_not_claimable_until_due() {
        let now = Utc::now();
        let mut j = job();
        j.start_attempt(now);
        j.schedule_retry("503".into(), Some(now + Duration::seconds(5)));

        assert!(!j.is_claimable(now));
        assert!(j.is_claimable(now + Duration::seconds(5)));
    }

    #[test]
    fn reset_clears_attempts_and_error() {
        let mut j = job();
        j.start_attempt(Utc::now());
        j.mark_failed("fatal".into(), Utc::now());
        j.reset();

        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.attempts, 0);
        assert!(j.error.is_none());
        assert!(j.completed_at.is_none());
    }

    #[rstest]
    #[case::pending(JobStatus::Pending, false)]
    #[case::active(JobStatus::Active, false)]
    #[case::completed(JobStatus::Completed, true)]
    #[case::failed(JobStatus::Failed, true)]
    fn terminal_states(#[case] status: JobStatus, #[case] terminal: bool) {
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&JobStatus::Completed).unwrap();
        assert_eq!(s, "\"completed\"");
    }

    #[test]
    fn query_filters_by_status() {
        let mut j = job();
        assert!(JobQuery::all().matches(&j));
        assert!(JobQuery::with_status(JobStatus::Pending).matches(&j));
        j.start_attempt(Utc::now());
        assert!(!JobQuery::with_status(JobStatus::Pending).matches(&j));
    }
}
