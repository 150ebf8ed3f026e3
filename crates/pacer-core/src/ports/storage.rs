//! StorageAdapter port - タスクとジョブの正本（source of truth）
//!
//! SQL / KV / in-memory のどれでも、この trait を満たせば engine を動かせます。
//!
//! # 設計原則
//! - `claim_jobs` は同一 storage インスタンスに対してアトミック
//!   （同じジョブを 2 回 claim しない）。SQL なら `UPDATE ... RETURNING` や
//!   `SELECT ... FOR UPDATE SKIP LOCKED` に相当
//! - 終端状態（completed / failed）からの遷移は `reset_failed_jobs` と
//!   `reset_active_jobs` だけ
//! - 1 つのタスクを同時に動かす dispatcher は 1 つだけ（プロセスを跨ぐ排他は
//!   adapter の責務外）

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Job, JobCounts, JobId, JobQuery, JobStatus, TaskId, TaskMeta, TaskUpdate};

/// Errors raised by storage adapters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("storage is closed")]
    Closed,

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task already exists: {0}")]
    TaskExists(TaskId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("illegal transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Persistence contract consumed by the dispatcher and the hub.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Open connections, run migrations, etc.
    async fn initialize(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Flush and release resources. Later calls may fail with `Closed`.
    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    // ---- tasks ----

    async fn create_task(&self, meta: &TaskMeta) -> Result<(), StorageError>;

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskMeta>, StorageError>;

    /// Apply a partial update and return the updated record.
    async fn update_task(
        &self,
        task_id: TaskId,
        update: TaskUpdate,
    ) -> Result<TaskMeta, StorageError>;

    async fn delete_task(&self, task_id: TaskId) -> Result<(), StorageError>;

    async fn list_tasks(&self) -> Result<Vec<TaskMeta>, StorageError>;

    // ---- jobs ----

    /// Insert jobs, ignoring ids that already exist. Returns how many were inserted.
    async fn create_jobs(&self, jobs: Vec<Job>) -> Result<usize, StorageError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StorageError>;

    /// Jobs of a task in creation order, filtered and paginated.
    async fn get_jobs_by_task(
        &self,
        task_id: TaskId,
        query: JobQuery,
    ) -> Result<Vec<Job>, StorageError>;

    async fn get_job_counts(&self, task_id: TaskId) -> Result<JobCounts, StorageError>;

    /// Atomically move up to `limit` claimable jobs (pending, `scheduled_at`
    /// not in the future) to active, incrementing their attempts.
    async fn claim_jobs(&self, task_id: TaskId, limit: usize) -> Result<Vec<Job>, StorageError>;

    /// Active -> Completed.
    async fn complete_job(
        &self,
        job_id: JobId,
        output: serde_json::Value,
    ) -> Result<(), StorageError>;

    /// Active -> Pending (`can_retry`, delayed by `retry_after`) or Active -> Failed.
    async fn fail_job(
        &self,
        job_id: JobId,
        error: &str,
        can_retry: bool,
        retry_after: Option<Duration>,
    ) -> Result<(), StorageError>;

    /// Crash recovery: every active job of the task back to pending. Idempotent.
    async fn reset_active_jobs(&self, task_id: TaskId) -> Result<usize, StorageError>;

    /// Every failed job of the task back to pending with attempts reset to 0.
    async fn reset_failed_jobs(&self, task_id: TaskId) -> Result<usize, StorageError>;

    async fn delete_jobs_by_task(&self, task_id: TaskId) -> Result<usize, StorageError>;
}
