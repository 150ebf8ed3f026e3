//! TaskSource port - 処理対象データと handler を提供する strategy
//!
//! 埋め込み側アプリケーションが実装します。handler やクロージャは永続化できないため、
//! `Hub::resume_task` ではソースを再度渡してもらいます。
//!
//! # 分類フック
//! `is_retryable` / `is_rate_limited` が Dispatcher が参照する唯一のエラー分類です。

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::domain::{JobError, JobId, TaskId, TaskKind};
use crate::fingerprint;

/// Input data of a task.
pub enum TaskData {
    /// Finite, ordered, available up front (deterministic tasks).
    Items(Vec<serde_json::Value>),

    /// Produced incrementally, possibly unbounded (dynamic tasks).
    Stream(BoxStream<'static, serde_json::Value>),
}

impl fmt::Debug for TaskData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskData::Items(items) => f.debug_tuple("Items").field(&items.len()).finish(),
            TaskData::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Per-execution context handed to the handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub task_id: TaskId,

    /// 1 for the first execution.
    pub attempt: u32,

    /// Fired on `stop()` or when the job's timeout elapses.
    pub cancellation: CancellationToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the job should give up.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// Strategy supplying the data and the per-item handler.
#[async_trait]
pub trait TaskSource: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Called once per dispatcher (at creation for deterministic sources, at
    /// the start of draining for dynamic ones).
    fn data(&self) -> TaskData;

    /// Explicit identity. Required for dynamic sources.
    fn task_key(&self) -> Option<String> {
        None
    }

    async fn handle(
        &self,
        input: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, JobError>;

    /// Id of the job created for the `index`-th item.
    fn job_id(&self, task_id: TaskId, index: u64, input: &serde_json::Value) -> JobId {
        fingerprint::generate_job_id(input, &format!("{task_id}:{index}"))
    }

    fn is_retryable(&self, error: &JobError) -> bool {
        error.is_transient()
    }

    fn is_rate_limited(&self, error: &JobError) -> bool {
        error.is_rate_limit_signal()
    }
}
