//! Domain model (IDs, jobs, task metadata, config, progress, events).
//!
//! ここには I/O を持たない純粋なデータ型だけを置きます。
//! 状態遷移のルールは `Job` / `TaskMeta` のメソッドに集約し、
//! storage adapter はそれを呼ぶだけにします。

pub mod config;
pub mod errors;
pub mod events;
pub mod ids;
pub mod job;
pub mod progress;
pub mod task;

pub use config::{
    ConcurrencyConfig, ConfigError, DriftPolicy, DuplicatePolicy, HubConfig, RetryConfig,
    TaskConfig,
};
pub use errors::JobError;
pub use events::{EventKind, TaskEvent};
pub use ids::{JobId, ParseIdError, TaskId};
pub use job::{Job, JobQuery, JobStatus};
pub use progress::{JobCounts, TaskProgress};
pub use task::{TaskKind, TaskMeta, TaskStatus, TaskUpdate};
