use thiserror::Error;

use crate::domain::{ConfigError, TaskId, TaskKind, TaskStatus};
use crate::ports::StorageError;

/// Dispatcher / hub level errors.
///
/// Job failures never show up here; they are recorded on the job and
/// reported through task events.
#[derive(Debug, Error)]
pub enum PacerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("cannot {action} task {task_id} while {state}")]
    InvalidState {
        task_id: TaskId,
        state: TaskStatus,
        action: &'static str,
    },

    #[error("task {task_id} is {expected} but the source is {actual}")]
    SourceKindMismatch {
        task_id: TaskId,
        expected: TaskKind,
        actual: TaskKind,
    },

    #[error("source data of task {task_id} changed (merkle root {expected} -> {actual})")]
    SourceDrift {
        task_id: TaskId,
        expected: String,
        actual: String,
    },

    #[error("task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("dynamic sources must provide a task key")]
    MissingTaskKey,

    #[error("task {0} has been destroyed")]
    Destroyed(TaskId),

    #[error("hub is closed")]
    HubClosed,
}

pub type Result<T, E = PacerError> = std::result::Result<T, E>;
