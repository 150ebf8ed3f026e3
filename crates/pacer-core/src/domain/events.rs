//! Events - タスクのライフサイクルイベント
//!
//! Dispatcher が発行し、Task が購読者に配信します。
//! 文字列キーではなく `EventKind` で購読先を選びます。

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::ids::JobId;
use super::progress::TaskProgress;
use crate::emitter::Event;

/// Kinds of task events (one per variant of [`TaskEvent`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Progress,
    JobStart,
    JobComplete,
    JobFailed,
    JobRetry,
    RateLimited,
    Completed,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Progress,
        EventKind::JobStart,
        EventKind::JobComplete,
        EventKind::JobFailed,
        EventKind::JobRetry,
        EventKind::RateLimited,
        EventKind::Completed,
        EventKind::Error,
    ];

    /// Wire name, e.g. `job:complete`.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::JobStart => "job:start",
            EventKind::JobComplete => "job:complete",
            EventKind::JobFailed => "job:failed",
            EventKind::JobRetry => "job:retry",
            EventKind::RateLimited => "rate-limited",
            EventKind::Completed => "completed",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TaskEvent {
    /// Emitted after every state-affecting operation.
    Progress(TaskProgress),

    JobStart {
        job_id: JobId,
        attempt: u32,
    },

    JobComplete {
        job_id: JobId,
        output: serde_json::Value,
        duration: Duration,
    },

    /// Terminal failure (non-retryable or attempts exhausted).
    JobFailed {
        job_id: JobId,
        error: String,
        attempts: u32,
    },

    JobRetry {
        job_id: JobId,
        error: String,
        attempt: u32,
        delay: Duration,
    },

    /// Concurrency was cut after a rate-limit signal.
    RateLimited {
        job_id: JobId,
        concurrency: usize,
    },

    /// Every job resolved (failed jobs included).
    Completed(TaskProgress),

    /// Dispatcher-level fault; the task stopped running.
    Error {
        message: String,
    },
}

impl Event for TaskEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            TaskEvent::Progress(_) => EventKind::Progress,
            TaskEvent::JobStart { .. } => EventKind::JobStart,
            TaskEvent::JobComplete { .. } => EventKind::JobComplete,
            TaskEvent::JobFailed { .. } => EventKind::JobFailed,
            TaskEvent::JobRetry { .. } => EventKind::JobRetry,
            TaskEvent::RateLimited { .. } => EventKind::RateLimited,
            TaskEvent::Completed(_) => EventKind::Completed,
            TaskEvent::Error { .. } => EventKind::Error,
        }
    }
}
