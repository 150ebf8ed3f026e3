//! Progress snapshots.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Job counts for one task, taken from storage in a single read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl JobCounts {
    /// Jobs that reached a terminal state.
    pub fn resolved(&self) -> u64 {
        self.completed + self.failed
    }

    /// Nothing left to claim or wait for.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.active == 0
    }
}

/// Point-in-time view of a task, as returned by `Task::get_progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
    pub active: u64,

    /// Current concurrency budget.
    pub concurrency: usize,

    /// Time spent running in this process.
    pub elapsed: Duration,

    /// `None` until at least one job has completed.
    pub estimated_remaining: Option<Duration>,
}

impl TaskProgress {
    pub fn from_counts(
        counts: &JobCounts,
        concurrency: usize,
        elapsed: Duration,
        estimated_remaining: Option<Duration>,
    ) -> Self {
        Self {
            total: counts.total,
            completed: counts.completed,
            failed: counts.failed,
            pending: counts.pending,
            active: counts.active,
            concurrency,
            elapsed,
            estimated_remaining,
        }
    }

    /// Fraction of jobs resolved, in `[0, 1]`.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed + self.failed) as f64 / self.total as f64
    }
}
