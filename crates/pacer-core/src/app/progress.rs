//! Progress tracking: elapsed time and a moving average of job durations.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::domain::{JobCounts, TaskProgress};

const WINDOW: usize = 50;

#[derive(Debug)]
pub struct ProgressTracker {
    started: Option<Instant>,
    carried: Duration,
    samples: VecDeque<Duration>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            started: None,
            carried: Duration::ZERO,
            samples: VecDeque::with_capacity(WINDOW),
        }
    }

    /// Start (or restart) the running clock.
    pub fn resume(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    /// Stop the running clock, keeping the time accumulated so far.
    pub fn suspend(&mut self) {
        if let Some(started) = self.started.take() {
            self.carried += started.elapsed();
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.carried + self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Record how long a successful job took.
    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// `average × remaining`, `None` until the first completion.
    pub fn estimate(&self, remaining: u64) -> Option<Duration> {
        let avg = self.average()?;
        let remaining = u32::try_from(remaining).unwrap_or(u32::MAX);
        Some(avg.saturating_mul(remaining))
    }

    pub fn snapshot(&self, counts: &JobCounts, concurrency: usize) -> TaskProgress {
        TaskProgress::from_counts(
            counts,
            concurrency,
            self.elapsed(),
            self.estimate(counts.pending),
        )
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
