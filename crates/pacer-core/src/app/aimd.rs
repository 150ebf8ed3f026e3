//! AIMD concurrency controller.
//!
//! Additive increase after a run of successes, multiplicative decrease on a
//! rate-limit signal. Owned by a single dispatcher; never shared.

use crate::domain::ConcurrencyConfig;

#[derive(Debug, Clone)]
pub struct AimdController {
    config: ConcurrencyConfig,
    current: usize,
    consecutive_successes: u32,
}

impl AimdController {
    pub fn new(config: ConcurrencyConfig) -> Self {
        let floor = config.min.max(1);
        let current = config.initial.clamp(floor, config.max.max(floor));
        Self {
            config,
            current,
            consecutive_successes: 0,
        }
    }

    /// Current concurrency budget.
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Record a success. Returns the new budget when it grew.
    pub fn on_success(&mut self) -> Option<usize> {
        self.consecutive_successes += 1;
        if self.consecutive_successes < self.config.success_threshold {
            return None;
        }
        self.consecutive_successes = 0;

        let next = (self.current + self.config.additive_increase).min(self.config.max);
        if next == self.current {
            return None;
        }
        self.current = next;
        Some(next)
    }

    /// Record a rate-limit signal. Returns the (possibly unchanged) budget.
    pub fn on_rate_limited(&mut self) -> usize {
        self.consecutive_successes = 0;
        let scaled = (self.current as f64 * self.config.multiplicative_decrease).floor() as usize;
        self.current = scaled.max(self.config.min).max(1);
        self.current
    }
}
