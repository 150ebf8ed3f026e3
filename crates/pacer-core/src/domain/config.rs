//! Task configuration (concurrency / retry / timeouts).
//!
//! Every field has a default so partial JSON works:
//! `{"retry": {"max_attempts": 5}}` keeps everything else at its default.
//! Durations are kept as milliseconds so the config persists with the task.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Config validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("concurrency bounds must satisfy 1 <= min ({min}) <= initial ({initial}) <= max ({max})")]
    ConcurrencyBounds { min: usize, initial: usize, max: usize },

    #[error("multiplicative_decrease must be in (0, 1), got {0}")]
    DecreaseFactor(f64),

    #[error("{field} must be at least 1")]
    Zero { field: &'static str },

    #[error("base_delay_ms ({base}) must not exceed max_delay_ms ({max})")]
    DelayBounds { base: u64, max: u64 },

    #[error("invalid config json: {0}")]
    Json(String),
}

/// AIMD concurrency bounds and tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub initial: usize,
    pub min: usize,
    pub max: usize,

    /// Step added after `success_threshold` consecutive successes.
    pub additive_increase: usize,

    /// Factor applied on a rate-limit signal.
    pub multiplicative_decrease: f64,

    pub success_threshold: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            initial: 5,
            min: 1,
            max: 50,
            additive_increase: 1,
            multiplicative_decrease: 0.5,
            success_threshold: 10,
        }
    }
}

impl ConcurrencyConfig {
    /// Fixed concurrency (min = initial = max).
    pub fn fixed(n: usize) -> Self {
        Self {
            initial: n,
            min: n,
            max: n,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min == 0 || self.min > self.initial || self.initial > self.max {
            return Err(ConfigError::ConcurrencyBounds {
                min: self.min,
                initial: self.initial,
                max: self.max,
            });
        }
        if !(self.multiplicative_decrease > 0.0 && self.multiplicative_decrease < 1.0) {
            return Err(ConfigError::DecreaseFactor(self.multiplicative_decrease));
        }
        if self.additive_increase == 0 {
            return Err(ConfigError::Zero {
                field: "additive_increase",
            });
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "success_threshold",
            });
        }
        Ok(())
    }
}

/// Retry / backoff policy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per job (including the first one).
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Randomise each delay into `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "max_attempts",
            });
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::DelayBounds {
                base: self.base_delay_ms,
                max: self.max_delay_ms,
            });
        }
        Ok(())
    }
}

/// Everything attached to a task at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,

    /// Per-job timeout.
    pub timeout_ms: u64,

    /// How long the claim loop waits when nothing is claimable yet.
    pub poll_interval_ms: u64,

    /// Items pulled from a dynamic source per `create_jobs` call.
    pub batch_size: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyConfig::default(),
            retry: RetryConfig::default(),
            timeout_ms: 30_000,
            poll_interval_ms: 100,
            batch_size: 100,
        }
    }
}

impl TaskConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyConfig) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.concurrency.validate()?;
        self.retry.validate()?;
        if self.timeout_ms == 0 {
            return Err(ConfigError::Zero { field: "timeout_ms" });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "poll_interval_ms",
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero { field: "batch_size" });
        }
        Ok(())
    }
}

/// What `Hub::create_task` does when the derived task id already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Return a handle on the existing task.
    #[default]
    Reuse,
    /// Fail with `PacerError::DuplicateTask`.
    Reject,
    /// Create a second task under a fresh random id.
    Allow,
}

/// What `Hub::resume_task` does when a deterministic source's Merkle root
/// no longer matches the persisted one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftPolicy {
    /// Refuse with `PacerError::SourceDrift`.
    #[default]
    Reject,
    /// Log a warning and resume against the persisted jobs.
    Warn,
}

/// Hub-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Config for tasks created without an explicit one.
    pub defaults: TaskConfig,
    pub duplicate_policy: DuplicatePolicy,
    pub drift_policy: DriftPolicy,
}

impl HubConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: HubConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_match_documented_values() {
        let c = TaskConfig::default();
        assert_eq!(c.concurrency.initial, 5);
        assert_eq!(c.concurrency.min, 1);
        assert_eq!(c.concurrency.max, 50);
        assert_eq!(c.concurrency.additive_increase, 1);
        assert_eq!(c.concurrency.multiplicative_decrease, 0.5);
        assert_eq!(c.concurrency.success_threshold, 10);
        assert_eq!(c.retry.max_attempts, 3);
        assert_eq!(c.retry.base_delay(), Duration::from_millis(1000));
        assert_eq!(c.retry.max_delay(), Duration::from_millis(30_000));
        assert_eq!(c.timeout(), Duration::from_millis(30_000));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"{ "retry": { "max_attempts": 7 }, "timeout_ms": 500 }"#;
        let c: TaskConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(c.retry.max_attempts, 7);
        assert_eq!(c.retry.base_delay_ms, 1_000);
        assert_eq!(c.timeout_ms, 500);
        assert_eq!(c.concurrency, ConcurrencyConfig::default());
    }

    #[rstest]
    #[case::min_zero(ConcurrencyConfig { min: 0, ..ConcurrencyConfig::default() })]
    #[case::initial_below_min(ConcurrencyConfig { min: 6, ..ConcurrencyConfig::default() })]
    #[case::initial_above_max(ConcurrencyConfig { initial: 60, ..ConcurrencyConfig::default() })]
    #[case::factor_one(ConcurrencyConfig { multiplicative_decrease: 1.0, ..ConcurrencyConfig::default() })]
    #[case::factor_zero(ConcurrencyConfig { multiplicative_decrease: 0.0, ..ConcurrencyConfig::default() })]
    #[case::no_threshold(ConcurrencyConfig { success_threshold: 0, ..ConcurrencyConfig::default() })]
    fn invalid_concurrency_is_rejected(#[case] c: ConcurrencyConfig) {
        assert!(c.validate().is_err());
    }

    #[test]
    fn retry_delays_must_be_ordered() {
        let r = RetryConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 100,
            ..RetryConfig::default()
        };
        assert_eq!(
            r.validate(),
            Err(ConfigError::DelayBounds {
                base: 10_000,
                max: 100
            })
        );
    }

    #[test]
    fn fixed_concurrency_is_valid() {
        assert!(ConcurrencyConfig::fixed(3).validate().is_ok());
    }

    #[test]
    fn hub_config_from_json() {
        let json = r#"{ "duplicate_policy": "reject", "drift_policy": "warn",
                        "defaults": { "concurrency": { "initial": 2 } } }"#;
        let c = HubConfig::from_json(json).unwrap();
        assert_eq!(c.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(c.drift_policy, DriftPolicy::Warn);
        assert_eq!(c.defaults.concurrency.initial, 2);
    }

    #[test]
    fn hub_config_from_json_validates() {
        let json = r#"{ "defaults": { "batch_size": 0 } }"#;
        assert_eq!(
            HubConfig::from_json(json),
            Err(ConfigError::Zero { field: "batch_size" })
        );
        assert!(matches!(HubConfig::from_json("{"), Err(ConfigError::Json(_))));
    }
}
