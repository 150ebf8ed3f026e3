//! Errors - ジョブ単位のエラーと分類
//!
//! Handler が返すエラーです。Dispatcher はこれを throw せず、
//! 必ず storage に記録してイベントで通知します。
//!
//! # 分類
//! - Transient: Network / Timeout / HTTP 429・503（リトライ推奨）
//! - RateLimit: HTTP 429・503（AIMD の減少トリガー）
//! - Permanent: それ以外（初回で failed）

use std::time::Duration;

/// Error returned by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("network error: {0}")]
    Network(String),

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    #[error("job cancelled")]
    Cancelled,

    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("{0}")]
    Other(String),
}

impl JobError {
    pub fn network(message: impl Into<String>) -> Self {
        JobError::Network(message.into())
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        JobError::Http {
            status,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        JobError::Fatal(message.into())
    }

    pub fn other(message: impl Into<String>) -> Self {
        JobError::Other(message.into())
    }

    /// HTTP 429 / 503.
    pub fn is_rate_limit_signal(&self) -> bool {
        matches!(self, JobError::Http { status: 429 | 503, .. })
    }

    /// Network, timeout, or rate-limit signal.
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::Network(_) | JobError::Timeout(_) => true,
            JobError::Http { .. } => self.is_rate_limit_signal(),
            JobError::Cancelled | JobError::Fatal(_) | JobError::Other(_) => false,
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Fatal(format!("json: {err}"))
    }
}
