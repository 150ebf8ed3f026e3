//! pacer-core
//!
//! Adaptive batch-task dispatch engine: persisted jobs, an AIMD-controlled
//! claim loop, retry with backoff, and crash recovery through the storage contract.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, task, config, progress, errors, events）
//! - **fingerprint**: canonical JSON, Merkle root, 内容から導出する ID
//! - **emitter**: 型付き publish/subscribe
//! - **ports**: 抽象化レイヤー（StorageAdapter, TaskSource, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryStorage, FnSource）
//! - **app**: アプリケーションロジック（Hub, Task, Dispatcher, AIMD, retry）
//! - **error**: Hub / Dispatcher レベルのエラー
//! - **observability**: tracing の初期化

pub mod app;
pub mod domain;
pub mod emitter;
pub mod error;
pub mod fingerprint;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{CreateTaskOptions, Hub, HubBuilder, Task};
pub use error::{PacerError, Result};
