//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。engine は具体的な永続化や
//! データ供給元を知らず、ここにある trait だけに依存します。
//!
//! # 設計原則
//! - storage がジョブ状態の正本（プロセスが落ちても再開できる）
//! - TaskSource は永続化しない（resume 時に再度渡す）

pub mod clock;
pub mod id_generator;
pub mod source;
pub mod storage;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::source::{JobContext, TaskData, TaskSource};
pub use self::storage::{StorageAdapter, StorageError};
