//! App - アプリケーション層
//!
//! ports を組み合わせてタスク実行のロジックを実装します。
//!
//! # 主要コンポーネント
//! - **HubBuilder / Hub**: タスクの作成・再開・削除
//! - **Task**: 1 タスクへのハンドル（start / pause / resume / stop / destroy）
//! - **Dispatcher**: claim ループ（claim → handle → AIMD / retry → storage → event）
//! - **AimdController**: 並列度の調整
//! - **RetryPolicy**: バックオフ計算
//! - **ProgressTracker**: 経過時間と残り時間の推定

pub mod aimd;
pub mod builder;
pub mod dispatcher;
pub mod hub;
pub mod progress;
pub mod retry;
pub mod task;

// 主要な型を再エクスポート
pub use self::aimd::AimdController;
pub use self::builder::HubBuilder;
pub use self::dispatcher::Dispatcher;
pub use self::hub::{CreateTaskOptions, Hub};
pub use self::progress::ProgressTracker;
pub use self::retry::RetryPolicy;
pub use self::task::Task;
