//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryStorage**: StorageAdapter の参照実装（テストとデモで使用）
//! - **FnSource**: クロージャから作る TaskSource
//!
//! # 本番用実装
//! SQL / KV などの adapter は別クレートで `StorageAdapter` を実装します。

pub mod fn_source;
pub mod memory;

pub use self::fn_source::FnSource;
pub use self::memory::InMemoryStorage;
