//! Domain identifiers (strongly-typed IDs).
//!
//! ULID ベースの ID を Phantom type パターンで型付けしています。
//! `JobId` と `TaskId` は同じ 128-bit 表現を持ちますが、コンパイル時に区別されます。
//!
//! ## ULID を使う理由
//! - **時刻でソート可能**: ランダム生成した ID は生成順に並ぶ
//! - **内容から導出可能**: 16 バイトのハッシュをそのまま ULID として扱えるので、
//!   fingerprint から決定的な ID を作れる（`fingerprint::generate_job_id` など）

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"job-", "task-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData で、実行時にはメモリを消費しません。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// ULID から Id を作成
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// 16 バイト（ハッシュの先頭など）から Id を作成
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self::from_ulid(Ulid::from_bytes(bytes))
    }

    /// 内部の ULID を取得
    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when parsing an id from its display form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id '{0}'")]
pub struct ParseIdError(String);

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// Accepts both the prefixed display form (`task-01H...`) and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError(s.to_string()))
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Job のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

/// Task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Identifier of a Job (one unit of work inside a task).
pub type JobId = Id<Job>;

/// Identifier of a Task (a batch of jobs sharing one source and config).
pub type TaskId = Id<Task>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let ulid1 = Ulid::new();
        let ulid2 = Ulid::new();

        let job = JobId::from_ulid(ulid1);
        let task = TaskId::from_ulid(ulid2);

        assert_eq!(job.as_ulid(), ulid1);
        assert_eq!(task.as_ulid(), ulid2);

        assert!(job.to_string().starts_with("job-"));
        assert!(task.to_string().starts_with("task-"));
        // let _: JobId = task; // <- does not compile
    }

    #[test]
    fn display_form_parses_back() {
        let id = TaskId::from_ulid(Ulid::new());
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let bare: TaskId = id.as_ulid().to_string().parse().unwrap();
        assert_eq!(bare, id);
    }

    #[test]
    fn garbage_does_not_parse() {
        let err = "task-not-a-ulid".parse::<TaskId>().unwrap_err();
        assert!(err.to_string().contains("task-not-a-ulid"));
    }

    #[test]
    fn ids_from_hash_bytes_roundtrip_through_text() {
        // 上位ビットが立っていても Crockford base32 で表現できる
        let id = JobId::from_bytes([0xff; 16]);
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn ids_serialize_as_plain_ulid_strings() {
        let job_id = JobId::from_ulid(Ulid::new());

        let serialized = serde_json::to_string(&job_id).unwrap();
        assert_eq!(serialized, format!("\"{}\"", job_id.as_ulid()));

        let deserialized: JobId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(job_id, deserialized);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<JobId>(), size_of::<Ulid>());
        assert_eq!(size_of::<TaskId>(), 16);
    }
}
