//! HubBuilder - Hub の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 依存の差し替え（Clock / IdGenerator をテスト用に注入）

use std::sync::Arc;

use super::hub::Hub;
use crate::domain::HubConfig;
use crate::error::Result;
use crate::ports::{Clock, IdGenerator, StorageAdapter, SystemClock, UlidGenerator};

/// HubBuilder は Hub を構築
///
/// # 使用例
/// ```ignore
/// let hub = HubBuilder::new(Arc::new(InMemoryStorage::new()))
///     .config(HubConfig::from_json(&raw)?)
///     .build()
///     .await?;
/// ```
///
/// # Fail-fast 設計
/// - build() 時に HubConfig を検証（既定の TaskConfig を含む）
/// - storage の `initialize()` もここで呼ぶので、接続できなければ build が失敗する
pub struct HubBuilder {
    storage: Arc<dyn StorageAdapter>,
    config: HubConfig,
    clock: Option<Arc<dyn Clock>>,
    id_generator: Option<Arc<dyn IdGenerator>>,
}

impl HubBuilder {
    /// 新しい HubBuilder を作成
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            config: HubConfig::default(),
            clock: None,
            id_generator: None,
        }
    }

    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    /// 既定は SystemClock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// 既定は Clock を使う UlidGenerator
    pub fn id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }

    /// HubBuilder を構築して Hub を生成
    ///
    /// # 検証
    /// - `HubConfig::validate()` が失敗すれば `PacerError::Config`
    /// - `StorageAdapter::initialize()` が失敗すれば `PacerError::Storage`
    pub async fn build(self) -> Result<Hub> {
        self.config.validate()?;
        self.storage.initialize().await?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .id_generator
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        Ok(Hub::new(self.storage, self.config, clock, ids))
    }
}
