//! Hub - タスクの作成・再開・削除の入口
//!
//! # 責務
//! - タスク ID の導出（deterministic: 名前 + Merkle root、dynamic: task key）
//! - 重複タスクの扱い（`DuplicatePolicy`）
//! - クラッシュ後の再開（`reset_active_jobs` + ソースの再アタッチ + drift 検出）
//! - このプロセスで生きている Task ハンドルの管理
//!
//! # 前提
//! 1 つのタスクを同時に動かす dispatcher は 1 つだけ。別プロセスの Hub が
//! 同じタスクを扱う場合の排他は storage adapter 側の責務です。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use tracing::{info, warn};

use super::dispatcher::Dispatcher;
use super::task::Task;
use crate::domain::{
    DriftPolicy, DuplicatePolicy, HubConfig, TaskConfig, TaskId, TaskKind, TaskMeta, TaskStatus,
    TaskUpdate,
};
use crate::error::{PacerError, Result};
use crate::fingerprint;
use crate::ports::{Clock, IdGenerator, StorageAdapter, TaskData, TaskSource};

/// Input of [`Hub::create_task`].
pub struct CreateTaskOptions {
    pub name: String,
    pub source: Arc<dyn TaskSource>,

    /// Overrides the hub defaults when set.
    pub config: Option<TaskConfig>,
}

impl CreateTaskOptions {
    pub fn new(name: impl Into<String>, source: impl TaskSource + 'static) -> Self {
        Self {
            name: name.into(),
            source: Arc::new(source),
            config: None,
        }
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = Some(config);
        self
    }
}

pub struct Hub {
    storage: Arc<dyn StorageAdapter>,
    config: HubConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    tasks: Mutex<HashMap<TaskId, Task>>,
    closed: AtomicBool,
}

impl Hub {
    pub(crate) fn new(
        storage: Arc<dyn StorageAdapter>,
        config: HubConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            storage,
            config,
            clock,
            ids,
            tasks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Persist a new task (or re-attach to an identical one) and return its handle.
    pub async fn create_task(&self, options: CreateTaskOptions) -> Result<Task> {
        self.ensure_open()?;
        let CreateTaskOptions {
            name,
            source,
            config,
        } = options;
        let config = config.unwrap_or_else(|| self.config.defaults.clone());
        config.validate()?;

        let kind = source.kind();
        let (mut task_id, merkle_root, items) = match kind {
            TaskKind::Deterministic => {
                let items = collect_items(source.data()).await;
                let root = fingerprint::compute_merkle_root(&items);
                (fingerprint::generate_task_id(&name, &root), Some(root), items)
            }
            TaskKind::Dynamic => {
                let key = source.task_key().ok_or(PacerError::MissingTaskKey)?;
                (fingerprint::generate_task_id(&key, "dynamic"), None, Vec::new())
            }
        };

        if let Some(existing) = self.storage.get_task(task_id).await? {
            match self.config.duplicate_policy {
                DuplicatePolicy::Reject => return Err(PacerError::DuplicateTask(task_id)),
                DuplicatePolicy::Reuse => {
                    info!(task_id = %task_id, name = %name, "reusing existing task");
                    if let Some(task) = self.live_task(task_id) {
                        return Ok(task);
                    }
                    return self.attach(existing, source).await;
                }
                DuplicatePolicy::Allow => {
                    task_id = self.ids.generate_task_id();
                }
            }
        }

        let meta = TaskMeta::new(task_id, name, kind, merkle_root, config, self.clock.now());
        let dispatcher = Dispatcher::new(&meta, self.storage.clone(), source, self.clock.clone());
        let meta = dispatcher.prepare(&meta, items).await?;
        info!(
            task_id = %task_id,
            name = %meta.name,
            kind = %kind,
            jobs = meta.total_jobs,
            "task created"
        );

        Ok(self.register(Task::new(dispatcher, self.storage.clone())))
    }

    /// Live handle created or resumed by this hub.
    pub fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        self.ensure_open()?;
        Ok(self.live_task(task_id))
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskMeta>> {
        self.ensure_open()?;
        Ok(self.storage.list_tasks().await?)
    }

    /// Tasks with unfinished work that a previous process left behind:
    /// running (crash), paused (pause or hub close) or failed (dispatcher fault).
    pub async fn list_interrupted_tasks(&self) -> Result<Vec<TaskMeta>> {
        let tasks = self.list_tasks().await?;
        Ok(tasks
            .into_iter()
            .filter(|meta| meta.status.is_interrupted())
            .collect())
    }

    /// Re-attach a source to a persisted task after a restart.
    ///
    /// Active jobs left behind by a crash go back to pending, and a task left
    /// running is persisted as paused so the returned handle is ready to `resume()`.
    pub async fn resume_task(
        &self,
        task_id: TaskId,
        source: impl TaskSource + 'static,
    ) -> Result<Option<Task>> {
        self.ensure_open()?;
        let Some(meta) = self.storage.get_task(task_id).await? else {
            return Ok(None);
        };
        let source: Arc<dyn TaskSource> = Arc::new(source);
        check_kind(&meta, source.as_ref())?;

        if meta.kind == TaskKind::Deterministic {
            let items = collect_items(source.data()).await;
            let actual = fingerprint::compute_merkle_root(&items);
            let expected = meta.merkle_root.clone().unwrap_or_default();
            if actual != expected {
                match self.config.drift_policy {
                    DriftPolicy::Reject => {
                        return Err(PacerError::SourceDrift {
                            task_id,
                            expected,
                            actual,
                        });
                    }
                    DriftPolicy::Warn => warn!(
                        task_id = %task_id,
                        expected = %expected,
                        actual = %actual,
                        "source data drifted, resuming persisted jobs"
                    ),
                }
            }
        }

        if let Some(task) = self.live_task(task_id)
            && task.dispatcher().is_live()
        {
            return Err(PacerError::InvalidState {
                task_id,
                state: task.status(),
                action: "resume",
            });
        }

        self.attach(meta, source).await.map(Some)
    }

    /// Stop a live handle (if any) and delete the task with its jobs.
    pub async fn delete_task(&self, task_id: TaskId) -> Result<()> {
        self.ensure_open()?;
        let live = self.tasks().remove(&task_id);
        if let Some(task) = live
            && !task.is_destroyed()
        {
            return task.destroy().await;
        }

        if self.storage.get_task(task_id).await?.is_none() {
            return Err(PacerError::TaskNotFound(task_id));
        }
        self.storage.delete_jobs_by_task(task_id).await?;
        self.storage.delete_task(task_id).await?;
        info!(task_id = %task_id, "task deleted");
        Ok(())
    }

    /// Requeue every failed job of a task with a fresh attempt budget.
    pub async fn reset_failed_jobs(&self, task_id: TaskId) -> Result<usize> {
        self.ensure_open()?;
        let meta = self
            .storage
            .get_task(task_id)
            .await?
            .ok_or(PacerError::TaskNotFound(task_id))?;

        let reset = self.storage.reset_failed_jobs(task_id).await?;
        let counts = self.storage.get_job_counts(task_id).await?;
        self.storage
            .update_task(task_id, TaskUpdate::counters(&counts))
            .await?;

        if reset > 0 {
            match self.live_task(task_id) {
                Some(task) => task.dispatcher().reopen().await?,
                None if meta.status == TaskStatus::Completed => {
                    let update = TaskUpdate {
                        completed_at: Some(None),
                        ..TaskUpdate::status(TaskStatus::Idle)
                    };
                    self.storage.update_task(task_id, update).await?;
                }
                None => {}
            }
        }
        info!(task_id = %task_id, reset, "failed jobs requeued");
        Ok(reset)
    }

    /// Shut down live tasks and close the storage adapter. Later calls return `HubClosed`.
    ///
    /// A task cut off mid-run is left Paused with its in-flight jobs requeued,
    /// so the next process finds it through [`Hub::list_interrupted_tasks`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let live: Vec<Task> = self.tasks().drain().map(|(_, task)| task).collect();
        for task in live {
            if task.is_destroyed() {
                continue;
            }
            if let Err(err) = task.dispatcher().shutdown().await {
                warn!(task_id = %task.id(), error = %err, "could not shut down task on close");
            }
        }
        self.storage.close().await?;
        info!("hub closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PacerError::HubClosed);
        }
        Ok(())
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_task(&self, task_id: TaskId) -> Option<Task> {
        self.tasks()
            .get(&task_id)
            .filter(|task| !task.is_destroyed())
            .cloned()
    }

    fn register(&self, task: Task) -> Task {
        self.tasks().insert(task.id(), task.clone());
        task
    }

    /// Crash recovery + new handle for a persisted task.
    async fn attach(&self, meta: TaskMeta, source: Arc<dyn TaskSource>) -> Result<Task> {
        check_kind(&meta, source.as_ref())?;
        let task_id = meta.id;

        let recovered = self.storage.reset_active_jobs(task_id).await?;
        let meta = match meta.status {
            TaskStatus::Running | TaskStatus::Failed => {
                self.storage
                    .update_task(task_id, TaskUpdate::status(TaskStatus::Paused))
                    .await?
            }
            _ => meta,
        };
        info!(task_id = %task_id, recovered, status = %meta.status, "task attached");

        let dispatcher = Dispatcher::new(&meta, self.storage.clone(), source, self.clock.clone());
        Ok(self.register(Task::new(dispatcher, self.storage.clone())))
    }
}

fn check_kind(meta: &TaskMeta, source: &dyn TaskSource) -> Result<()> {
    let actual = source.kind();
    if actual != meta.kind {
        return Err(PacerError::SourceKindMismatch {
            task_id: meta.id,
            expected: meta.kind,
            actual,
        });
    }
    Ok(())
}

async fn collect_items(data: TaskData) -> Vec<serde_json::Value> {
    match data {
        TaskData::Items(items) => items,
        TaskData::Stream(stream) => stream.collect().await,
    }
}
