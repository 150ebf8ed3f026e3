//! Task - 1 タスクへのハンドル
//!
//! Dispatcher への薄いラッパーです。`Clone` は安価（中身は `Arc`）なので、
//! `start()` を spawn したタスクと `pause()` を呼ぶ側で同じハンドルを共有できます。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::info;

use super::dispatcher::Dispatcher;
use crate::domain::{EventKind, Job, JobQuery, TaskEvent, TaskId, TaskMeta, TaskProgress, TaskStatus};
use crate::emitter::Subscription;
use crate::error::{PacerError, Result};
use crate::ports::StorageAdapter;

struct TaskInner {
    dispatcher: Dispatcher,
    storage: Arc<dyn StorageAdapter>,
    destroyed: AtomicBool,
}

/// Handle to one task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub(crate) fn new(dispatcher: Dispatcher, storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                dispatcher,
                storage,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.dispatcher.task_id()
    }

    /// Persisted record (counters as of the last progress update).
    pub async fn meta(&self) -> Result<TaskMeta> {
        self.ensure_alive()?;
        self.inner
            .storage
            .get_task(self.id())
            .await?
            .ok_or(PacerError::TaskNotFound(self.id()))
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.dispatcher.status()
    }

    pub fn concurrency(&self) -> usize {
        self.inner.dispatcher.concurrency()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Resolves when the task completes, pauses or stops; `Err` on a dispatcher fault.
    pub async fn start(&self) -> Result<()> {
        self.ensure_alive()?;
        self.inner.dispatcher.start().await
    }

    pub async fn pause(&self) -> Result<()> {
        self.ensure_alive()?;
        self.inner.dispatcher.pause().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.ensure_alive()?;
        self.inner.dispatcher.resume().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.ensure_alive()?;
        self.inner.dispatcher.stop().await
    }

    /// Stop the task and delete it together with all of its jobs.
    pub async fn destroy(&self) -> Result<()> {
        self.ensure_alive()?;
        self.inner.dispatcher.stop().await?;

        let removed = self.inner.storage.delete_jobs_by_task(self.id()).await?;
        self.inner.storage.delete_task(self.id()).await?;
        self.inner.destroyed.store(true, Ordering::SeqCst);
        info!(task_id = %self.id(), jobs = removed, "task destroyed");
        Ok(())
    }

    pub async fn get_progress(&self) -> Result<TaskProgress> {
        self.ensure_alive()?;
        self.inner.dispatcher.get_progress().await
    }

    /// Jobs in creation order, e.g. `JobQuery::with_status(JobStatus::Failed)` for an audit.
    pub async fn get_results(&self, query: JobQuery) -> Result<Vec<Job>> {
        self.ensure_alive()?;
        Ok(self.inner.storage.get_jobs_by_task(self.id(), query).await?)
    }

    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.events().on(kind, callback)
    }

    pub fn on_any<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.events().on_any(callback)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.dispatcher.events().subscribe()
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(PacerError::Destroyed(self.id()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobStatus, TaskConfig};
    use crate::impls::{FnSource, InMemoryStorage};
    use crate::ports::{SystemClock, TaskSource};
    use serde_json::json;
    use ulid::Ulid;

    async fn task(items: Vec<serde_json::Value>) -> (Task, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let source = FnSource::deterministic(items.clone(), |input, _| async move { Ok(input) });
        let meta = TaskMeta::new(
            TaskId::from_ulid(Ulid::new()),
            "t",
            source.kind(),
            None,
            TaskConfig::default(),
            chrono::Utc::now(),
        );
        let dispatcher = Dispatcher::new(&meta, storage.clone(), Arc::new(source), Arc::new(SystemClock));
        dispatcher.prepare(&meta, items).await.unwrap();
        (Task::new(dispatcher, storage.clone()), storage)
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let (task, _) = task(vec![json!(1), json!(2)]).await;
        let mut rx = task.subscribe();

        task.start().await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(crate::emitter::Event::kind(&event));
        }
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::JobStart).count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::JobComplete).count(), 2);
        assert_eq!(kinds.last(), Some(&EventKind::Completed));
    }

    #[tokio::test]
    async fn results_can_be_filtered() {
        let (task, _) = task(vec![json!("a"), json!("b"), json!("c")]).await;
        task.start().await.unwrap();

        let done = task
            .get_results(JobQuery::with_status(JobStatus::Completed))
            .await
            .unwrap();
        assert_eq!(done.len(), 3);
        assert!(task
            .get_results(JobQuery::with_status(JobStatus::Failed))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(task.meta().await.unwrap().completed_jobs, 3);
    }

    #[tokio::test]
    async fn destroyed_task_rejects_calls() {
        let (task, storage) = task(vec![json!(1)]).await;
        let id = task.id();

        task.destroy().await.unwrap();

        assert!(task.is_destroyed());
        assert!(storage.get_task(id).await.unwrap().is_none());
        assert_eq!(storage.get_job_counts(id).await.unwrap().total, 0);
        assert!(matches!(task.start().await, Err(PacerError::Destroyed(t)) if t == id));
        assert!(matches!(task.destroy().await, Err(PacerError::Destroyed(_))));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let (task, _) = task(vec![json!(1)]).await;
        let other = task.clone();

        task.start().await.unwrap();
        assert_eq!(other.status(), TaskStatus::Completed);
    }
}
