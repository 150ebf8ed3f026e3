//! InMemoryStorage - 開発用・テスト用の StorageAdapter
//!
//! # 実装詳細
//! - 状態全体を 1 つの `tokio::sync::Mutex` で保護（`claim_jobs` のアトミック性はこれで担保）
//! - タスクごとにジョブ ID を作成順で保持し、claim もこの順序で行う
//! - `scheduled_at` の判定は注入された Clock で行う（FixedClock でテスト可能）
//! - `close()` 以降はすべて `StorageError::Closed`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};

use crate::domain::{Job, JobCounts, JobId, JobQuery, JobStatus, TaskId, TaskMeta, TaskUpdate};
use crate::ports::{Clock, StorageAdapter, StorageError, SystemClock};

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<TaskId, TaskMeta>,
    jobs: HashMap<JobId, Job>,

    /// Job ids per task, in creation order.
    order: HashMap<TaskId, Vec<JobId>>,

    closed: bool,
}

impl MemoryState {
    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job, StorageError> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(StorageError::JobNotFound(job_id))
    }

    fn jobs_of(&self, task_id: TaskId) -> impl Iterator<Item = &Job> {
        self.order
            .get(&task_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.jobs.get(id))
    }

    fn ids_with_status(&self, task_id: TaskId, status: JobStatus) -> Vec<JobId> {
        self.jobs_of(task_id)
            .filter(|job| job.status == status)
            .map(|job| job.id)
            .collect()
    }
}

/// In-memory reference adapter.
///
/// # 使用例
/// ```ignore
/// let storage = Arc::new(InMemoryStorage::new());
/// let hub = HubBuilder::new(storage).build().await?;
/// ```
pub struct InMemoryStorage {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }

    async fn open(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(StorageError::Closed);
        }
        Ok(state)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_active(job: &Job, to: JobStatus) -> Result<(), StorageError> {
    if job.status != JobStatus::Active {
        return Err(StorageError::InvalidTransition {
            job_id: job.id,
            from: job.status,
            to,
        });
    }
    Ok(())
}

#[async_trait]
impl StorageAdapter for InMemoryStorage {
    async fn initialize(&self) -> Result<(), StorageError> {
        self.open().await.map(|_| ())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.state.lock().await.closed = true;
        Ok(())
    }

    async fn create_task(&self, meta: &TaskMeta) -> Result<(), StorageError> {
        let mut state = self.open().await?;
        if state.tasks.contains_key(&meta.id) {
            return Err(StorageError::TaskExists(meta.id));
        }
        state.tasks.insert(meta.id, meta.clone());
        state.order.entry(meta.id).or_default();
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskMeta>, StorageError> {
        let state = self.open().await?;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn update_task(
        &self,
        task_id: TaskId,
        update: TaskUpdate,
    ) -> Result<TaskMeta, StorageError> {
        let now = self.clock.now();
        let mut state = self.open().await?;
        let meta = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StorageError::TaskNotFound(task_id))?;
        meta.apply(&update, now);
        Ok(meta.clone())
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<(), StorageError> {
        let mut state = self.open().await?;
        state.tasks.remove(&task_id);
        Ok(())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskMeta>, StorageError> {
        let state = self.open().await?;
        let mut tasks: Vec<TaskMeta> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|meta| meta.created_at);
        Ok(tasks)
    }

    async fn create_jobs(&self, jobs: Vec<Job>) -> Result<usize, StorageError> {
        let mut state = self.open().await?;
        let mut inserted = 0;
        for job in jobs {
            if state.jobs.contains_key(&job.id) {
                continue;
            }
            state.order.entry(job.task_id).or_default().push(job.id);
            state.jobs.insert(job.id, job);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StorageError> {
        let state = self.open().await?;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn get_jobs_by_task(
        &self,
        task_id: TaskId,
        query: JobQuery,
    ) -> Result<Vec<Job>, StorageError> {
        let state = self.open().await?;
        let matching = state
            .jobs_of(task_id)
            .filter(|job| query.matches(job))
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matching)
    }

    async fn get_job_counts(&self, task_id: TaskId) -> Result<JobCounts, StorageError> {
        let state = self.open().await?;
        let mut counts = JobCounts::default();
        for job in state.jobs_of(task_id) {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
            counts.total += 1;
        }
        Ok(counts)
    }

    async fn claim_jobs(&self, task_id: TaskId, limit: usize) -> Result<Vec<Job>, StorageError> {
        let now = self.clock.now();
        let mut state = self.open().await?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let ids: Vec<JobId> = state
            .jobs_of(task_id)
            .filter(|job| job.is_claimable(now))
            .take(limit)
            .map(|job| job.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let job = state.job_mut(id)?;
            job.start_attempt(now);
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete_job(
        &self,
        job_id: JobId,
        output: serde_json::Value,
    ) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut state = self.open().await?;
        let job = state.job_mut(job_id)?;
        ensure_active(job, JobStatus::Completed)?;
        job.mark_completed(output, now);
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: JobId,
        error: &str,
        can_retry: bool,
        retry_after: Option<Duration>,
    ) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut state = self.open().await?;
        let job = state.job_mut(job_id)?;
        if can_retry {
            ensure_active(job, JobStatus::Pending)?;
            let scheduled_at = retry_after
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d);
            job.schedule_retry(error.to_string(), scheduled_at);
        } else {
            ensure_active(job, JobStatus::Failed)?;
            job.mark_failed(error.to_string(), now);
        }
        Ok(())
    }

    async fn reset_active_jobs(&self, task_id: TaskId) -> Result<usize, StorageError> {
        let mut state = self.open().await?;
        let ids = state.ids_with_status(task_id, JobStatus::Active);
        for id in &ids {
            state.job_mut(*id)?.requeue();
        }
        Ok(ids.len())
    }

    async fn reset_failed_jobs(&self, task_id: TaskId) -> Result<usize, StorageError> {
        let mut state = self.open().await?;
        let ids = state.ids_with_status(task_id, JobStatus::Failed);
        for id in &ids {
            state.job_mut(*id)?.reset();
        }
        Ok(ids.len())
    }

    async fn delete_jobs_by_task(&self, task_id: TaskId) -> Result<usize, StorageError> {
        let mut state = self.open().await?;
        let ids = state.order.remove(&task_id).unwrap_or_default();
        for id in &ids {
            state.jobs.remove(id);
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskConfig, TaskKind, TaskStatus};
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use serde_json::json;
    use ulid::Ulid;

    fn task_id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    fn jobs(task_id: TaskId, n: u64) -> Vec<Job> {
        (0..n)
            .map(|i| Job::new(JobId::from_ulid(Ulid::new()), task_id, i, json!(i), Utc::now()))
            .collect()
    }

    async fn seeded(n: u64) -> (InMemoryStorage, TaskId, Vec<Job>) {
        let storage = InMemoryStorage::new();
        let id = task_id();
        let meta = TaskMeta::new(
            id,
            "t",
            TaskKind::Deterministic,
            None,
            TaskConfig::default(),
            Utc::now(),
        );
        storage.create_task(&meta).await.unwrap();
        let js = jobs(id, n);
        storage.create_jobs(js.clone()).await.unwrap();
        (storage, id, js)
    }

    #[tokio::test]
    async fn create_jobs_ignores_existing_ids() {
        let (storage, id, js) = seeded(3).await;

        let mut again = js.clone();
        again.extend(jobs(id, 1));
        let inserted = storage.create_jobs(again).await.unwrap();

        assert_eq!(inserted, 1);
        assert_eq!(storage.get_job_counts(id).await.unwrap().total, 4);
    }

    #[tokio::test]
    async fn claim_respects_limit_and_creation_order() {
        let (storage, id, js) = seeded(5).await;

        let first = storage.claim_jobs(id, 2).await.unwrap();
        let second = storage.claim_jobs(id, 10).await.unwrap();

        let ids: Vec<JobId> = first.iter().chain(&second).map(|j| j.id).collect();
        let expected: Vec<JobId> = js.iter().map(|j| j.id).collect();
        assert_eq!(first.len(), 2);
        assert_eq!(ids, expected);
        assert!(first.iter().all(|j| j.status == JobStatus::Active && j.attempts == 1));
        assert!(storage.claim_jobs(id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_never_overlap() {
        let (storage, id, _) = seeded(100).await;
        let storage = Arc::new(storage);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = storage.claim_jobs(id, 3).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|j| j.id));
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 100);
        assert_eq!(unique.len(), 100);
    }

    #[tokio::test]
    async fn delayed_retry_becomes_claimable_when_clock_advances() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let storage = InMemoryStorage::with_clock(clock.clone());
        let id = task_id();
        storage.create_jobs(jobs(id, 1)).await.unwrap();

        let job = storage.claim_jobs(id, 1).await.unwrap().remove(0);
        storage
            .fail_job(job.id, "503", true, Some(Duration::from_secs(2)))
            .await
            .unwrap();

        assert!(storage.claim_jobs(id, 1).await.unwrap().is_empty());
        clock.advance(chrono::Duration::seconds(2));

        let again = storage.claim_jobs(id, 1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);
        assert_eq!(again[0].error.as_deref(), Some("503"));
    }

    #[tokio::test]
    async fn fail_without_retry_is_terminal() {
        let (storage, id, _) = seeded(1).await;
        let job = storage.claim_jobs(id, 1).await.unwrap().remove(0);

        storage.fail_job(job.id, "fatal", false, None).await.unwrap();

        let stored = storage.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("fatal"));
        assert!(storage.claim_jobs(id, 1).await.unwrap().is_empty());
    }

    #[rstest]
    #[case::complete_pending(false)]
    #[case::complete_completed(true)]
    #[tokio::test]
    async fn complete_requires_active(#[case] finish_first: bool) {
        let (storage, id, js) = seeded(1).await;
        if finish_first {
            storage.claim_jobs(id, 1).await.unwrap();
            storage.complete_job(js[0].id, json!(1)).await.unwrap();
        }

        let err = storage.complete_job(js[0].id, json!(2)).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { to: JobStatus::Completed, .. }));
    }

    #[tokio::test]
    async fn failed_job_cannot_be_failed_again() {
        let (storage, id, js) = seeded(1).await;
        storage.claim_jobs(id, 1).await.unwrap();
        storage.fail_job(js[0].id, "x", false, None).await.unwrap();

        let err = storage.fail_job(js[0].id, "y", true, None).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { from: JobStatus::Failed, .. }));
    }

    #[tokio::test]
    async fn reset_active_jobs_requeues_only_active() {
        let (storage, id, js) = seeded(4).await;
        storage.claim_jobs(id, 3).await.unwrap();
        storage.complete_job(js[0].id, json!(0)).await.unwrap();
        storage.fail_job(js[1].id, "x", false, None).await.unwrap();

        let reset = storage.reset_active_jobs(id).await.unwrap();
        let counts = storage.get_job_counts(id).await.unwrap();

        assert_eq!(reset, 1);
        assert_eq!(counts.active, 0);
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);

        // idempotent
        assert_eq!(storage.reset_active_jobs(id).await.unwrap(), 0);
        let requeued = storage.get_job(js[2].id).await.unwrap().unwrap();
        assert_eq!(requeued.attempts, 1);
    }

    #[tokio::test]
    async fn reset_failed_jobs_resets_attempts() {
        let (storage, id, js) = seeded(2).await;
        storage.claim_jobs(id, 2).await.unwrap();
        storage.fail_job(js[0].id, "x", false, None).await.unwrap();
        storage.complete_job(js[1].id, json!(1)).await.unwrap();

        assert_eq!(storage.reset_failed_jobs(id).await.unwrap(), 1);

        let job = storage.get_job(js[0].id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn get_jobs_by_task_filters_and_paginates() {
        let (storage, id, js) = seeded(6).await;
        storage.claim_jobs(id, 2).await.unwrap();
        storage.complete_job(js[0].id, json!(0)).await.unwrap();
        storage.complete_job(js[1].id, json!(1)).await.unwrap();

        let completed = storage
            .get_jobs_by_task(id, JobQuery::with_status(JobStatus::Completed))
            .await
            .unwrap();
        assert_eq!(completed.len(), 2);

        let page = storage
            .get_jobs_by_task(id, JobQuery::all().page(1, 3))
            .await
            .unwrap();
        let seqs: Vec<u64> = page.iter().map(|j| j.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn update_task_applies_partial_update() {
        let (storage, id, _) = seeded(0).await;

        let meta = storage
            .update_task(id, TaskUpdate::status(TaskStatus::Running))
            .await
            .unwrap();
        assert_eq!(meta.status, TaskStatus::Running);

        let err = storage
            .update_task(task_id(), TaskUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_task_is_rejected() {
        let (storage, id, _) = seeded(0).await;
        let meta = storage.get_task(id).await.unwrap().unwrap();
        assert_eq!(
            storage.create_task(&meta).await.unwrap_err(),
            StorageError::TaskExists(id)
        );
    }

    #[tokio::test]
    async fn delete_removes_task_and_jobs() {
        let (storage, id, _) = seeded(3).await;

        assert_eq!(storage.delete_jobs_by_task(id).await.unwrap(), 3);
        storage.delete_task(id).await.unwrap();

        assert!(storage.get_task(id).await.unwrap().is_none());
        assert_eq!(storage.get_job_counts(id).await.unwrap(), JobCounts::default());
    }

    #[tokio::test]
    async fn closed_storage_rejects_calls() {
        let (storage, id, _) = seeded(1).await;
        storage.close().await.unwrap();

        assert_eq!(storage.claim_jobs(id, 1).await.unwrap_err(), StorageError::Closed);
        assert_eq!(storage.list_tasks().await.unwrap_err(), StorageError::Closed);
    }
}
