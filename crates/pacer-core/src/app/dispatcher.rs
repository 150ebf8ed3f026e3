//! Dispatcher - 1 タスク分の claim ループ
//!
//! # フロー
//! 1. `available = concurrency - in_flight` だけ `claim_jobs`
//! 2. claim したジョブを JoinSet に spawn（ジョブごとに timeout + 子 CancellationToken）
//! 3. 完了したジョブをループ内で 1 件ずつ処理（AIMD → retry 判定 → storage → イベント）
//! 4. カウンタを storage から取り直して Progress を発行
//!
//! dynamic ソースは claim が足りないときだけ `batch_size` 件ずつ pull します。
//! AIMD の状態はこのループだけが更新します。

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::stream::{BoxStream, StreamExt};
use futures::FutureExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::aimd::AimdController;
use super::progress::ProgressTracker;
use super::retry::RetryPolicy;
use crate::domain::{
    Job, JobError, TaskConfig, TaskEvent, TaskId, TaskKind, TaskMeta, TaskProgress, TaskStatus,
    TaskUpdate,
};
use crate::emitter::EventEmitter;
use crate::error::{PacerError, Result};
use crate::ports::{Clock, JobContext, StorageAdapter, TaskData, TaskSource};

type Feed = Option<BoxStream<'static, serde_json::Value>>;

/// How the claim loop ended without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Completed,
    Paused,
    Stopped,
}

/// Result of one job execution, handed back to the loop.
struct Finished {
    job: Job,
    result: std::result::Result<serde_json::Value, JobError>,
    duration: Duration,
}

struct RunState {
    status: TaskStatus,
    stopping: bool,
    aimd: AimdController,
    tracker: ProgressTracker,
    token: CancellationToken,
}

pub struct Dispatcher {
    task_id: TaskId,
    config: TaskConfig,
    storage: Arc<dyn StorageAdapter>,
    source: Arc<dyn TaskSource>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    events: EventEmitter<TaskEvent>,
    state: Mutex<RunState>,
    wake: Notify,

    /// `true` while a claim loop is running.
    live: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        meta: &TaskMeta,
        storage: Arc<dyn StorageAdapter>,
        source: Arc<dyn TaskSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (live, _) = watch::channel(false);
        Self {
            task_id: meta.id,
            config: meta.config.clone(),
            storage,
            source,
            clock,
            retry: RetryPolicy::from_config(&meta.config.retry),
            events: EventEmitter::new(),
            state: Mutex::new(RunState {
                status: meta.status,
                stopping: false,
                aimd: AimdController::new(meta.config.concurrency.clone()),
                tracker: ProgressTracker::new(),
                token: CancellationToken::new(),
            }),
            wake: Notify::new(),
            live,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter<TaskEvent> {
        &self.events
    }

    pub fn status(&self) -> TaskStatus {
        self.state().status
    }

    pub fn concurrency(&self) -> usize {
        self.state().aimd.current()
    }

    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist a new task record and, for deterministic sources, its full job set.
    pub async fn prepare(&self, meta: &TaskMeta, items: Vec<serde_json::Value>) -> Result<TaskMeta> {
        self.storage.create_task(meta).await?;

        let now = self.clock.now();
        let jobs: Vec<Job> = items
            .into_iter()
            .enumerate()
            .map(|(index, input)| {
                let sequence = index as u64;
                let id = self.source.job_id(self.task_id, sequence, &input);
                Job::new(id, self.task_id, sequence, input, now)
            })
            .collect();
        let inserted = self.storage.create_jobs(jobs).await?;

        let counts = self.storage.get_job_counts(self.task_id).await?;
        let meta = self
            .storage
            .update_task(self.task_id, TaskUpdate::counters(&counts))
            .await?;
        debug!(task_id = %self.task_id, jobs = inserted, "task persisted");
        Ok(meta)
    }

    /// Idle -> Running. Runs until the task completes, pauses, stops or faults.
    ///
    /// Fails with `InvalidState` right away when a claim loop is already live.
    pub async fn start(&self) -> Result<()> {
        self.begin(&[TaskStatus::Idle], "start")?;
        self.run().await
    }

    /// Paused (or Idle) -> Running. Same contract as [`Dispatcher::start`].
    pub async fn resume(&self) -> Result<()> {
        self.begin(&[TaskStatus::Paused, TaskStatus::Idle], "resume")?;
        self.run().await
    }

    /// Stop claiming and wait for in-flight jobs to finish.
    pub async fn pause(&self) -> Result<()> {
        let live = {
            let mut state = self.state();
            match state.status {
                TaskStatus::Running | TaskStatus::Paused => state.status = TaskStatus::Paused,
                other => return Err(self.invalid(other, "pause")),
            }
            self.is_live()
        };
        info!(task_id = %self.task_id, "pausing task");

        if live {
            self.wake.notify_one();
            self.settled().await;
        } else {
            self.storage
                .update_task(self.task_id, TaskUpdate::status(TaskStatus::Paused))
                .await?;
        }
        Ok(())
    }

    /// Cancel in-flight jobs, wait for them, and return the task to Idle.
    pub async fn stop(&self) -> Result<()> {
        let (live, token) = {
            let mut state = self.state();
            if state.status == TaskStatus::Completed {
                return Ok(());
            }
            let live = self.is_live();
            if live {
                state.stopping = true;
            }
            state.status = TaskStatus::Idle;
            (live, state.token.clone())
        };
        info!(task_id = %self.task_id, "stopping task");

        if live {
            token.cancel();
            self.wake.notify_one();
            self.settled().await;
        } else {
            self.storage.reset_active_jobs(self.task_id).await?;
            self.storage
                .update_task(self.task_id, TaskUpdate::status(TaskStatus::Idle))
                .await?;
        }
        Ok(())
    }

    /// Stop for a process shutdown: in-flight jobs are cancelled and requeued
    /// like [`Dispatcher::stop`], but a running task is left Paused so the next
    /// process lists it as interrupted. No-op when no claim loop is live.
    pub async fn shutdown(&self) -> Result<()> {
        let token = {
            let mut state = self.state();
            if !self.is_live() {
                return Ok(());
            }
            state.stopping = true;
            state.status = TaskStatus::Paused;
            state.token.clone()
        };
        info!(task_id = %self.task_id, "shutting down task");

        token.cancel();
        self.wake.notify_one();
        self.settled().await;
        Ok(())
    }

    /// Completed -> Idle, after failed jobs were requeued.
    pub async fn reopen(&self) -> Result<()> {
        {
            let mut state = self.state();
            if state.status != TaskStatus::Completed || self.is_live() {
                return Ok(());
            }
            state.status = TaskStatus::Idle;
        }
        let update = TaskUpdate {
            completed_at: Some(None),
            ..TaskUpdate::status(TaskStatus::Idle)
        };
        self.storage.update_task(self.task_id, update).await?;
        info!(task_id = %self.task_id, "task reopened");
        Ok(())
    }

    pub async fn get_progress(&self) -> Result<TaskProgress> {
        let counts = self.storage.get_job_counts(self.task_id).await?;
        let state = self.state();
        Ok(state.tracker.snapshot(&counts, state.aimd.current()))
    }

    /// Wait until no claim loop is running.
    pub async fn settled(&self) {
        let mut rx = self.live.subscribe();
        let _ = rx.wait_for(|live| !*live).await;
    }

    fn invalid(&self, state: TaskStatus, action: &'static str) -> PacerError {
        PacerError::InvalidState {
            task_id: self.task_id,
            state,
            action,
        }
    }

    fn begin(&self, allowed: &[TaskStatus], action: &'static str) -> Result<()> {
        let mut state = self.state();
        if self.is_live() || !allowed.contains(&state.status) {
            return Err(self.invalid(state.status, action));
        }
        state.status = TaskStatus::Running;
        state.stopping = false;
        state.tracker.resume();
        self.live.send_replace(true);
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let exit = self.drive().await;
        self.state().tracker.suspend();

        let result = match exit {
            Ok(Exit::Completed) => self.finish().await,
            Ok(Exit::Paused) => self.settle_paused().await,
            Ok(Exit::Stopped) => self.settle_stopped().await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            self.fault(err).await;
        }

        self.live.send_replace(false);
        result
    }

    async fn drive(&self) -> Result<Exit> {
        let meta = self
            .storage
            .get_task(self.task_id)
            .await?
            .ok_or(PacerError::TaskNotFound(self.task_id))?;
        let mut update = TaskUpdate::status(TaskStatus::Running);
        if meta.started_at.is_none() {
            update.started_at = Some(self.clock.now());
        }
        self.storage.update_task(self.task_id, update).await?;
        info!(task_id = %self.task_id, kind = %meta.kind, "dispatcher started");

        let token = self.state().token.clone();
        let mut feed = self.open_feed(&meta);
        let mut next_sequence: u64 = 0;
        let mut in_flight: JoinSet<Finished> = JoinSet::new();
        let poll_interval = self.config.poll_interval();

        loop {
            let (halted, exit, concurrency) = {
                let state = self.state();
                let exit = if state.stopping {
                    Exit::Stopped
                } else {
                    Exit::Paused
                };
                (state.status != TaskStatus::Running, exit, state.aimd.current())
            };

            if halted && in_flight.is_empty() {
                return Ok(exit);
            }

            let mut pull = false;
            if !halted {
                let available = concurrency.saturating_sub(in_flight.len());
                if available > 0 {
                    let claimed = self.storage.claim_jobs(self.task_id, available).await?;
                    if !claimed.is_empty() {
                        debug!(task_id = %self.task_id, claimed = claimed.len(), available, "claimed jobs");
                    }
                    pull = claimed.len() < available && feed.is_some();

                    let idle = claimed.is_empty() && in_flight.is_empty() && feed.is_none();
                    for job in claimed {
                        self.launch(&mut in_flight, job, &token);
                    }

                    if idle {
                        let counts = self.storage.get_job_counts(self.task_id).await?;
                        if counts.is_drained() {
                            return Ok(Exit::Completed);
                        }
                    }
                }
            }

            tokio::select! {
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok(finished) => self.handle_finished(finished, &token).await?,
                        Err(err) => error!(task_id = %self.task_id, error = %err, "job task aborted"),
                    }
                }
                item = next_item(&mut feed), if pull => {
                    match item {
                        Some(first) => self.ingest(first, &mut feed, &mut next_sequence).await?,
                        None => {
                            feed = None;
                            debug!(task_id = %self.task_id, "source drained");
                        }
                    }
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(poll_interval), if !halted => {}
            }
        }
    }

    fn open_feed(&self, meta: &TaskMeta) -> Feed {
        if meta.kind == TaskKind::Deterministic {
            return None;
        }
        match self.source.data() {
            TaskData::Stream(stream) => Some(stream),
            TaskData::Items(items) => Some(futures::stream::iter(items).boxed()),
        }
    }

    /// Persist one batch of items pulled from a dynamic source.
    async fn ingest(
        &self,
        first: serde_json::Value,
        feed: &mut Feed,
        next_sequence: &mut u64,
    ) -> Result<()> {
        let batch_size = self.config.batch_size.max(1);
        let mut batch = vec![first];
        if let Some(stream) = feed.as_mut() {
            while batch.len() < batch_size {
                match stream.next().now_or_never() {
                    Some(Some(item)) => batch.push(item),
                    Some(None) => {
                        *feed = None;
                        break;
                    }
                    None => break,
                }
            }
        }

        let now = self.clock.now();
        let jobs: Vec<Job> = batch
            .into_iter()
            .map(|input| {
                let sequence = *next_sequence;
                *next_sequence += 1;
                let id = self.source.job_id(self.task_id, sequence, &input);
                Job::new(id, self.task_id, sequence, input, now)
            })
            .collect();
        let pulled = jobs.len();
        let inserted = self.storage.create_jobs(jobs).await?;
        debug!(task_id = %self.task_id, pulled, inserted, "ingested items");

        self.publish_progress().await
    }

    fn launch(&self, in_flight: &mut JoinSet<Finished>, job: Job, token: &CancellationToken) {
        self.events.emit(&TaskEvent::JobStart {
            job_id: job.id,
            attempt: job.attempts,
        });

        let source = self.source.clone();
        let cancellation = token.child_token();
        let ctx = JobContext {
            job_id: job.id,
            task_id: self.task_id,
            attempt: job.attempts,
            cancellation: cancellation.clone(),
        };
        let timeout = self.config.timeout();

        in_flight.spawn(async move {
            let started = Instant::now();
            let run = AssertUnwindSafe(source.handle(job.input.clone(), ctx)).catch_unwind();
            let result = match tokio::time::timeout(timeout, run).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(JobError::other("handler panicked")),
                Err(_) => {
                    cancellation.cancel();
                    Err(JobError::Timeout(timeout))
                }
            };
            Finished {
                job,
                result,
                duration: started.elapsed(),
            }
        });
    }

    async fn handle_finished(&self, finished: Finished, token: &CancellationToken) -> Result<()> {
        let Finished {
            job,
            result,
            duration,
        } = finished;

        match result {
            Ok(output) => {
                self.storage.complete_job(job.id, output.clone()).await?;
                let grown = {
                    let mut state = self.state();
                    state.tracker.record(duration);
                    state.aimd.on_success()
                };
                debug!(task_id = %self.task_id, job_id = %job.id, ?duration, "job completed");
                if let Some(concurrency) = grown {
                    info!(task_id = %self.task_id, concurrency, "concurrency increased");
                }
                self.events.emit(&TaskEvent::JobComplete {
                    job_id: job.id,
                    output,
                    duration,
                });
            }
            // stop() requeues these
            Err(JobError::Cancelled) if token.is_cancelled() => {
                debug!(task_id = %self.task_id, job_id = %job.id, "job cancelled by stop");
                return Ok(());
            }
            Err(error) => self.handle_failure(&job, error).await?,
        }

        self.publish_progress().await
    }

    async fn handle_failure(&self, job: &Job, error: JobError) -> Result<()> {
        let message = error.to_string();

        if self.source.is_rate_limited(&error) {
            let concurrency = self.state().aimd.on_rate_limited();
            info!(task_id = %self.task_id, job_id = %job.id, concurrency, "rate limited, concurrency decreased");
            self.events.emit(&TaskEvent::RateLimited {
                job_id: job.id,
                concurrency,
            });
        }

        if self.source.is_retryable(&error) && self.retry.should_retry(job.attempts) {
            let delay = self.retry.next_delay(job.attempts);
            self.storage
                .fail_job(job.id, &message, true, Some(delay))
                .await?;
            info!(
                task_id = %self.task_id,
                job_id = %job.id,
                attempt = job.attempts,
                ?delay,
                error = %message,
                "job retry scheduled"
            );
            self.events.emit(&TaskEvent::JobRetry {
                job_id: job.id,
                error: message,
                attempt: job.attempts,
                delay,
            });
        } else {
            self.storage.fail_job(job.id, &message, false, None).await?;
            warn!(
                task_id = %self.task_id,
                job_id = %job.id,
                attempts = job.attempts,
                error = %message,
                "job failed"
            );
            self.events.emit(&TaskEvent::JobFailed {
                job_id: job.id,
                error: message,
                attempts: job.attempts,
            });
        }
        Ok(())
    }

    /// Copy counters from one counts snapshot into the task record and emit Progress.
    async fn publish_progress(&self) -> Result<()> {
        let counts = self.storage.get_job_counts(self.task_id).await?;
        self.storage
            .update_task(self.task_id, TaskUpdate::counters(&counts))
            .await?;
        let progress = {
            let state = self.state();
            state.tracker.snapshot(&counts, state.aimd.current())
        };
        self.events.emit(&TaskEvent::Progress(progress));
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        let counts = self.storage.get_job_counts(self.task_id).await?;
        let update = TaskUpdate {
            completed_at: Some(Some(self.clock.now())),
            ..TaskUpdate::counters(&counts).with_status(TaskStatus::Completed)
        };
        self.storage.update_task(self.task_id, update).await?;

        let progress = {
            let mut state = self.state();
            state.status = TaskStatus::Completed;
            state.tracker.snapshot(&counts, state.aimd.current())
        };
        info!(
            task_id = %self.task_id,
            completed = counts.completed,
            failed = counts.failed,
            "task completed"
        );
        self.events.emit(&TaskEvent::Completed(progress));
        Ok(())
    }

    async fn settle_paused(&self) -> Result<()> {
        self.storage
            .update_task(self.task_id, TaskUpdate::status(TaskStatus::Paused))
            .await?;
        info!(task_id = %self.task_id, "task paused");
        Ok(())
    }

    async fn settle_stopped(&self) -> Result<()> {
        let requeued = self.storage.reset_active_jobs(self.task_id).await?;
        // Idle after stop(), Paused after shutdown()
        let status = {
            let mut state = self.state();
            state.stopping = false;
            state.token = CancellationToken::new();
            state.status
        };
        self.storage
            .update_task(self.task_id, TaskUpdate::status(status))
            .await?;
        info!(task_id = %self.task_id, requeued, %status, "task stopped");
        Ok(())
    }

    async fn fault(&self, err: &PacerError) {
        error!(task_id = %self.task_id, error = %err, "dispatcher fault");
        {
            let mut state = self.state();
            state.status = TaskStatus::Failed;
            state.stopping = false;
        }
        if let Err(persist) = self
            .storage
            .update_task(self.task_id, TaskUpdate::status(TaskStatus::Failed))
            .await
        {
            warn!(task_id = %self.task_id, error = %persist, "could not persist failed status");
        }
        self.events.emit(&TaskEvent::Error {
            message: err.to_string(),
        });
    }
}

async fn next_item(feed: &mut Feed) -> Option<serde_json::Value> {
    match feed {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
