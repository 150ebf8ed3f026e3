use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

use pacer_core::domain::{
    EventKind, HubConfig, JobError, JobQuery, RetryConfig, TaskEvent, TaskKind,
};
use pacer_core::impls::InMemoryStorage;
use pacer_core::observability;
use pacer_core::ports::{JobContext, TaskData, TaskSource};
use pacer_core::{CreateTaskOptions, HubBuilder};

#[derive(Debug, Deserialize)]
struct Greeting {
    name: String,
}

/// 最初の数回だけ 503 を返す handler
struct GreetingSource {
    names: Vec<&'static str>,
    remaining_failures: AtomicU32,
}

impl GreetingSource {
    fn new(names: Vec<&'static str>, failures: u32) -> Self {
        Self {
            names,
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl TaskSource for GreetingSource {
    fn kind(&self) -> TaskKind {
        TaskKind::Deterministic
    }

    fn data(&self) -> TaskData {
        TaskData::Items(self.names.iter().map(|name| json!({ "name": name })).collect())
    }

    async fn handle(
        &self,
        input: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, JobError> {
        let greeting: Greeting = serde_json::from_value(input)?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(JobError::http(503, format!("intentional failure (left={left})")));
        }

        Ok(json!(format!("Hello, {}! (attempt {})", greeting.name, ctx.attempt)))
    }
}

/// `PACER_CONFIG` に JSON ファイルのパスがあればそれを読む
fn load_config() -> Result<HubConfig, Box<dyn std::error::Error>> {
    match std::env::var("PACER_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)?;
            info!(path = %path, "loaded hub config");
            Ok(HubConfig::from_json(&raw)?)
        }
        Err(_) => {
            let mut config = HubConfig::default();
            config.defaults.retry = RetryConfig {
                base_delay_ms: 200,
                ..RetryConfig::default()
            };
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    observability::init();

    // (A) Hub を用意（storage は in-memory）
    let hub = HubBuilder::new(Arc::new(InMemoryStorage::new()))
        .config(load_config()?)
        .build()
        .await?;

    // (B) タスク作成（同じ名前 + 同じデータなら同じ task_id になる）
    let names = vec!["Alice", "Bob", "Carol", "Dave", "Eve", "Frank"];
    let task = hub
        .create_task(CreateTaskOptions::new("greetings", GreetingSource::new(names, 2)))
        .await?;
    println!("created: {}", task.id());

    // (C) イベント購読
    task.on(EventKind::Progress, |event| {
        if let TaskEvent::Progress(p) = event {
            println!(
                "progress: {}/{} (failed={}, concurrency={}, eta={:?})",
                p.completed + p.failed,
                p.total,
                p.failed,
                p.concurrency,
                p.estimated_remaining
            );
        }
    });
    task.on(EventKind::JobRetry, |event| {
        if let TaskEvent::JobRetry {
            job_id,
            error,
            delay,
            ..
        } = event
        {
            println!("retry: {job_id} after {delay:?} ({error})");
        }
    });
    task.on(EventKind::RateLimited, |event| {
        if let TaskEvent::RateLimited { concurrency, .. } = event {
            println!("rate limited: concurrency -> {concurrency}");
        }
    });

    // (D) 実行（全ジョブが解決するまで待つ）
    task.start().await?;

    for job in task.get_results(JobQuery::all()).await? {
        match (&job.output, &job.error) {
            (Some(output), _) => println!("[{}] {}", job.status, output),
            (None, Some(error)) => println!("[{}] {}", job.status, error),
            (None, None) => println!("[{}]", job.status),
        }
    }

    let progress = task.get_progress().await?;
    println!(
        "done: completed={} failed={} elapsed={:?}",
        progress.completed, progress.failed, progress.elapsed
    );

    hub.close().await?;
    Ok(())
}
