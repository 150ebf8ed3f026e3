//! FnSource - クロージャから TaskSource を組み立てる
//!
//! 小さなタスクやテストのために、trait を実装せずに済むようにします。
//!
//! # 使用例
//! ```ignore
//! let source = FnSource::deterministic(vec![json!("a"), json!("bb")], |input, _ctx| async move {
//!     Ok(json!(input.as_str().map(str::len)))
//! });
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;

use crate::domain::{JobError, TaskKind};
use crate::ports::{JobContext, TaskData, TaskSource};

type HandlerFn = Arc<
    dyn Fn(serde_json::Value, JobContext) -> BoxFuture<'static, Result<serde_json::Value, JobError>>
        + Send
        + Sync,
>;
type StreamFn = Arc<dyn Fn() -> BoxStream<'static, serde_json::Value> + Send + Sync>;
type ClassifierFn = Arc<dyn Fn(&JobError) -> bool + Send + Sync>;

enum FnData {
    Items(Vec<serde_json::Value>),
    Stream(StreamFn),
}

/// Closure-backed [`TaskSource`].
#[derive(Clone)]
pub struct FnSource {
    data: Arc<FnData>,
    key: Option<String>,
    handler: HandlerFn,
    retryable: Option<ClassifierFn>,
    rate_limited: Option<ClassifierFn>,
}

fn boxed_handler<F, Fut>(handler: F) -> HandlerFn
where
    F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
{
    Arc::new(move |input, ctx| handler(input, ctx).boxed())
}

impl FnSource {
    /// Finite input set known up front.
    pub fn deterministic<F, Fut>(items: Vec<serde_json::Value>, handler: F) -> Self
    where
        F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
    {
        Self {
            data: Arc::new(FnData::Items(items)),
            key: None,
            handler: boxed_handler(handler),
            retryable: None,
            rate_limited: None,
        }
    }

    /// Inputs pulled from a stream. `make_stream` is called each time the task
    /// starts draining, so a resumed task re-reads the source from the top.
    pub fn dynamic<M, S, F, Fut>(key: impl Into<String>, make_stream: M, handler: F) -> Self
    where
        M: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = serde_json::Value> + Send + 'static,
        F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
    {
        Self {
            data: Arc::new(FnData::Stream(Arc::new(move || make_stream().boxed()))),
            key: Some(key.into()),
            handler: boxed_handler(handler),
            retryable: None,
            rate_limited: None,
        }
    }

    /// Explicit identity (also usable for deterministic sources).
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_retryable<C>(mut self, classify: C) -> Self
    where
        C: Fn(&JobError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(classify));
        self
    }

    pub fn with_rate_limited<C>(mut self, classify: C) -> Self
    where
        C: Fn(&JobError) -> bool + Send + Sync + 'static,
    {
        self.rate_limited = Some(Arc::new(classify));
        self
    }
}

#[async_trait]
impl TaskSource for FnSource {
    fn kind(&self) -> TaskKind {
        match *self.data {
            FnData::Items(_) => TaskKind::Deterministic,
            FnData::Stream(_) => TaskKind::Dynamic,
        }
    }

    fn data(&self) -> TaskData {
        match &*self.data {
            FnData::Items(items) => TaskData::Items(items.clone()),
            FnData::Stream(make) => TaskData::Stream(make()),
        }
    }

    fn task_key(&self) -> Option<String> {
        self.key.clone()
    }

    async fn handle(
        &self,
        input: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, JobError> {
        (self.handler)(input, ctx).await
    }

    fn is_retryable(&self, error: &JobError) -> bool {
        match &self.retryable {
            Some(classify) => classify(error),
            None => error.is_transient(),
        }
    }

    fn is_rate_limited(&self, error: &JobError) -> bool {
        match &self.rate_limited {
            Some(classify) => classify(error),
            None => error.is_rate_limit_signal(),
        }
    }
}
