use processflow::processes::{ErrorCode, QueuedJob};
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use std::{any::Any, collections::HashMap, pin::Pin, sync::Arc, time::Duration};
use tokio::time::timeout;
use uuid::Uuid;

pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Handler result: the id of the resource the job produced, if it produced one.
pub type HandlerResult = Result<Option<String>, JobError>;

type HandlerFn =
    dyn for<'a> Fn(&'a QueuedJob, &'a JobContext) -> BoxFuture<'a, HandlerResult> + Send + Sync;

#[derive(Debug)]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,
}

impl JobError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Clone)]
pub struct JobContext {
    pub db: PgPool,
    pub worker_id: String,
}

#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<HandlerFn>,
    pub timeout: Option<Duration>,
}

/// Handlers keyed by job type (`"{resource_type}:{operation}"`).
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, job_type: &str, handler: F)
    where
        F: for<'a> Fn(&'a QueuedJob, &'a JobContext) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.register_with_options(job_type, handler, HandlerOptions::new());
    }

    pub fn register_with_options<F>(&mut self, job_type: &str, handler: F, opts: HandlerOptions)
    where
        F: for<'a> Fn(&'a QueuedJob, &'a JobContext) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(
            job_type.to_string(),
            HandlerEntry {
                handler: Arc::new(handler),
                timeout: opts.timeout,
            },
        );
    }

    pub fn handler_for(&self, job_type: &str) -> Option<HandlerEntry> {
        self.handlers.get(job_type).cloned()
    }
}

#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

impl HandlerEntry {
    /// Run the handler, bounded by the shorter of the handler's own timeout
    /// and `deadline` (the worker's remaining time for this attempt).
    ///
    /// The handler runs on its own task: a panic is reported as
    /// `ErrorCode::Panic` and a timed-out handler is aborted.
    pub async fn run(
        &self,
        job: &QueuedJob,
        ctx: &JobContext,
        deadline: Option<Duration>,
    ) -> HandlerResult {
        let limit = match (self.timeout, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let handler = self.handler.clone();
        let (job, ctx) = (job.clone(), ctx.clone());
        let mut task = tokio::spawn(async move { handler(&job, &ctx).await });

        let joined = match limit {
            Some(dur) => match timeout(dur, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(JobError::new(
                        ErrorCode::Timeout,
                        format!("handler timeout after {}ms", dur.as_millis()),
                    ));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(JobError::new(
                ErrorCode::Panic,
                format!("handler panicked: {}", panic_message(e.into_panic())),
            )),
            Err(e) => Err(JobError::new(ErrorCode::Unknown, e.to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(_) => "non-string panic payload".to_string(),
    }
}

/// The request document the API enqueued for the job.
#[derive(Deserialize)]
struct ResourceDocument {
    data: ResourceData,
}

#[derive(Deserialize)]
struct ResourceData {
    id: Option<String>,
    #[serde(default)]
    attributes: Value,
}

fn parse_payload<T: for<'de> Deserialize<'de>>(job: &QueuedJob) -> Result<T, JobError> {
    serde_json::from_value(job.payload_json.clone())
        .map_err(|e| JobError::new(ErrorCode::BadPayload, e.to_string()))
}

pub(crate) fn boxed<'a, T>(
    fut: impl std::future::Future<Output = T> + Send + 'a,
) -> BoxFuture<'a, T> {
    Box::pin(fut)
}

fn create_resource<'a>(job: &'a QueuedJob, _ctx: &'a JobContext) -> BoxFuture<'a, HandlerResult> {
    boxed(async move {
        let doc: ResourceDocument = parse_payload(job)?;
        if !doc.data.attributes.is_null() && !doc.data.attributes.is_object() {
            return Err(JobError::new(ErrorCode::BadPayload, "attributes must be an object"));
        }
        let id = doc.data.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Some(id))
    })
}

fn change_resource<'a>(job: &'a QueuedJob, _ctx: &'a JobContext) -> BoxFuture<'a, HandlerResult> {
    boxed(async move {
        let doc: ResourceDocument = parse_payload(job)?;
        match doc.data.id {
            Some(_) => Ok(None),
            None => Err(JobError::new(ErrorCode::ResourceMissing, "payload has no resource id")),
        }
    })
}

pub fn build_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();

    // Demo handlers. Replace these with your real handlers.
    for resource_type in ["articles", "comments"] {
        registry.register_with_options(
            &format!("{resource_type}:create"),
            create_resource,
            HandlerOptions::new().timeout(Duration::from_secs(10)),
        );
        registry.register(&format!("{resource_type}:update"), change_resource);
        registry.register(&format!("{resource_type}:delete"), change_resource);
    }

    registry.register_with_options(
        "flaky:create",
        |_job, _ctx| {
            boxed(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Err(JobError::new(ErrorCode::DependencyDown, "simulated outage"))
            })
        },
        HandlerOptions::new().timeout(Duration::from_secs(5)),
    );

    Arc::new(registry)
}
