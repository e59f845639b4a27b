use processflow::api::{self, schema::ProcessSchema};
use processflow::config;
use processflow::db;
use processflow::telemetry;

use processflow::processes::retry::{execution_for_failure, next_delay_seconds, RetryConfig};
use processflow::processes::{
    AsynchronousProcess, ClientDispatcher, ErrorCode, ExecutionContext, LeaseQueue, PgJobQueue,
    PgProcessRepo, ProcessError, ProcessRepository, ProcessRunner, QueuedJob,
};

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod handlers;
use handlers::{build_registry, HandlerRegistry, JobContext, JobError};

struct Worker {
    queue: Arc<dyn LeaseQueue>,
    runner: ProcessRunner,
    handlers: Arc<HandlerRegistry>,
    ctx: JobContext,
    queue_name: String,
    lease_seconds: i64,
    reap_interval: Duration,
    retry: RetryConfig,
}

impl Worker {
    fn worker_id(&self) -> &str {
        &self.ctx.worker_id
    }

    async fn run(self) -> anyhow::Result<()> {
        let mut last_reap_at: Option<Instant> = None;

        loop {
            // reclaim jobs from dead workers on a fixed interval, not every poll
            if last_reap_at.map_or(true, |at| at.elapsed() >= self.reap_interval) {
                let reaped = self.queue.reap_expired_locks().await?;
                last_reap_at = Some(Instant::now());
                if reaped > 0 {
                    tracing::info!(
                        worker_id = %self.worker_id(),
                        reaped,
                        "reaped expired locks"
                    );
                }
            }

            let Some(job) = self
                .queue
                .lease_one_job(&self.queue_name, self.worker_id(), self.lease_seconds)
                .await?
            else {
                tokio::time::sleep(Duration::from_millis(250)).await;
                continue;
            };

            tracing::debug!(
                worker_id = %self.worker_id(),
                job_id = %job.id,
                process_id = %job.client_process_id,
                job_type = %job.job_type,
                "leased job"
            );

            // a failed write leaves the lease to expire; the reaper requeues it
            if let Err(e) = self.execute(&job).await {
                tracing::error!(
                    job_id = %job.id,
                    error = %e,
                    "job execution could not be recorded"
                );
            }
        }
    }

    async fn execute(&self, job: &QueuedJob) -> anyhow::Result<()> {
        let process = match self.runner.find(job.client_process_id).await {
            Ok(process) => process,
            Err(ProcessError::NotFound(id)) => {
                tracing::warn!(
                    job_id = %job.id,
                    process_id = %id,
                    "process is gone, dropping job"
                );
                self.queue.complete(job.id, self.worker_id()).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if !process.is_pending() {
            tracing::debug!(
                job_id = %job.id,
                process_id = %process.id(),
                status = process.status().as_str(),
                "process already terminal, completing job"
            );
            self.queue.complete(job.id, self.worker_id()).await?;
            return Ok(());
        }

        let started = Instant::now();
        let remaining = process
            .timeout_at()
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));

        // a handler outliving its lease would race the reaper's requeue
        let lease = Duration::from_secs(self.lease_seconds.max(1).unsigned_abs());
        let deadline = Some(remaining.map_or(lease, |left| left.min(lease)));

        let result = if remaining == Some(Duration::ZERO) {
            Err(JobError::new(
                ErrorCode::Timeout,
                "dispatch deadline passed before execution",
            ))
        } else {
            match self.handlers.handler_for(&job.job_type) {
                Some(entry) => entry.run(job, &self.ctx, deadline).await,
                None => Err(JobError::new(
                    ErrorCode::UnknownJobType,
                    format!("no handler for job_type={}", job.job_type),
                )),
            }
        };

        let finished = Utc::now();
        let execution = match result {
            Ok(Some(resource_id)) => ExecutionContext::succeeded()
                .with_resource_id(resource_id)
                .finished_at(finished),
            Ok(None) => ExecutionContext::succeeded().finished_at(finished),
            Err(err) => execution_for_failure(&process, err.code, err.message, finished),
        };

        let updated = match self.runner.record_attempt(process.id(), &execution).await {
            Ok(updated) => updated,
            Err(ProcessError::ConcurrentModification(id)) => {
                tracing::warn!(
                    job_id = %job.id,
                    process_id = %id,
                    "process changed during attempt, requeueing"
                );
                self.queue
                    .reschedule(job.id, self.worker_id(), Utc::now())
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(
            job_id = %job.id,
            process_id = %updated.id(),
            attempts = updated.attempts(),
            latency_ms = started.elapsed().as_millis() as u64,
            "attempt recorded"
        );

        if updated.is_pending() {
            let delay =
                next_delay_seconds(updated.attempts(), &self.retry, &mut rand::thread_rng());
            let run_at = Utc::now() + chrono::Duration::seconds(delay);
            self.queue
                .reschedule(job.id, self.worker_id(), run_at)
                .await?;
            tracing::info!(job_id = %job.id, delay_seconds = delay, "job rescheduled");
        } else {
            self.queue.complete(job.id, self.worker_id()).await?;
        }

        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let cfg = config::Config::from_env()?;
    let registry = Arc::new(cfg.registry()?);

    tracing::info!(
        worker_id = %cfg.worker_id,
        queue = %cfg.queue,
        lease_seconds = cfg.lease_seconds,
        reap_interval_ms = cfg.reap_interval_ms,
        api = %cfg.api_addr.as_deref().unwrap_or("disabled"),
        api_name = %cfg.api_name,
        migrate_on_startup = cfg.migrate_on_startup,
        "processflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let processes: Arc<dyn ProcessRepository> = Arc::new(PgProcessRepo::new(pool.clone()));
    let queue = PgJobQueue::new(pool.clone());

    // ---- API task ----
    let api_state = api::ApiState {
        processes: processes.clone(),
        dispatcher: ClientDispatcher::new(
            processes.clone(),
            Arc::new(queue.clone()),
            registry,
            cfg.api_name.clone(),
            cfg.queue.clone(),
        ),
        schema: ProcessSchema::new(cfg.jobs_resource.clone(), cfg.base_url.clone()),
    };
    let app = api::router(api_state);
    let api_addr = cfg.api_addr.clone();

    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("api listening on http://{addr}");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Worker loop task ----
    let worker = Worker {
        queue: Arc::new(queue),
        runner: ProcessRunner::new(processes),
        handlers: build_registry(),
        ctx: JobContext {
            db: pool.clone(),
            worker_id: cfg.worker_id.clone(),
        },
        queue_name: cfg.queue.clone(),
        lease_seconds: cfg.lease_seconds,
        reap_interval: Duration::from_millis(cfg.reap_interval_ms),
        retry: RetryConfig::default(),
    };
    let worker_handle = tokio::spawn(worker.run());

    tokio::select! {
        res = api_handle => res??,
        res = worker_handle => res??,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use handlers::{boxed, HandlerOptions};
    use parking_lot::Mutex;
    use processflow::processes::{
        ClientDispatch, ClientProcess, InMemoryProcessRepo, Operation, ProcessResult,
    };
    use serde_json::json;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    /// Lease queue double that records how each job was released.
    #[derive(Default)]
    struct RecordingLeases {
        completed: Mutex<Vec<Uuid>>,
        rescheduled: Mutex<Vec<(Uuid, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl LeaseQueue for RecordingLeases {
        async fn lease_one_job(
            &self,
            _queue: &str,
            _worker_id: &str,
            _lease_seconds: i64,
        ) -> anyhow::Result<Option<QueuedJob>> {
            Ok(None)
        }

        async fn reap_expired_locks(&self) -> anyhow::Result<u64> {
            Ok(0)
        }

        async fn complete(&self, job_id: Uuid, _worker_id: &str) -> anyhow::Result<bool> {
            self.completed.lock().push(job_id);
            Ok(true)
        }

        async fn reschedule(
            &self,
            job_id: Uuid,
            _worker_id: &str,
            next_run_at: DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            self.rescheduled.lock().push((job_id, next_run_at));
            Ok(true)
        }
    }

    /// Repository whose writes always lose to another writer.
    struct ContendedRepo(InMemoryProcessRepo);

    #[async_trait]
    impl ProcessRepository for ContendedRepo {
        async fn create(
            &self,
            id: Uuid,
            dispatch: &ClientDispatch,
        ) -> ProcessResult<ClientProcess> {
            self.0.create(id, dispatch).await
        }

        async fn find(&self, id: Uuid) -> ProcessResult<ClientProcess> {
            self.0.find(id).await
        }

        async fn update(&self, process: &ClientProcess) -> ProcessResult<()> {
            Err(ProcessError::ConcurrentModification(process.id()))
        }

        async fn amend(&self, process: &ClientProcess) -> ProcessResult<()> {
            Err(ProcessError::ConcurrentModification(process.id()))
        }

        async fn list(
            &self,
            api: &str,
            resource_type: &str,
            limit: i64,
        ) -> ProcessResult<Vec<ClientProcess>> {
            self.0.list(api, resource_type, limit).await
        }
    }

    /// `articles:create` succeeds with id 101 and flags that it ran,
    /// `articles:update` hits a dependency outage, `articles:delete` hangs.
    fn handlers() -> (Arc<HandlerRegistry>, Arc<AtomicBool>) {
        let ran = Arc::new(AtomicBool::new(false));
        let mut registry = HandlerRegistry::new();

        let flag = ran.clone();
        registry.register("articles:create", move |_job, _ctx| {
            flag.store(true, Ordering::SeqCst);
            boxed(async move { Ok(Some("101".to_string())) })
        });
        registry.register("articles:update", |_job, _ctx| {
            boxed(async move { Err(JobError::new(ErrorCode::DependencyDown, "db down")) })
        });
        registry.register_with_options(
            "articles:delete",
            |_job, _ctx| {
                boxed(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(None)
                })
            },
            HandlerOptions::new().timeout(Duration::from_secs(60)),
        );

        (Arc::new(registry), ran)
    }

    fn worker(
        repo: Arc<dyn ProcessRepository>,
        leases: Arc<RecordingLeases>,
        handlers: Arc<HandlerRegistry>,
    ) -> Worker {
        Worker {
            queue: leases,
            runner: ProcessRunner::new(repo),
            handlers,
            ctx: JobContext {
                db: PgPoolOptions::new()
                    .connect_lazy("postgres://localhost/unused")
                    .unwrap(),
                worker_id: "worker-test".into(),
            },
            queue_name: "default".into(),
            lease_seconds: 30,
            reap_interval: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }

    fn job_for(process_id: Uuid, job_type: &str) -> QueuedJob {
        let now = Utc::now();
        QueuedJob {
            id: Uuid::new_v4(),
            client_process_id: process_id,
            queue: "default".into(),
            job_type: job_type.into(),
            payload_json: json!({}),
            run_at: now,
            status: "running".into(),
            locked_by: Some("worker-test".into()),
            locked_at: Some(now),
            lock_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn articles(operation: Operation, tries: i32) -> ClientDispatch {
        let dispatch = ClientDispatch::new("v1", "articles", operation)
            .with_timeout(Some(60))
            .with_tries(Some(tries));
        match operation {
            Operation::Create => dispatch,
            _ => dispatch.with_resource_id("4"),
        }
    }

    #[tokio::test]
    async fn success_resolves_the_process_and_completes_the_job() {
        let repo = Arc::new(InMemoryProcessRepo::new());
        let leases = Arc::new(RecordingLeases::default());
        let (handlers, ran) = handlers();
        let worker = worker(repo.clone(), leases.clone(), handlers);

        let process = repo
            .create(Uuid::new_v4(), &articles(Operation::Create, 3))
            .await
            .unwrap();
        let job = job_for(process.id(), "articles:create");
        worker.execute(&job).await.unwrap();

        assert!(ran.load(Ordering::SeqCst));
        let stored = repo.find(process.id()).await.unwrap();
        assert!(stored.completed_at().is_some());
        assert!(!stored.failed());
        assert_eq!(stored.resource_id(), Some("101"));
        assert_eq!(*leases.completed.lock(), vec![job.id]);
        assert!(leases.rescheduled.lock().is_empty());
    }

    #[tokio::test]
    async fn passed_deadline_records_timeout_without_running_the_handler() {
        let repo = Arc::new(InMemoryProcessRepo::new());
        let leases = Arc::new(RecordingLeases::default());
        let (handlers, ran) = handlers();
        let worker = worker(repo.clone(), leases.clone(), handlers);

        let dispatch = articles(Operation::Create, 3)
            .dispatched_at(Utc::now() - chrono::Duration::seconds(120));
        let process = repo.create(Uuid::new_v4(), &dispatch).await.unwrap();
        let job = job_for(process.id(), "articles:create");
        worker.execute(&job).await.unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        let stored = repo.find(process.id()).await.unwrap();
        assert!(stored.failed());
        assert_eq!(stored.attempts(), 1);
        assert_eq!(*leases.completed.lock(), vec![job.id]);
        assert!(leases.rescheduled.lock().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_is_rescheduled_with_backoff() {
        let repo = Arc::new(InMemoryProcessRepo::new());
        let leases = Arc::new(RecordingLeases::default());
        let (handlers, _) = handlers();
        let worker = worker(repo.clone(), leases.clone(), handlers);

        let process = repo
            .create(Uuid::new_v4(), &articles(Operation::Update, 3))
            .await
            .unwrap();
        let job = job_for(process.id(), "articles:update");
        let before = Utc::now();
        worker.execute(&job).await.unwrap();

        let stored = repo.find(process.id()).await.unwrap();
        assert!(stored.is_pending());
        assert_eq!(stored.attempts(), 1);

        let rescheduled = leases.rescheduled.lock().clone();
        assert_eq!(rescheduled.len(), 1);
        assert_eq!(rescheduled[0].0, job.id);
        assert!(rescheduled[0].1 >= before + chrono::Duration::seconds(1));
        assert!(leases.completed.lock().is_empty());
    }

    #[tokio::test]
    async fn last_try_fails_the_process_and_completes_the_job() {
        let repo = Arc::new(InMemoryProcessRepo::new());
        let leases = Arc::new(RecordingLeases::default());
        let (handlers, _) = handlers();
        let worker = worker(repo.clone(), leases.clone(), handlers);

        let process = repo
            .create(Uuid::new_v4(), &articles(Operation::Update, 1))
            .await
            .unwrap();
        let job = job_for(process.id(), "articles:update");
        worker.execute(&job).await.unwrap();

        let stored = repo.find(process.id()).await.unwrap();
        assert!(stored.failed());
        assert_eq!(stored.attempts(), 1);
        assert_eq!(*leases.completed.lock(), vec![job.id]);
        assert!(leases.rescheduled.lock().is_empty());
    }

    #[tokio::test]
    async fn lost_write_requeues_the_job_immediately() {
        let repo = Arc::new(ContendedRepo(InMemoryProcessRepo::new()));
        let leases = Arc::new(RecordingLeases::default());
        let (handlers, _) = handlers();
        let worker = worker(repo.clone(), leases.clone(), handlers);

        let process = repo
            .create(Uuid::new_v4(), &articles(Operation::Create, 3))
            .await
            .unwrap();
        let job = job_for(process.id(), "articles:create");
        worker.execute(&job).await.unwrap();
        let after = Utc::now();

        let rescheduled = leases.rescheduled.lock().clone();
        assert_eq!(rescheduled.len(), 1);
        assert_eq!(rescheduled[0].0, job.id);
        assert!(rescheduled[0].1 <= after);
        assert!(leases.completed.lock().is_empty());
    }

    #[tokio::test]
    async fn job_for_a_removed_process_is_dropped() {
        let repo = Arc::new(InMemoryProcessRepo::new());
        let leases = Arc::new(RecordingLeases::default());
        let (handlers, ran) = handlers();
        let worker = worker(repo.clone(), leases.clone(), handlers);

        let process = repo
            .create(Uuid::new_v4(), &articles(Operation::Create, 3))
            .await
            .unwrap();
        repo.remove(process.id());

        let job = job_for(process.id(), "articles:create");
        worker.execute(&job).await.unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(*leases.completed.lock(), vec![job.id]);
        assert!(leases.rescheduled.lock().is_empty());
    }

    #[tokio::test]
    async fn terminal_process_completes_the_job_without_another_attempt() {
        let repo = Arc::new(InMemoryProcessRepo::new());
        let leases = Arc::new(RecordingLeases::default());
        let (handlers, ran) = handlers();
        let worker = worker(repo.clone(), leases.clone(), handlers);

        let mut process = repo
            .create(Uuid::new_v4(), &articles(Operation::Create, 3))
            .await
            .unwrap();
        process.processed(&ExecutionContext::succeeded().with_resource_id("7"));
        repo.update(&process).await.unwrap();

        let job = job_for(process.id(), "articles:create");
        worker.execute(&job).await.unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(repo.find(process.id()).await.unwrap().attempts(), 1);
        assert_eq!(*leases.completed.lock(), vec![job.id]);
    }

    #[tokio::test]
    async fn handler_is_cut_off_when_the_lease_runs_out() {
        let repo = Arc::new(InMemoryProcessRepo::new());
        let leases = Arc::new(RecordingLeases::default());
        let (handlers, _) = handlers();
        let mut worker = worker(repo.clone(), leases.clone(), handlers);
        worker.lease_seconds = 1;

        let process = repo
            .create(Uuid::new_v4(), &articles(Operation::Delete, 3))
            .await
            .unwrap();
        let job = job_for(process.id(), "articles:delete");

        let started = Instant::now();
        worker.execute(&job).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));

        let stored = repo.find(process.id()).await.unwrap();
        assert!(stored.is_pending());
        assert_eq!(stored.attempts(), 1);
        assert_eq!(leases.rescheduled.lock().len(), 1);
    }
}
