use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use processflow::api::{router, schema::ProcessSchema, ApiState};
use processflow::processes::{
    ClientDispatcher, InMemoryProcessRepo, JobQueue, NewJob, ResourcePolicy, ResourceRegistry,
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

/// Connects to `TEST_DATABASE_URL`, migrates and truncates.
/// Returns `None` when no test database is configured.
#[allow(dead_code)]
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping database test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE process_jobs, client_processes CASCADE")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

/// Queue double that records pushed jobs.
#[derive(Default)]
pub struct RecordingQueue {
    pub jobs: Mutex<Vec<NewJob>>,
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn push(&self, job: NewJob) -> anyhow::Result<Uuid> {
        self.jobs.lock().push(job);
        Ok(Uuid::new_v4())
    }
}

/// Queue double that is always down.
#[allow(dead_code)]
pub struct FailingQueue;

#[async_trait]
impl JobQueue for FailingQueue {
    async fn push(&self, _job: NewJob) -> anyhow::Result<Uuid> {
        anyhow::bail!("queue unavailable")
    }
}

#[allow(dead_code)]
pub fn registry() -> ResourceRegistry {
    ResourceRegistry::new(ResourcePolicy {
        timeout: Some(60),
        tries: Some(3),
    })
    .with_policy(
        "articles",
        Some(processflow::processes::Operation::Create),
        ResourcePolicy {
            timeout: Some(30),
            tries: Some(3),
        },
    )
}

#[allow(dead_code)]
pub fn dispatcher(repo: Arc<InMemoryProcessRepo>, queue: Arc<dyn JobQueue>) -> ClientDispatcher {
    ClientDispatcher::new(repo, queue, Arc::new(registry()), "v1", "default")
}

#[allow(dead_code)]
pub struct TestApp {
    pub app: axum::Router,
    pub repo: Arc<InMemoryProcessRepo>,
    pub queue: Arc<RecordingQueue>,
}

#[allow(dead_code)]
pub fn test_app() -> TestApp {
    let repo = Arc::new(InMemoryProcessRepo::new());
    let queue = Arc::new(RecordingQueue::default());

    let state = ApiState {
        processes: repo.clone(),
        dispatcher: dispatcher(repo.clone(), queue.clone()),
        schema: ProcessSchema::new("queue-jobs", "http://localhost/api/v1"),
    };

    TestApp {
        app: router(state),
        repo,
        queue,
    }
}
