// crates/processflow/src/processes/queue.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// A job handed to the queue on behalf of a client process.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub client_process_id: Uuid,
    pub queue: String,
    pub job_type: String,
    pub payload_json: Value,
    pub run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedJob {
    pub id: Uuid,
    pub client_process_id: Uuid,
    pub queue: String,
    pub job_type: String,
    pub payload_json: Value,
    pub run_at: DateTime<Utc>,
    pub status: String,

    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub enum JobStatus {
    Queued,
    Running,
    Done,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
        }
    }
}

/// The dispatch side of a queue. Returns the queue's own job id.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: NewJob) -> anyhow::Result<Uuid>;
}

/// The worker side of a queue: leases and their release.
#[async_trait]
pub trait LeaseQueue: Send + Sync {
    /// Lease exactly one runnable job for this worker.
    /// No two workers can hold the same job at once.
    async fn lease_one_job(
        &self,
        queue: &str,
        worker_id: &str,
        lease_seconds: i64,
    ) -> anyhow::Result<Option<QueuedJob>>;

    /// Put jobs whose lease ran out (crashed worker) back in the queue.
    async fn reap_expired_locks(&self) -> anyhow::Result<u64>;

    /// Mark a job done and clear its lease. Only the lease holder can.
    async fn complete(&self, job_id: Uuid, worker_id: &str) -> anyhow::Result<bool>;

    /// Release the lease and requeue the job at `next_run_at`.
    async fn reschedule(
        &self,
        job_id: Uuid,
        worker_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;
}

/// Postgres-backed queue with leases (`FOR UPDATE SKIP LOCKED`).
///
/// Its rows are the queue engine's own bookkeeping; the client-facing state
/// lives in `client_processes`.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<QueuedJob>> {
        let job = sqlx::query_as::<_, QueuedJob>("SELECT * FROM process_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }
}

#[async_trait]
impl LeaseQueue for PgJobQueue {
    async fn lease_one_job(
        &self,
        queue: &str,
        worker_id: &str,
        lease_seconds: i64,
    ) -> anyhow::Result<Option<QueuedJob>> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, QueuedJob>(
            r#"
            WITH candidate AS (
              SELECT id
              FROM process_jobs
              WHERE queue = $1
                AND status = 'queued'
                AND run_at <= now()
              ORDER BY run_at ASC, created_at ASC
              FOR UPDATE SKIP LOCKED
              LIMIT 1
            )
            UPDATE process_jobs j
            SET status = 'running',
                locked_by = $2,
                locked_at = now(),
                lock_expires_at = now() + ($3::bigint * interval '1 second'),
                updated_at = now()
            FROM candidate
            WHERE j.id = candidate.id
            RETURNING j.*
            "#,
        )
        .bind(queue)
        .bind(worker_id)
        .bind(lease_seconds)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn reap_expired_locks(&self) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE process_jobs
            SET status = 'queued',
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE status = 'running'
              AND lock_expires_at IS NOT NULL
              AND lock_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE process_jobs
            SET status = 'done',
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn reschedule(
        &self,
        job_id: Uuid,
        worker_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE process_jobs
            SET status = 'queued',
                run_at = $3,
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() > 0)
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn push(&self, job: NewJob) -> anyhow::Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO process_jobs
                (id, client_process_id, queue, job_type, payload_json, run_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job.client_process_id)
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&job.payload_json)
        .bind(job.run_at)
        .bind(JobStatus::Queued.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }
}
