// crates/processflow/src/processes/repo.rs

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::processes::dispatch::ClientDispatch;
use crate::processes::error::{ProcessError, ProcessResult};
use crate::processes::model::ClientProcess;
use crate::processes::process::AsynchronousProcess;

/// Durable storage for client processes, keyed by UUID.
#[async_trait]
pub trait ProcessRepository: Send + Sync {
    /// Build the record through `dispatching` and insert it.
    async fn create(&self, id: Uuid, dispatch: &ClientDispatch) -> ProcessResult<ClientProcess>;

    async fn find(&self, id: Uuid) -> ProcessResult<ClientProcess>;

    /// Persist one recorded attempt (attempts, completion, failure, resource id).
    ///
    /// Compare-and-set on `attempts`: the stored count must be exactly one
    /// below the new one, so two writers that read the same record cannot both
    /// land. Also rejects writes that would reopen or re-finalize a completed
    /// record, or replace a known resource id.
    async fn update(&self, process: &ClientProcess) -> ProcessResult<()>;

    /// Persist changes that do not record an attempt (resource id backfill,
    /// abandoning a process that was never enqueued). The stored `attempts`
    /// must equal the record's.
    async fn amend(&self, process: &ClientProcess) -> ProcessResult<()>;

    /// Newest first. `limit` is clamped to [1, 500].
    async fn list(
        &self,
        api: &str,
        resource_type: &str,
        limit: i64,
    ) -> ProcessResult<Vec<ClientProcess>>;
}

pub(crate) fn dispatched_record(id: Uuid, dispatch: &ClientDispatch) -> ClientProcess {
    let mut process = ClientProcess::new(id);
    process.dispatching(dispatch);
    process
}

#[derive(Clone)]
pub struct PgProcessRepo {
    pool: PgPool,
}

impl PgProcessRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // The WHERE clause carries the lifecycle invariants so a second writer
    // cannot slip past them.
    async fn guarded_write(
        &self,
        process: &ClientProcess,
        expected_attempts: i32,
    ) -> ProcessResult<()> {
        let res = sqlx::query(
            r#"
            UPDATE client_processes
            SET updated_at = $2,
                resource_id = $3,
                completed_at = $4,
                attempts = $5,
                failed = $6
            WHERE id = $1
              AND attempts = $7
              AND (resource_id IS NULL OR resource_id = $3)
              AND (completed_at IS NULL OR (completed_at = $4 AND failed = $6))
            "#,
        )
        .bind(process.id)
        .bind(process.updated_at)
        .bind(&process.resource_id)
        .bind(process.completed_at)
        .bind(process.attempts)
        .bind(process.failed)
        .bind(expected_attempts)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(ProcessError::ConcurrentModification(process.id));
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessRepository for PgProcessRepo {
    async fn create(&self, id: Uuid, dispatch: &ClientDispatch) -> ProcessResult<ClientProcess> {
        let p = dispatched_record(id, dispatch);

        let inserted = sqlx::query_as::<_, ClientProcess>(
            r#"
            INSERT INTO client_processes (
                id, created_at, updated_at,
                api, resource_type, resource_id,
                completed_at, attempts, timeout, timeout_at, tries, failed
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(p.id)
        .bind(p.created_at)
        .bind(p.updated_at)
        .bind(&p.api)
        .bind(&p.resource_type)
        .bind(&p.resource_id)
        .bind(p.completed_at)
        .bind(p.attempts)
        .bind(p.timeout)
        .bind(p.timeout_at)
        .bind(p.tries)
        .bind(p.failed)
        .fetch_optional(&self.pool)
        .await?;

        inserted.ok_or(ProcessError::DuplicateId(id))
    }

    async fn find(&self, id: Uuid) -> ProcessResult<ClientProcess> {
        sqlx::query_as::<_, ClientProcess>("SELECT * FROM client_processes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ProcessError::NotFound(id))
    }

    async fn update(&self, process: &ClientProcess) -> ProcessResult<()> {
        self.guarded_write(process, process.attempts.saturating_sub(1)).await
    }

    async fn amend(&self, process: &ClientProcess) -> ProcessResult<()> {
        self.guarded_write(process, process.attempts).await
    }

    async fn list(
        &self,
        api: &str,
        resource_type: &str,
        limit: i64,
    ) -> ProcessResult<Vec<ClientProcess>> {
        let limit = limit.clamp(1, 500);

        let rows = sqlx::query_as::<_, ClientProcess>(
            r#"
            SELECT *
            FROM client_processes
            WHERE api = $1 AND resource_type = $2
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(api)
        .bind(resource_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
