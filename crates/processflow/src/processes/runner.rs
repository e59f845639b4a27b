use std::sync::Arc;

use uuid::Uuid;

use crate::processes::error::ProcessResult;
use crate::processes::execution::{ExecutionContext, Transition};
use crate::processes::model::ClientProcess;
use crate::processes::process::AsynchronousProcess;
use crate::processes::repo::ProcessRepository;

/// Applies execution outcomes to stored processes.
#[derive(Clone)]
pub struct ProcessRunner {
    processes: Arc<dyn ProcessRepository>,
}

impl ProcessRunner {
    pub fn new(processes: Arc<dyn ProcessRepository>) -> Self {
        Self { processes }
    }

    pub async fn find(&self, process_id: Uuid) -> ProcessResult<ClientProcess> {
        self.processes.find(process_id).await
    }

    /// find → `processed` → update. Absorbed calls on a terminal process are
    /// not written back.
    pub async fn record_attempt(
        &self,
        process_id: Uuid,
        execution: &ExecutionContext,
    ) -> ProcessResult<ClientProcess> {
        let mut process = self.processes.find(process_id).await?;
        let transition = process.processed(execution);

        if let Some(failure) = execution.failure() {
            tracing::warn!(
                process_id = %process_id,
                attempts = process.attempts(),
                code = %failure.code,
                message = %failure.message,
                "job attempt failed"
            );
        }

        match transition {
            Transition::Absorbed => {
                tracing::debug!(
                    process_id = %process_id,
                    status = process.status().as_str(),
                    "process already terminal"
                );
                return Ok(process);
            }
            Transition::Retrying => {
                tracing::info!(
                    process_id = %process_id,
                    attempts = process.attempts(),
                    "process will retry"
                )
            }
            Transition::Succeeded => {
                tracing::info!(
                    process_id = %process_id,
                    attempts = process.attempts(),
                    location = ?process.location(),
                    "process succeeded"
                )
            }
            Transition::Failed => {
                tracing::warn!(
                    process_id = %process_id,
                    attempts = process.attempts(),
                    "process failed"
                )
            }
        }

        self.processes.update(&process).await?;
        Ok(process)
    }

    /// Backfill the id of the resource a pending create produced.
    pub async fn resolve(
        &self,
        process_id: Uuid,
        resource_id: &str,
    ) -> ProcessResult<ClientProcess> {
        let mut process = self.processes.find(process_id).await?;
        if process.resolved(resource_id) {
            self.processes.amend(&process).await?;
            tracing::info!(process_id = %process_id, resource_id, "resolved process resource");
        }
        Ok(process)
    }
}
