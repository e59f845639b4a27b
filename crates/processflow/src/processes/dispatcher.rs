use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::processes::dispatch::{ClientDispatch, Operation};
use crate::processes::error::{ProcessError, ProcessResult};
use crate::processes::model::ClientProcess;
use crate::processes::queue::{JobQueue, NewJob};
use crate::processes::registry::ResourceRegistry;
use crate::processes::repo::ProcessRepository;

/// Creates the client process and hands its job to the queue.
#[derive(Clone)]
pub struct ClientDispatcher {
    processes: Arc<dyn ProcessRepository>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<ResourceRegistry>,
    api: String,
    queue_name: String,
}

impl ClientDispatcher {
    pub fn new(
        processes: Arc<dyn ProcessRepository>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<ResourceRegistry>,
        api: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            processes,
            queue,
            registry,
            api: api.into(),
            queue_name: queue_name.into(),
        }
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    /// Descriptor for a dispatch happening now, with the registry's current
    /// policy copied in.
    pub fn descriptor(
        &self,
        resource_type: &str,
        resource_id: Option<&str>,
        operation: Operation,
    ) -> ClientDispatch {
        let policy = self.registry.policy_for(resource_type, operation);
        let dispatch = ClientDispatch::new(&self.api, resource_type, operation).with_policy(policy);
        match resource_id {
            Some(id) => dispatch.with_resource_id(id),
            None => dispatch,
        }
    }

    pub async fn dispatch(
        &self,
        resource_type: &str,
        resource_id: Option<&str>,
        operation: Operation,
        payload_json: Value,
    ) -> ProcessResult<ClientProcess> {
        let dispatch = self.descriptor(resource_type, resource_id, operation);
        let id = Uuid::new_v4();

        let mut process = self.processes.create(id, &dispatch).await?;

        let pushed = self
            .queue
            .push(NewJob {
                client_process_id: id,
                queue: self.queue_name.clone(),
                job_type: dispatch.job_type(),
                payload_json,
                run_at: Utc::now(),
            })
            .await;

        match pushed {
            Ok(job_id) => {
                tracing::info!(
                    process_id = %id,
                    job_id = %job_id,
                    job_type = %dispatch.job_type(),
                    timeout = ?dispatch.timeout(),
                    tries = ?dispatch.tries(),
                    "dispatched client process"
                );
                Ok(process)
            }
            Err(e) => {
                // No worker will ever report on this process; finalize it so
                // pollers do not wait forever.
                tracing::error!(process_id = %id, error = %e, "enqueue failed, abandoning process");
                if process.abandon(Utc::now()) {
                    if let Err(update_err) = self.processes.amend(&process).await {
                        tracing::error!(
                            process_id = %id,
                            error = %update_err,
                            "could not abandon process"
                        );
                    }
                }
                Err(ProcessError::Queue(e.to_string()))
            }
        }
    }
}
