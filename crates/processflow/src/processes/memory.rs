//! In-memory process repository for tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::processes::dispatch::ClientDispatch;
use crate::processes::error::{ProcessError, ProcessResult};
use crate::processes::model::ClientProcess;
use crate::processes::repo::{dispatched_record, ProcessRepository};

#[derive(Debug, Default)]
pub struct InMemoryProcessRepo {
    processes: RwLock<HashMap<Uuid, ClientProcess>>,
}

impl InMemoryProcessRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a record, as an external retention job would.
    pub fn remove(&self, id: Uuid) -> Option<ClientProcess> {
        self.processes.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.processes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn guarded_write(&self, process: &ClientProcess, expected_attempts: i32) -> ProcessResult<()> {
        let mut processes = self.processes.write();
        match processes.get_mut(&process.id) {
            Some(stored) if accepts(stored, process, expected_attempts) => {
                stored.updated_at = process.updated_at;
                stored.resource_id = process.resource_id.clone();
                stored.completed_at = process.completed_at;
                stored.attempts = process.attempts;
                stored.failed = process.failed;
                Ok(())
            }
            _ => Err(ProcessError::ConcurrentModification(process.id)),
        }
    }
}

/// Same guard as the `UPDATE ... WHERE` in the Postgres repo.
fn accepts(stored: &ClientProcess, next: &ClientProcess, expected_attempts: i32) -> bool {
    let attempts_ok = stored.attempts == expected_attempts;
    let resource_ok = stored.resource_id.is_none() || stored.resource_id == next.resource_id;
    let terminal_ok = stored.completed_at.is_none()
        || (stored.completed_at == next.completed_at && stored.failed == next.failed);
    attempts_ok && resource_ok && terminal_ok
}

#[async_trait]
impl ProcessRepository for InMemoryProcessRepo {
    async fn create(&self, id: Uuid, dispatch: &ClientDispatch) -> ProcessResult<ClientProcess> {
        let mut processes = self.processes.write();
        if processes.contains_key(&id) {
            return Err(ProcessError::DuplicateId(id));
        }
        let process = dispatched_record(id, dispatch);
        processes.insert(id, process.clone());
        Ok(process)
    }

    async fn find(&self, id: Uuid) -> ProcessResult<ClientProcess> {
        self.processes
            .read()
            .get(&id)
            .cloned()
            .ok_or(ProcessError::NotFound(id))
    }

    async fn update(&self, process: &ClientProcess) -> ProcessResult<()> {
        self.guarded_write(process, process.attempts.saturating_sub(1))
    }

    async fn amend(&self, process: &ClientProcess) -> ProcessResult<()> {
        self.guarded_write(process, process.attempts)
    }

    async fn list(
        &self,
        api: &str,
        resource_type: &str,
        limit: i64,
    ) -> ProcessResult<Vec<ClientProcess>> {
        let limit = limit.clamp(1, 500) as usize;

        let mut rows: Vec<ClientProcess> = self
            .processes
            .read()
            .values()
            .filter(|p| p.api == api && p.resource_type == resource_type)
            .cloned()
            .collect();

        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }
}
