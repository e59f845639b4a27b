use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Persisted tracking record for one dispatched job.
///
/// Fields are private so the lifecycle invariants (single terminal transition,
/// monotonic attempts, `failed` only when completed) can only be changed
/// through [`AsynchronousProcess`](super::process::AsynchronousProcess).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ClientProcess {
    pub(crate) id: Uuid,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,

    pub(crate) api: String,
    pub(crate) resource_type: String,
    pub(crate) resource_id: Option<String>,

    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) attempts: i32,
    pub(crate) timeout: Option<i32>,
    pub(crate) timeout_at: Option<DateTime<Utc>>,
    pub(crate) tries: Option<i32>,
    pub(crate) failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Pending,
    Succeeded,
    Failed,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::Succeeded => "succeeded",
            ProcessStatus::Failed => "failed",
        }
    }
}

impl ClientProcess {
    /// A blank, unsaved record. Call `dispatching` before persisting it.
    pub fn new(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            updated_at: now,
            api: String::new(),
            resource_type: String::new(),
            resource_id: None,
            completed_at: None,
            attempts: 0,
            timeout: None,
            timeout_at: None,
            tries: None,
            failed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.resource_id.as_deref()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn attempts(&self) -> i32 {
        self.attempts
    }

    pub fn timeout(&self) -> Option<i32> {
        self.timeout
    }

    pub fn timeout_at(&self) -> Option<DateTime<Utc>> {
        self.timeout_at
    }

    pub fn tries(&self) -> Option<i32> {
        self.tries
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn status(&self) -> ProcessStatus {
        match (self.completed_at, self.failed) {
            (None, _) => ProcessStatus::Pending,
            (Some(_), false) => ProcessStatus::Succeeded,
            (Some(_), true) => ProcessStatus::Failed,
        }
    }

    /// Finalize as failed without counting an attempt.
    ///
    /// Used when the job never reached the queue, so no worker will ever
    /// report on it.
    pub(crate) fn abandon(&mut self, at: DateTime<Utc>) -> bool {
        if self.completed_at.is_some() {
            return false;
        }
        self.completed_at = Some(at);
        self.failed = true;
        self.updated_at = at;
        true
    }
}
