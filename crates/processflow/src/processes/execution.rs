use chrono::{DateTime, Utc};

use crate::processes::error_codes::ErrorCode;

/// Why an attempt failed. Kept for logs only; never stored on the process or
/// shown to API clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    /// The queue will retry; only the attempt counter moves.
    TransientFailure(ExecutionFailure),
    /// Retries exhausted or the failure cannot be retried.
    PermanentFailure(ExecutionFailure),
}

/// Outcome of one job attempt as reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    outcome: ExecutionOutcome,
    resource_id: Option<String>,
    finished_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(outcome: ExecutionOutcome) -> Self {
        Self {
            outcome,
            resource_id: None,
            finished_at: Utc::now(),
        }
    }

    pub fn succeeded() -> Self {
        Self::new(ExecutionOutcome::Succeeded)
    }

    pub fn transient(failure: ExecutionFailure) -> Self {
        Self::new(ExecutionOutcome::TransientFailure(failure))
    }

    pub fn permanent(failure: ExecutionFailure) -> Self {
        Self::new(ExecutionOutcome::PermanentFailure(failure))
    }

    /// Id of the resource the job created, backfilled onto the process.
    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = at;
        self
    }

    pub fn outcome(&self) -> &ExecutionOutcome {
        &self.outcome
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.resource_id.as_deref()
    }

    pub fn finish_time(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn failure(&self) -> Option<&ExecutionFailure> {
        match &self.outcome {
            ExecutionOutcome::Succeeded => None,
            ExecutionOutcome::TransientFailure(f) | ExecutionOutcome::PermanentFailure(f) => {
                Some(f)
            }
        }
    }
}

/// What `processed` did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Retrying,
    Succeeded,
    Failed,
    /// The process was already terminal; nothing changed.
    Absorbed,
}

impl Transition {
    pub fn changed(&self) -> bool {
        !matches!(self, Transition::Absorbed)
    }
}
