use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::processes::registry::ResourcePolicy;

/// The resource mutation a dispatched job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(anyhow::anyhow!("unknown operation: {other}")),
        }
    }
}

/// What triggered an asynchronous operation, captured when the job is handed
/// to the queue.
///
/// Timeout and tries are copied in here from the registry at dispatch time, so
/// a later configuration change never reaches jobs that are already in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDispatch {
    api: String,
    resource_type: String,
    resource_id: Option<String>,
    operation: Operation,
    timeout: Option<i32>,
    tries: Option<i32>,
    dispatched_at: DateTime<Utc>,
}

impl ClientDispatch {
    pub fn new(
        api: impl Into<String>,
        resource_type: impl Into<String>,
        operation: Operation,
    ) -> Self {
        Self {
            api: api.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            operation,
            timeout: None,
            tries: None,
            dispatched_at: Utc::now(),
        }
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_policy(mut self, policy: ResourcePolicy) -> Self {
        self.timeout = policy.timeout;
        self.tries = policy.tries;
        self
    }

    pub fn with_timeout(mut self, seconds: Option<i32>) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn with_tries(mut self, tries: Option<i32>) -> Self {
        self.tries = tries;
        self
    }

    pub fn dispatched_at(mut self, at: DateTime<Utc>) -> Self {
        self.dispatched_at = at;
        self
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.resource_id.as_deref()
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn timeout(&self) -> Option<i32> {
        self.timeout
    }

    pub fn tries(&self) -> Option<i32> {
        self.tries
    }

    pub fn dispatch_time(&self) -> DateTime<Utc> {
        self.dispatched_at
    }

    /// Absolute deadline: dispatch time plus the timeout.
    pub fn timeout_at(&self) -> Option<DateTime<Utc>> {
        self.timeout
            .map(|secs| self.dispatched_at + Duration::seconds(i64::from(secs)))
    }

    /// Queue job type, e.g. `articles:create`.
    pub fn job_type(&self) -> String {
        format!("{}:{}", self.resource_type, self.operation)
    }
}
