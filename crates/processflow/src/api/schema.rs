// crates/processflow/src/api/schema.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::processes::{AsynchronousProcess, ClientProcess};

pub const JSON_API_MEDIA_TYPE: &str = "application/vnd.api+json";

/// Renders client processes as JSON:API resources.
#[derive(Debug, Clone)]
pub struct ProcessSchema {
    resource: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessAttributes {
    pub attempts: i32,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub failed: bool,
    pub resource_type: String,
    pub timeout: Option<i32>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub tries: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ProcessLinks {
    #[serde(rename = "self")]
    pub self_link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProcessResource {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Uuid,
    pub attributes: ProcessAttributes,
    pub links: ProcessLinks,
}

#[derive(Debug, Serialize)]
pub struct ProcessDocument {
    pub data: ProcessResource,
}

#[derive(Debug, Serialize)]
pub struct CollectionLinks {
    #[serde(rename = "self")]
    pub self_link: String,
}

#[derive(Debug, Serialize)]
pub struct CollectionDocument {
    pub data: Vec<ProcessResource>,
    pub links: CollectionLinks,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub status: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorDocument {
    pub errors: Vec<ErrorObject>,
}

impl ProcessSchema {
    pub fn new(resource: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// JSON:API type of the process resource, e.g. `queue-jobs`.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn collection_link(&self, resource_type: &str) -> String {
        format!("{}/{}/{}", self.base_url, resource_type, self.resource)
    }

    pub fn self_link(&self, process: &ClientProcess) -> String {
        format!(
            "{}/{}",
            self.collection_link(process.resource_type()),
            process.id()
        )
    }

    /// Link to the finished resource; only for completed processes.
    pub fn resource_link(&self, process: &ClientProcess) -> Option<String> {
        if process.is_pending() {
            return None;
        }
        process
            .location()
            .map(|location| format!("{}/{}", self.base_url, location))
    }

    pub fn resource_object(&self, process: &ClientProcess) -> ProcessResource {
        ProcessResource {
            kind: self.resource.clone(),
            id: process.id(),
            attributes: ProcessAttributes {
                attempts: process.attempts(),
                completed_at: process.completed_at(),
                created_at: process.created_at(),
                failed: process.failed(),
                resource_type: process.resource_type().to_string(),
                timeout: process.timeout(),
                timeout_at: process.timeout_at(),
                tries: process.tries(),
                updated_at: process.updated_at(),
            },
            links: ProcessLinks {
                self_link: self.self_link(process),
                resource: self.resource_link(process),
            },
        }
    }

    pub fn document(&self, process: &ClientProcess) -> ProcessDocument {
        ProcessDocument {
            data: self.resource_object(process),
        }
    }

    pub fn collection(
        &self,
        resource_type: &str,
        processes: &[ClientProcess],
    ) -> CollectionDocument {
        CollectionDocument {
            data: processes.iter().map(|p| self.resource_object(p)).collect(),
            links: CollectionLinks {
                self_link: self.collection_link(resource_type),
            },
        }
    }
}

impl ErrorDocument {
    pub fn single(status: u16, title: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            errors: vec![ErrorObject {
                status: status.to_string(),
                title: title.into(),
                detail,
            }],
        }
    }
}
