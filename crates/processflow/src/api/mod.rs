use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::processes::{
    AsynchronousProcess, ClientDispatcher, ClientProcess, Operation, ProcessError,
    ProcessRepository,
};

pub mod schema;

use schema::{ErrorDocument, ProcessSchema, JSON_API_MEDIA_TYPE};

#[derive(Clone)]
pub struct ApiState {
    pub processes: Arc<dyn ProcessRepository>,
    pub dispatcher: ClientDispatcher,
    pub schema: ProcessSchema,
}

pub fn router(state: ApiState) -> Router {
    let jobs = state.schema.resource().to_string();

    Router::new()
        .route("/health", get(health))
        // Process polling
        .route(&format!("/:resource_type/{jobs}"), get(list_processes))
        .route(&format!("/:resource_type/{jobs}/:id"), get(show_process))
        // Asynchronous mutations
        .route("/:resource_type", post(create_resource))
        .route(
            "/:resource_type/:id",
            patch(update_resource).delete(delete_resource),
        )
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    NotFound,
    BadRequest(String),
    Conflict(String),
    Internal,
}

impl From<ProcessError> for ApiError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::NotFound(_) => ApiError::NotFound,
            other => {
                // Internal detail stays in the logs, never in the response.
                tracing::error!(error = %other, "request failed");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, title, detail) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not Found", None),
            ApiError::BadRequest(d) => (StatusCode::BAD_REQUEST, "Bad Request", Some(d)),
            ApiError::Conflict(d) => (StatusCode::CONFLICT, "Conflict", Some(d)),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                None,
            ),
        };
        jsonapi(status, &ErrorDocument::single(status.as_u16(), title, detail))
    }
}

fn jsonapi<T: Serialize>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_vec(body) {
        Ok(bytes) => (status, [(header::CONTENT_TYPE, JSON_API_MEDIA_TYPE)], bytes).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// 202 Accepted with the process document and its polling location.
fn accepted(state: &ApiState, process: &ClientProcess) -> Response {
    let mut res = jsonapi(StatusCode::ACCEPTED, &state.schema.document(process));
    if let Ok(location) = HeaderValue::from_str(&state.schema.self_link(process)) {
        res.headers_mut().insert(header::CONTENT_LOCATION, location);
    }
    res
}

/// Checks `data.type` (and `data.id` when given) against the URL.
fn check_resource_identity(
    body: &Value,
    resource_type: &str,
    resource_id: Option<&str>,
) -> Result<(), ApiError> {
    let data = body
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| ApiError::BadRequest("document must contain a data object".into()))?;

    match data.get("type").and_then(Value::as_str) {
        Some(t) if t == resource_type => {}
        Some(t) => {
            return Err(ApiError::Conflict(format!(
                "resource type {t} does not match endpoint {resource_type}"
            )))
        }
        None => return Err(ApiError::BadRequest("data.type is required".into())),
    }

    if let Some(expected) = resource_id {
        match data.get("id").and_then(Value::as_str) {
            Some(id) if id == expected => {}
            Some(id) => {
                return Err(ApiError::Conflict(format!(
                    "resource id {id} does not match endpoint {expected}"
                )))
            }
            None => return Err(ApiError::BadRequest("data.id is required".into())),
        }
    }

    Ok(())
}

pub async fn create_resource(
    State(state): State<ApiState>,
    Path(resource_type): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    check_resource_identity(&body, &resource_type, None)?;

    let process = state
        .dispatcher
        .dispatch(&resource_type, None, Operation::Create, body)
        .await?;

    Ok(accepted(&state, &process))
}

pub async fn update_resource(
    State(state): State<ApiState>,
    Path((resource_type, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    check_resource_identity(&body, &resource_type, Some(&id))?;

    let process = state
        .dispatcher
        .dispatch(&resource_type, Some(&id), Operation::Update, body)
        .await?;

    Ok(accepted(&state, &process))
}

pub async fn delete_resource(
    State(state): State<ApiState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let payload = json!({ "data": { "type": resource_type, "id": id } });

    let process = state
        .dispatcher
        .dispatch(&resource_type, Some(&id), Operation::Delete, payload)
        .await?;

    Ok(accepted(&state, &process))
}

/// 200 with the process while it is pending or failed; 303 to the resource
/// once it completed with a location.
pub async fn show_process(
    State(state): State<ApiState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let id: Uuid = id.parse().map_err(|_| ApiError::NotFound)?;
    let process = state.processes.find(id).await?;

    if process.resource_type() != resource_type || process.api() != state.dispatcher.api() {
        return Err(ApiError::NotFound);
    }

    if let Some(location) = state.schema.resource_link(&process) {
        return Ok(Redirect::to(&location).into_response());
    }

    Ok(jsonapi(StatusCode::OK, &state.schema.document(&process)))
}

#[derive(Debug, Deserialize)]
pub struct ListProcessesQuery {
    pub limit: Option<i64>,
}

pub async fn list_processes(
    State(state): State<ApiState>,
    Path(resource_type): Path<String>,
    Query(q): Query<ListProcessesQuery>,
) -> Result<Response, ApiError> {
    let processes = state
        .processes
        .list(state.dispatcher.api(), &resource_type, q.limit.unwrap_or(100))
        .await?;

    Ok(jsonapi(
        StatusCode::OK,
        &state.schema.collection(&resource_type, &processes),
    ))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
