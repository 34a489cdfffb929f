use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{JobKind, MemorySample, Table, TaskId, TaskInfo};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{error::TaskError, manager::CancelAck, TaskManager};

pub fn build_router(manager: TaskManager) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/tasks", post(submit_task).get(list_tasks))
        .route("/api/v1/tasks/:id", get(get_task).delete(delete_task))
        .route("/api/v1/tasks/:id/result", get(get_result))
        .route("/api/v1/tasks/:id/ack", post(ack_result))
        .route("/api/v1/tasks/:id/memory", get(get_memory))
        .route("/api/v1/tasks/:id/cancel", post(cancel_task))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: TaskId,
}

impl TaskError {
    fn status_code(&self) -> StatusCode {
        match self {
            TaskError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            TaskError::NotFound(_) => StatusCode::NOT_FOUND,
            TaskError::NotReady { .. } => StatusCode::CONFLICT,
            TaskError::Canceled(_) => StatusCode::GONE,
            TaskError::Application(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TaskError::ResourceExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            TaskError::Launch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TaskError::WorkerCrashed(_) => StatusCode::BAD_GATEWAY,
            TaskError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.to_string() }));
        (self.status_code(), body).into_response()
    }
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn submit_task(
    State(manager): State<TaskManager>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), TaskError> {
    let kind: JobKind = req.kind.parse()?;
    let task_id = manager.submit(kind, req.payload).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { task_id })))
}

async fn list_tasks(State(manager): State<TaskManager>) -> Json<Vec<TaskInfo>> {
    Json(manager.list())
}

async fn get_task(
    State(manager): State<TaskManager>,
    Path(id): Path<String>,
) -> Result<Json<TaskInfo>, TaskError> {
    manager.status(&id).map(Json)
}

async fn get_result(
    State(manager): State<TaskManager>,
    Path(id): Path<String>,
) -> Result<Json<Table>, TaskError> {
    let table = manager.result(&id)?;
    Ok(Json(Table::clone(&table)))
}

async fn ack_result(
    State(manager): State<TaskManager>,
    Path(id): Path<String>,
) -> Result<StatusCode, TaskError> {
    manager.acknowledge(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_memory(
    State(manager): State<TaskManager>,
    Path(id): Path<String>,
) -> Json<Vec<MemorySample>> {
    Json(manager.memory_usage(&id))
}

async fn cancel_task(
    State(manager): State<TaskManager>,
    Path(id): Path<String>,
) -> Result<Json<CancelAck>, TaskError> {
    manager.cancel(&id).await.map(Json)
}

async fn delete_task(
    State(manager): State<TaskManager>,
    Path(id): Path<String>,
) -> Result<StatusCode, TaskError> {
    manager.delete(&id).await?;
    info!("tarea {} borrada vía HTTP", id);
    Ok(StatusCode::NO_CONTENT)
}
