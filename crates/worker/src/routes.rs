use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use crate::service::WorkerService;

/// RPC错误到HTTP响应的映射
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
        }));
        (self.status, body).into_response()
    }
}

pub fn router(service: Arc<WorkerService>) -> Router {
    Router::new()
        .route("/heartbeat", get(heartbeat))
        .route("/status", get(status))
        .route("/jobs/{id}/status", get(job_status))
        .route("/jobs/{id}/result", get(job_result))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}

async fn heartbeat(State(service): State<Arc<WorkerService>>) -> Json<serde_json::Value> {
    Json(json!({ "worker_id": service.worker_id() }))
}

async fn status(State(service): State<Arc<WorkerService>>) -> Json<serde_json::Value> {
    Json(json!({
        "worker_id": service.worker_id(),
        "status": service.status().await,
        "job_id": service.current_job_id().await,
    }))
}

async fn job_status(
    State(service): State<Arc<WorkerService>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = service
        .job_status(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("作业不存在或尚未完成: {id}")))?;
    Ok(Json(json!({ "job_id": id, "status": status })))
}

async fn job_result(
    State(service): State<Arc<WorkerService>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = service
        .job_result(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("作业不存在或尚未完成: {id}")))?;
    serde_json::to_value(&outcome)
        .map(Json)
        .map_err(|e| ApiError::internal(format!("结果序列化失败: {e}")))
}

async fn shutdown(State(service): State<Arc<WorkerService>>) -> Json<serde_json::Value> {
    info!(worker_id = %service.worker_id(), "Shutdown requested via RPC");
    service.stop().await;
    Json(json!({ "worker_id": service.worker_id(), "status": "stopping" }))
}
