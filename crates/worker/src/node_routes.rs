use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use conveyor_errors::ConveyorError;
use serde::Deserialize;
use serde_json::json;

use crate::node::{Node, WorkerSummary};
use crate::routes::ApiError;

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/workers/launch", post(launch_worker))
        .route("/workers/shutdown", post(shutdown_worker))
        .route("/workers", get(list_workers))
        .with_state(node)
}

#[derive(Debug, Deserialize)]
struct LaunchRequest {
    worker_name: String,
    #[serde(default)]
    port: u16,
    job_type: String,
}

/// 关停目标：三选一，优先级 worker_id > port > worker_name
#[derive(Debug, Deserialize)]
struct ShutdownRequest {
    worker_id: Option<String>,
    worker_name: Option<String>,
    port: Option<u16>,
}

fn map_error(e: ConveyorError) -> ApiError {
    match e {
        ConveyorError::WorkerNotFound { .. } => ApiError::not_found(e.to_string()),
        other => ApiError::internal(other.to_string()),
    }
}

async fn launch_worker(
    State(node): State<Arc<Node>>,
    Json(req): Json<LaunchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (worker_id, url) = node
        .launch(&req.worker_name, req.port, &req.job_type)
        .await
        .map_err(map_error)?;
    Ok(Json(json!({ "worker_id": worker_id, "url": url })))
}

async fn shutdown_worker(
    State(node): State<Arc<Node>>,
    Json(req): Json<ShutdownRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stopped = if let Some(id) = req.worker_id {
        node.shutdown_by_id(&id).await.map_err(map_error)?;
        1
    } else if let Some(port) = req.port {
        node.shutdown_by_port(port).await.map_err(map_error)?;
        1
    } else if let Some(name) = req.worker_name {
        node.shutdown_by_name(&name).await.map_err(map_error)?
    } else {
        return Err(ApiError::internal(
            "关停请求必须提供 worker_id、port 或 worker_name 之一".to_string(),
        ));
    };
    Ok(Json(json!({ "stopped": stopped })))
}

async fn list_workers(State(node): State<Arc<Node>>) -> Json<Vec<WorkerSummary>> {
    Json(node.list().await)
}
