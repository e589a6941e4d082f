use std::time::Duration;

use conveyor_domain::{Job, WorkerStatus};
use conveyor_errors::{ConveyorError, ConveyorResult};
use serde::{Deserialize, Serialize};
use serde_json::json;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

fn build_client(timeout: Duration) -> ConveyorResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ConveyorError::Network(format!("构建HTTP客户端失败: {e}")))
}

/// 节点关停请求的目标选择
#[derive(Debug, Clone, Serialize)]
pub enum ShutdownSelector {
    ById(String),
    ByName(String),
    ByPort(u16),
}

impl ShutdownSelector {
    fn to_body(&self) -> serde_json::Value {
        match self {
            ShutdownSelector::ById(id) => json!({ "worker_id": id }),
            ShutdownSelector::ByName(name) => json!({ "worker_name": name }),
            ShutdownSelector::ByPort(port) => json!({ "port": port }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LaunchResponse {
    pub worker_id: String,
    pub url: String,
}

/// 节点RPC客户端，传输层失败映射为 `NodeUnreachable`
pub struct NodeClient {
    client: reqwest::Client,
}

impl NodeClient {
    pub fn new() -> ConveyorResult<Self> {
        Self::with_timeout(DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> ConveyorResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }

    fn unreachable(node_url: &str, reason: impl std::fmt::Display) -> ConveyorError {
        ConveyorError::NodeUnreachable {
            url: node_url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub async fn launch_worker(
        &self,
        node_url: &str,
        worker_name: &str,
        port: u16,
        job_type: &str,
    ) -> ConveyorResult<LaunchResponse> {
        let response = self
            .client
            .post(format!("{node_url}/workers/launch"))
            .json(&json!({
                "worker_name": worker_name,
                "port": port,
                "job_type": job_type,
            }))
            .send()
            .await
            .map_err(|e| Self::unreachable(node_url, e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::unreachable(node_url, format!("{status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|e| Self::unreachable(node_url, format!("响应解析失败: {e}")))
    }

    pub async fn shutdown_worker(
        &self,
        node_url: &str,
        selector: &ShutdownSelector,
    ) -> ConveyorResult<()> {
        let response = self
            .client
            .post(format!("{node_url}/workers/shutdown"))
            .json(&selector.to_body())
            .send()
            .await
            .map_err(|e| Self::unreachable(node_url, e))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(Self::unreachable(node_url, format!("关停失败: {status}")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerStatusResponse {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub job_id: Option<String>,
}

/// Worker/端点RPC客户端
pub struct WorkerClient {
    client: reqwest::Client,
}

impl WorkerClient {
    pub fn new() -> ConveyorResult<Self> {
        Self::with_timeout(DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> ConveyorResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }

    /// 探测Worker当前状态
    pub async fn query_status(&self, worker_url: &str) -> ConveyorResult<WorkerStatusResponse> {
        let response = self
            .client
            .get(format!("{worker_url}/status"))
            .send()
            .await
            .map_err(|e| ConveyorError::Network(format!("探测 {worker_url} 失败: {e}")))?;
        if !response.status().is_success() {
            return Err(ConveyorError::Network(format!(
                "探测 {worker_url} 返回 {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ConveyorError::Network(format!("状态响应解析失败: {e}")))
    }

    /// 网关式转发：把作业POST到已注册应用的端点
    pub async fn submit_to_endpoint(
        &self,
        endpoint_url: &str,
        job: &Job,
    ) -> ConveyorResult<serde_json::Value> {
        let response = self
            .client
            .post(endpoint_url)
            .json(job)
            .send()
            .await
            .map_err(|e| ConveyorError::Network(format!("转发到 {endpoint_url} 失败: {e}")))?;
        if !response.status().is_success() {
            return Err(ConveyorError::Network(format!(
                "端点 {endpoint_url} 返回 {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ConveyorError::Network(format!("端点响应解析失败: {e}")))
    }
}
