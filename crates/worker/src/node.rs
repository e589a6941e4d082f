use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conveyor_config::ClusterConfig;
use conveyor_errors::{ConveyorError, ConveyorResult};
use conveyor_orchestrator::{JobHandler, Orchestrator};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::routes;
use crate::service::{WorkerService, WorkerServiceBuilder};

/// 按名注册的处理器工厂，每次启动Worker产出一个新处理器实例
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn JobHandler> + Send + Sync>;

struct LaunchedWorker {
    name: String,
    port: u16,
    url: String,
    service: Arc<WorkerService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub name: String,
    pub port: u16,
    pub url: String,
    pub status: conveyor_domain::WorkerStatus,
    pub job_id: Option<String>,
}

/// 单机Worker宿主
///
/// 维护可启动的Worker工厂注册表和存活实例集合。启动即绑定RPC端口、
/// 拉起消费循环；关停只停实例，从不删除队列。
pub struct Node {
    host: String,
    orchestrator: Arc<Orchestrator>,
    status_queue: String,
    heartbeat_interval: Duration,
    factories: RwLock<HashMap<String, HandlerFactory>>,
    live: RwLock<HashMap<String, LaunchedWorker>>,
}

impl Node {
    pub fn new(orchestrator: Arc<Orchestrator>, cluster: &ClusterConfig, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            orchestrator,
            status_queue: cluster.status_queue_name(),
            heartbeat_interval: Duration::from_secs(cluster.heartbeat_interval_seconds),
            factories: RwLock::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_worker_type(&self, name: impl Into<String>, factory: HandlerFactory) {
        let name = name.into();
        info!(worker_type = %name, "Registered worker type");
        self.factories.write().await.insert(name, factory);
    }

    /// 启动一个Worker实例并暴露其RPC
    ///
    /// `port` 为0时由系统分配。返回 (worker_id, worker_url)。
    pub async fn launch(
        &self,
        worker_name: &str,
        port: u16,
        job_type: &str,
    ) -> ConveyorResult<(String, String)> {
        let factory = {
            let factories = self.factories.read().await;
            factories.get(worker_name).cloned().ok_or_else(|| {
                ConveyorError::validation_error(format!("未注册的Worker类型: {worker_name}"))
            })?
        };

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| ConveyorError::Network(format!("绑定端口 {port} 失败: {e}")))?;
        let actual_port = listener
            .local_addr()
            .map_err(|e| ConveyorError::Network(format!("读取监听地址失败: {e}")))?
            .port();
        let url = format!("http://{}:{}", self.host, actual_port);

        let service = WorkerServiceBuilder::new()
            .orchestrator(Arc::clone(&self.orchestrator))
            .handler(factory())
            .schema_name(job_type)
            .worker_type(worker_name)
            .worker_url(&url)
            .status_queue(&self.status_queue)
            .heartbeat_interval(self.heartbeat_interval)
            .build()
            .await?;
        service.start().await?;

        let router = routes::router(Arc::clone(&service));
        let mut shutdown_rx = service.shutdown_receiver();
        let worker_id = service.worker_id().to_string();
        {
            let worker_id = worker_id.clone();
            tokio::spawn(async move {
                let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                });
                if let Err(e) = serve.await {
                    error!(worker_id = %worker_id, "Worker RPC服务异常退出: {}", e);
                }
            });
        }

        info!(
            worker_id = %worker_id,
            worker_type = %worker_name,
            url = %url,
            job_type = %job_type,
            "Worker launched"
        );
        self.live.write().await.insert(
            worker_id.clone(),
            LaunchedWorker {
                name: worker_name.to_string(),
                port: actual_port,
                url: url.clone(),
                service,
            },
        );
        Ok((worker_id, url))
    }

    pub async fn shutdown_by_id(&self, worker_id: &str) -> ConveyorResult<()> {
        let worker = self
            .live
            .write()
            .await
            .remove(worker_id)
            .ok_or_else(|| ConveyorError::worker_not_found(worker_id))?;
        worker.service.stop().await;
        info!(worker_id = %worker_id, "Worker shut down");
        Ok(())
    }

    /// 关停该名字下的全部实例
    pub async fn shutdown_by_name(&self, worker_name: &str) -> ConveyorResult<usize> {
        let ids: Vec<String> = {
            let live = self.live.read().await;
            live.iter()
                .filter(|(_, w)| w.name == worker_name)
                .map(|(id, _)| id.clone())
                .collect()
        };
        if ids.is_empty() {
            return Err(ConveyorError::worker_not_found(worker_name));
        }
        for id in &ids {
            self.shutdown_by_id(id).await?;
        }
        Ok(ids.len())
    }

    pub async fn shutdown_by_port(&self, port: u16) -> ConveyorResult<()> {
        let id = {
            let live = self.live.read().await;
            live.iter()
                .find(|(_, w)| w.port == port)
                .map(|(id, _)| id.clone())
        };
        match id {
            Some(id) => self.shutdown_by_id(&id).await,
            None => Err(ConveyorError::worker_not_found(format!("port:{port}"))),
        }
    }

    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.live.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.shutdown_by_id(&id).await {
                warn!(worker_id = %id, "关停Worker失败: {}", e);
            }
        }
    }

    pub async fn list(&self) -> Vec<WorkerSummary> {
        let live = self.live.read().await;
        let mut summaries = Vec::with_capacity(live.len());
        for (id, worker) in live.iter() {
            summaries.push(WorkerSummary {
                worker_id: id.clone(),
                name: worker.name.clone(),
                port: worker.port,
                url: worker.url.clone(),
                status: worker.service.status().await,
                job_id: worker.service.current_job_id().await,
            });
        }
        summaries
    }
}
