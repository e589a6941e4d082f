use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conveyor_config::ClusterConfig;
use conveyor_domain::{
    DeadLetterEntry, DeclareOptions, Job, JobStatus, JobStatusUpdate, JobTarget, QueueKind,
    SubmitOutcome, WorkerRecord, WorkerStatus,
};
use conveyor_errors::{ConveyorError, ConveyorResult};
use conveyor_orchestrator::{Orchestrator, PublishPayload};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::clients::{NodeClient, ShutdownSelector, WorkerClient};
use crate::dlq::DeadLetterStore;
use crate::heartbeat_monitor::HeartbeatMonitor;
use crate::status_listener::{JobStatusCache, StatusListener, WorkerRegistry};

/// 可启动的Worker类型描述，按worker_name注册
#[derive(Debug, Clone)]
pub struct WorkerTypeSpec {
    pub params: serde_json::Value,
    /// 启动实例时自动安装 `job_type → Worker` 路由（不覆盖已有路由）
    pub auto_connect_job_type: Option<String>,
}

/// 集群控制面入口
///
/// 维护Worker类型注册表、存活Worker记录、作业路由表和作业状态缓存；
/// `start()` 拉起状态监听与心跳监视后台任务。
pub struct ClusterManager {
    orchestrator: Arc<Orchestrator>,
    cluster: ClusterConfig,
    worker_types: RwLock<HashMap<String, WorkerTypeSpec>>,
    workers: WorkerRegistry,
    targeting: RwLock<HashMap<String, JobTarget>>,
    jobs: JobStatusCache,
    dlq: Arc<DeadLetterStore>,
    node_client: NodeClient,
    worker_client: WorkerClient,
    shutdown_tx: broadcast::Sender<()>,
}

impl ClusterManager {
    pub fn new(orchestrator: Arc<Orchestrator>, cluster: ClusterConfig) -> ConveyorResult<Arc<Self>> {
        Self::with_rpc_timeout(orchestrator, cluster, Duration::from_secs(5))
    }

    pub fn with_rpc_timeout(
        orchestrator: Arc<Orchestrator>,
        cluster: ClusterConfig,
        rpc_timeout: Duration,
    ) -> ConveyorResult<Arc<Self>> {
        let (shutdown_tx, _) = broadcast::channel(4);
        Ok(Arc::new(Self {
            orchestrator,
            cluster,
            worker_types: RwLock::new(HashMap::new()),
            workers: Arc::new(RwLock::new(HashMap::new())),
            targeting: RwLock::new(HashMap::new()),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            dlq: Arc::new(DeadLetterStore::new()),
            node_client: NodeClient::with_timeout(rpc_timeout)?,
            worker_client: WorkerClient::with_timeout(rpc_timeout)?,
            shutdown_tx,
        }))
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn dlq(&self) -> Arc<DeadLetterStore> {
        Arc::clone(&self.dlq)
    }

    /// 声明状态队列并启动后台任务
    pub async fn start(self: &Arc<Self>) -> ConveyorResult<()> {
        let status_queue = self.cluster.status_queue_name();
        self.orchestrator
            .backend()
            .declare_queue(&status_queue, QueueKind::Fifo, DeclareOptions::default())
            .await?;
        info!(cluster = %self.cluster.name, status_queue = %status_queue, "Cluster manager starting");

        let listener = StatusListener::new(
            Arc::clone(&self.orchestrator),
            status_queue,
            self.cluster.dlq_queue_name(),
            Duration::from_millis(self.cluster.worker_poll_interval_ms),
            Arc::clone(&self.jobs),
            Arc::clone(&self.workers),
            Arc::clone(&self.dlq),
        );
        let listener_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            listener.run(listener_shutdown).await;
        });

        let monitor = HeartbeatMonitor::new(
            Arc::clone(&self.workers),
            Duration::from_secs(self.cluster.heartbeat_timeout_seconds),
            Duration::from_secs(self.cluster.heartbeat_interval_seconds),
        );
        let monitor_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            monitor.run(monitor_shutdown).await;
        });
        Ok(())
    }

    pub fn stop(&self) {
        info!(cluster = %self.cluster.name, "Cluster manager stopping");
        let _ = self.shutdown_tx.send(());
    }

    /// 注册可启动的Worker类型
    pub async fn register_worker_type(
        &self,
        worker_name: impl Into<String>,
        params: serde_json::Value,
        auto_connect_job_type: Option<String>,
    ) {
        let worker_name = worker_name.into();
        info!(
            worker_name = %worker_name,
            auto_connect = ?auto_connect_job_type,
            "Registered worker type"
        );
        self.worker_types.write().await.insert(
            worker_name,
            WorkerTypeSpec {
                params,
                auto_connect_job_type,
            },
        );
    }

    /// 作业类型直连Worker；重复注册以最后一次为准
    pub async fn register_job_to_worker(&self, job_type: impl Into<String>, worker_url: impl Into<String>) {
        let job_type = job_type.into();
        let url = worker_url.into();
        info!(job_type = %job_type, worker_url = %url, "Job routed to worker");
        self.targeting
            .write()
            .await
            .insert(job_type, JobTarget::Worker { url });
    }

    /// 作业类型转发到外部端点；重复注册以最后一次为准
    pub async fn register_job_to_endpoint(&self, job_type: impl Into<String>, endpoint: impl Into<String>) {
        let job_type = job_type.into();
        let url = endpoint.into();
        info!(job_type = %job_type, endpoint = %url, "Job routed to endpoint");
        self.targeting
            .write()
            .await
            .insert(job_type, JobTarget::Endpoint { url });
    }

    pub async fn job_target(&self, job_type: &str) -> Option<JobTarget> {
        self.targeting.read().await.get(job_type).cloned()
    }

    /// 请求节点启动一个Worker实例并登记记录
    ///
    /// 显式 `job_type` 总是安装路由；否则类型上的自动连接规则只在该
    /// 作业类型尚无路由时生效。
    pub async fn launch_worker(
        &self,
        node_url: &str,
        worker_name: &str,
        port: u16,
        job_type: Option<&str>,
    ) -> ConveyorResult<WorkerRecord> {
        let spec = {
            let types = self.worker_types.read().await;
            types.get(worker_name).cloned().ok_or_else(|| {
                ConveyorError::validation_error(format!("未注册的Worker类型: {worker_name}"))
            })?
        };

        let bound_job_type = job_type
            .map(|s| s.to_string())
            .or_else(|| spec.auto_connect_job_type.clone())
            .ok_or_else(|| {
                ConveyorError::validation_error(format!(
                    "Worker类型 {worker_name} 未指定作业类型，也没有自动连接规则"
                ))
            })?;

        let launched = self
            .node_client
            .launch_worker(node_url, worker_name, port, &bound_job_type)
            .await?;
        let record = WorkerRecord::new(launched.worker_id, launched.url.clone(), worker_name);
        self.workers
            .write()
            .await
            .insert(launched.url.clone(), record.clone());

        let mut targeting = self.targeting.write().await;
        if job_type.is_some() || !targeting.contains_key(&bound_job_type) {
            targeting.insert(
                bound_job_type.clone(),
                JobTarget::Worker {
                    url: launched.url.clone(),
                },
            );
            info!(job_type = %bound_job_type, worker_url = %launched.url, "Worker connected to job type");
        }
        Ok(record)
    }

    /// 提交作业：按作业类型查路由，无路由时返回错误结果且不入队
    pub async fn submit_job(&self, job: Job) -> SubmitOutcome {
        let target = match self.job_target(&job.schema_name).await {
            Some(target) => target,
            None => {
                warn!(job_type = %job.schema_name, "作业提交失败：没有已注册的路由");
                return SubmitOutcome::error(
                    ConveyorError::RoutingNotFound {
                        job_type: job.schema_name.clone(),
                    }
                    .to_string(),
                );
            }
        };

        match target {
            JobTarget::Worker { .. } => {
                let queue = self
                    .orchestrator
                    .queue_for(&job.schema_name)
                    .await
                    .unwrap_or_else(|| job.schema_name.clone());
                match self
                    .orchestrator
                    .publish(&queue, PublishPayload::Job(job), None)
                    .await
                {
                    Ok(job_id) => SubmitOutcome::queued(job_id),
                    Err(e) => SubmitOutcome::error(format!("作业入队失败: {e}")),
                }
            }
            JobTarget::Endpoint { url } => {
                let job_id = job.id.clone();
                match self.worker_client.submit_to_endpoint(&url, &job).await {
                    Ok(_) => SubmitOutcome::queued(job_id),
                    Err(e) => SubmitOutcome::error(format!("转发到端点失败: {e}")),
                }
            }
        }
    }

    pub async fn get_job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.read().await.get(job_id).map(|u| u.status)
    }

    pub async fn get_job_update(&self, job_id: &str) -> Option<JobStatusUpdate> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn workers(&self) -> Vec<WorkerRecord> {
        self.workers.read().await.values().cloned().collect()
    }

    /// 缓存中的Worker状态，不触发探测
    pub async fn get_worker_status(&self, worker_url: &str) -> Option<WorkerStatus> {
        self.workers.read().await.get(worker_url).map(|r| r.status)
    }

    /// 主动探测Worker并校正缓存；探测失败视为失联
    pub async fn query_worker_status_by_url(&self, worker_url: &str) -> WorkerStatus {
        match self.worker_client.query_status(worker_url).await {
            Ok(probed) => {
                let mut workers = self.workers.write().await;
                if let Some(record) = workers.get_mut(worker_url) {
                    record.status = probed.status;
                    record.current_job_id = probed.job_id.clone();
                    record.last_heartbeat = chrono::Utc::now();
                }
                probed.status
            }
            Err(e) => {
                warn!(worker_url = %worker_url, "Worker探测失败，标记为失联: {}", e);
                let mut workers = self.workers.write().await;
                if let Some(record) = workers.get_mut(worker_url) {
                    record.status = WorkerStatus::Nonexistent;
                    record.current_job_id = None;
                }
                WorkerStatus::Nonexistent
            }
        }
    }

    pub async fn query_worker_status(&self, worker_id: &str) -> ConveyorResult<WorkerStatus> {
        let url = {
            let workers = self.workers.read().await;
            workers
                .values()
                .find(|r| r.worker_id == worker_id)
                .map(|r| r.worker_url.clone())
                .ok_or_else(|| ConveyorError::worker_not_found(worker_id))?
        };
        Ok(self.query_worker_status_by_url(&url).await)
    }

    /// 通过节点RPC关停Worker并同步本地记录
    pub async fn shutdown_worker(
        &self,
        node_url: &str,
        selector: ShutdownSelector,
    ) -> ConveyorResult<()> {
        self.node_client.shutdown_worker(node_url, &selector).await?;
        let mut workers = self.workers.write().await;
        for record in workers.values_mut() {
            let matched = match &selector {
                ShutdownSelector::ById(id) => &record.worker_id == id,
                ShutdownSelector::ByName(name) => &record.worker_type == name,
                ShutdownSelector::ByPort(port) => {
                    record.worker_url.ends_with(&format!(":{port}"))
                }
            };
            if matched {
                record.status = WorkerStatus::Nonexistent;
                record.current_job_id = None;
            }
        }
        Ok(())
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dlq.list().await
    }

    /// 把死信作业重新发布回原队列
    pub async fn requeue_dead_letter(&self, job_id: &str) -> ConveyorResult<()> {
        self.dlq.requeue(job_id, &self.orchestrator).await
    }

    /// 永久丢弃死信作业
    pub async fn discard_dead_letter(&self, job_id: &str) -> ConveyorResult<()> {
        self.dlq.discard(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_domain::JobSchema;
    use conveyor_infrastructure::MemoryBroker;
    use serde_json::json;

    async fn manager() -> Arc<ClusterManager> {
        let orch = Arc::new(Orchestrator::new(Arc::new(MemoryBroker::new())));
        orch.register(JobSchema::new("convert", json!({}), json!({})), QueueKind::Fifo)
            .await
            .unwrap();
        ClusterManager::with_rpc_timeout(orch, ClusterConfig::default(), Duration::from_millis(300))
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_without_targeting_queues_nothing() {
        let manager = manager().await;
        let job = Job::new("j", "convert", json!({}));
        let outcome = manager.submit_job(job).await;

        assert_eq!(outcome.status, conveyor_domain::SubmitStatus::Error);
        assert!(outcome.job_id.is_none());
        assert!(outcome.message.unwrap().contains("convert"));
        assert_eq!(
            manager.orchestrator().count_queue_messages("convert").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_submit_with_worker_targeting_queues() {
        let manager = manager().await;
        manager.register_job_to_worker("convert", "http://w1").await;

        let job = Job::new("j", "convert", json!({}));
        let job_id = job.id.clone();
        let outcome = manager.submit_job(job).await;
        assert_eq!(outcome.status, conveyor_domain::SubmitStatus::Queued);
        assert_eq!(outcome.job_id.as_deref(), Some(job_id.as_str()));
        assert_eq!(
            manager.orchestrator().count_queue_messages("convert").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_targeting_last_registration_wins() {
        let manager = manager().await;
        manager.register_job_to_worker("convert", "http://w1").await;
        manager
            .register_job_to_endpoint("convert", "http://app/jobs")
            .await;
        assert_eq!(
            manager.job_target("convert").await,
            Some(JobTarget::Endpoint {
                url: "http://app/jobs".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_query_unreachable_worker_marks_nonexistent() {
        let manager = manager().await;
        {
            let mut record = WorkerRecord::new("w-1", "http://127.0.0.1:1", "converter");
            record.status = WorkerStatus::Running;
            record.current_job_id = Some("j-1".to_string());
            manager
                .workers
                .write()
                .await
                .insert(record.worker_url.clone(), record);
        }

        let status = manager.query_worker_status_by_url("http://127.0.0.1:1").await;
        assert_eq!(status, WorkerStatus::Nonexistent);
        // 缓存被校正，绝不保留过期的Running
        assert_eq!(
            manager.get_worker_status("http://127.0.0.1:1").await,
            Some(WorkerStatus::Nonexistent)
        );
        let workers = manager.workers().await;
        assert!(workers[0].current_job_id.is_none());
    }

    #[tokio::test]
    async fn test_query_unknown_worker_id_fails() {
        let manager = manager().await;
        assert!(matches!(
            manager.query_worker_status("ghost").await,
            Err(ConveyorError::WorkerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_launch_requires_registered_type() {
        let manager = manager().await;
        let err = manager
            .launch_worker("http://node", "unknown", 0, Some("convert"))
            .await;
        assert!(matches!(err, Err(ConveyorError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_launch_requires_job_type_or_auto_connect() {
        let manager = manager().await;
        manager
            .register_worker_type("converter", json!({}), None)
            .await;
        let err = manager.launch_worker("http://node", "converter", 0, None).await;
        assert!(matches!(err, Err(ConveyorError::ValidationError(_))));
    }
}
