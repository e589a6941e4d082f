use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use conveyor_domain::{
    ControlMessage, DeclareOptions, Job, JobStatus, JobStatusUpdate, QueueKind, WorkerHeartbeat,
    WorkerStatus,
};
use conveyor_errors::{ConveyorError, ConveyorResult};
use conveyor_orchestrator::{Consumer, JobHandler, JobOutcome, Orchestrator, PublishPayload};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// 在处理器前后维护Worker运行状态
struct InstrumentedHandler {
    inner: Arc<dyn JobHandler>,
    status: Arc<RwLock<WorkerStatus>>,
    current_job_id: Arc<RwLock<Option<String>>>,
}

#[async_trait]
impl JobHandler for InstrumentedHandler {
    async fn handle(&self, job: &Job) -> ConveyorResult<serde_json::Value> {
        {
            *self.status.write().await = WorkerStatus::Running;
            *self.current_job_id.write().await = Some(job.id.clone());
        }
        let result = self.inner.handle(job).await;
        {
            *self.status.write().await = WorkerStatus::Idle;
            *self.current_job_id.write().await = None;
        }
        result
    }
}

/// Worker执行服务
///
/// 持续消费绑定队列，执行注册的处理器，并把每个作业的终态和周期心跳
/// 发布到集群状态队列。`stop()` 后状态为 `Nonexistent`，不再上报。
pub struct WorkerService {
    worker_id: String,
    worker_url: String,
    worker_type: String,
    schema_name: String,
    queue: String,
    status_queue: String,
    heartbeat_interval: Duration,
    orchestrator: Arc<Orchestrator>,
    consumer: Arc<Consumer>,
    status: Arc<RwLock<WorkerStatus>>,
    current_job_id: Arc<RwLock<Option<String>>>,
    results: RwLock<HashMap<String, JobOutcome>>,
    shutdown_tx: broadcast::Sender<()>,
}

pub struct WorkerServiceBuilder {
    orchestrator: Option<Arc<Orchestrator>>,
    handler: Option<Arc<dyn JobHandler>>,
    schema_name: Option<String>,
    worker_type: String,
    worker_url: Option<String>,
    worker_id: String,
    status_queue: String,
    heartbeat_interval: Duration,
}

impl Default for WorkerServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerServiceBuilder {
    pub fn new() -> Self {
        Self {
            orchestrator: None,
            handler: None,
            schema_name: None,
            worker_type: "generic".to_string(),
            worker_url: None,
            worker_id: uuid::Uuid::new_v4().to_string(),
            status_queue: "conveyor_status".to_string(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    pub fn orchestrator(mut self, orchestrator: Arc<Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// 绑定的作业模式，模式名同时决定消费队列
    pub fn schema_name(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = Some(schema_name.into());
        self
    }

    pub fn worker_type(mut self, worker_type: impl Into<String>) -> Self {
        self.worker_type = worker_type.into();
        self
    }

    pub fn worker_url(mut self, worker_url: impl Into<String>) -> Self {
        self.worker_url = Some(worker_url.into());
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn status_queue(mut self, status_queue: impl Into<String>) -> Self {
        self.status_queue = status_queue.into();
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub async fn build(self) -> ConveyorResult<Arc<WorkerService>> {
        let orchestrator = self
            .orchestrator
            .ok_or_else(|| ConveyorError::config_error("WorkerService缺少编排器"))?;
        let handler = self
            .handler
            .ok_or_else(|| ConveyorError::config_error("WorkerService缺少作业处理器"))?;
        let schema_name = self
            .schema_name
            .ok_or_else(|| ConveyorError::config_error("WorkerService缺少作业模式"))?;
        let worker_url = self
            .worker_url
            .ok_or_else(|| ConveyorError::config_error("WorkerService缺少worker_url"))?;

        let status = Arc::new(RwLock::new(WorkerStatus::Idle));
        let current_job_id = Arc::new(RwLock::new(None));
        let instrumented = Arc::new(InstrumentedHandler {
            inner: handler,
            status: Arc::clone(&status),
            current_job_id: Arc::clone(&current_job_id),
        });

        let consumer = Arc::new(Consumer::new(Arc::clone(&orchestrator), instrumented));
        consumer.connect(&schema_name).await?;
        let queue = consumer
            .bound_queues()
            .await
            .into_iter()
            .next()
            .ok_or_else(|| ConveyorError::Internal("消费者绑定队列为空".to_string()))?;

        // 状态队列幂等声明，多个Worker共享同一条
        orchestrator
            .backend()
            .declare_queue(&self.status_queue, QueueKind::Fifo, DeclareOptions::default())
            .await?;

        let (shutdown_tx, _) = broadcast::channel(4);
        Ok(Arc::new(WorkerService {
            worker_id: self.worker_id,
            worker_url,
            worker_type: self.worker_type,
            schema_name,
            queue,
            status_queue: self.status_queue,
            heartbeat_interval: self.heartbeat_interval,
            orchestrator,
            consumer,
            status,
            current_job_id,
            results: RwLock::new(HashMap::new()),
            shutdown_tx,
        }))
    }
}

impl WorkerService {
    pub fn builder() -> WorkerServiceBuilder {
        WorkerServiceBuilder::new()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn worker_url(&self) -> &str {
        &self.worker_url
    }

    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn status(&self) -> WorkerStatus {
        *self.status.read().await
    }

    pub async fn current_job_id(&self) -> Option<String> {
        self.current_job_id.read().await.clone()
    }

    pub async fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.results.read().await.get(job_id).map(|o| o.status)
    }

    pub async fn job_result(&self, job_id: &str) -> Option<JobOutcome> {
        self.results.read().await.get(job_id).cloned()
    }

    /// 启动消费循环、结果上报和心跳任务
    pub async fn start(self: &Arc<Self>) -> ConveyorResult<()> {
        info!(
            worker_id = %self.worker_id,
            queue = %self.queue,
            "Starting worker service"
        );
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        self.consumer.set_outcome_channel(outcome_tx).await;

        self.spawn_outcome_task(outcome_rx);
        self.spawn_consume_task();
        self.spawn_heartbeat_task();
        Ok(())
    }

    fn spawn_outcome_task(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<JobOutcome>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(outcome) = rx.recv().await {
                service.record_outcome(outcome).await;
            }
        });
    }

    fn spawn_consume_task(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let consumer = Arc::clone(&service.consumer);
            let stopper = {
                let consumer = Arc::clone(&consumer);
                tokio::spawn(async move {
                    let _ = shutdown_rx.recv().await;
                    consumer.stop();
                })
            };
            if let Err(e) = consumer.consume(0, None, true).await {
                error!(worker_id = %service.worker_id, "消费循环异常退出: {}", e);
            }
            stopper.abort();
            debug!(worker_id = %service.worker_id, "Consume loop exited");
        });
    }

    fn spawn_heartbeat_task(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.publish_heartbeat().await {
                            warn!(worker_id = %service.worker_id, "心跳发布失败: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(worker_id = %service.worker_id, "Heartbeat task stopped");
                        break;
                    }
                }
            }
        });
    }

    async fn record_outcome(&self, outcome: JobOutcome) {
        let update = JobStatusUpdate {
            job_id: outcome.job_id.clone(),
            schema_name: self.schema_name.clone(),
            source_queue: outcome.queue.clone(),
            status: outcome.status,
            worker_id: self.worker_id.clone(),
            output: outcome.output.clone(),
            error_message: outcome.error_message.clone(),
            job: outcome.job.clone(),
            timestamp: Utc::now(),
        };
        {
            let mut results = self.results.write().await;
            results.insert(outcome.job_id.clone(), outcome);
        }
        if let Err(e) = self.publish_control(ControlMessage::status_update(update)).await {
            error!(worker_id = %self.worker_id, "状态上报失败: {}", e);
        }
    }

    async fn publish_heartbeat(&self) -> ConveyorResult<()> {
        let heartbeat = WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            worker_url: self.worker_url.clone(),
            current_job_id: self.current_job_id().await,
            timestamp: Utc::now(),
        };
        self.publish_control(ControlMessage::heartbeat(heartbeat)).await
    }

    async fn publish_control(&self, message: ControlMessage) -> ConveyorResult<()> {
        let envelope = message.to_job(&self.status_queue)?;
        self.orchestrator
            .publish(&self.status_queue, PublishPayload::Job(envelope), None)
            .await?;
        Ok(())
    }

    /// 停止服务；在消息边界退出，不中断执行中的作业
    pub async fn stop(&self) {
        info!(worker_id = %self.worker_id, "Stopping worker service");
        let _ = self.shutdown_tx.send(());
        *self.status.write().await = WorkerStatus::Nonexistent;
        *self.current_job_id.write().await = None;
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
