use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conveyor_domain::{
    ControlMessage, DeadLetterEntry, Job, JobStatusUpdate, WorkerHeartbeat, WorkerRecord,
    WorkerStatus,
};
use conveyor_orchestrator::Orchestrator;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::dlq::DeadLetterStore;

/// 作业状态缓存，键为作业id
pub type JobStatusCache = Arc<RwLock<HashMap<String, JobStatusUpdate>>>;
/// Worker记录表，键为worker_url
pub type WorkerRegistry = Arc<RwLock<HashMap<String, WorkerRecord>>>;

/// 状态监听器
///
/// 消费集群状态队列上的控制消息：作业状态变更进入缓存，失败作业
/// 落入死信仓并镜像到持久死信队列；心跳刷新Worker记录。
/// 未注册Worker的心跳只告警。
pub struct StatusListener {
    orchestrator: Arc<Orchestrator>,
    status_queue: String,
    dlq_queue: String,
    poll_interval: Duration,
    jobs: JobStatusCache,
    workers: WorkerRegistry,
    dlq: Arc<DeadLetterStore>,
}

impl StatusListener {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        status_queue: impl Into<String>,
        dlq_queue: impl Into<String>,
        poll_interval: Duration,
        jobs: JobStatusCache,
        workers: WorkerRegistry,
        dlq: Arc<DeadLetterStore>,
    ) -> Self {
        Self {
            orchestrator,
            status_queue: status_queue.into(),
            dlq_queue: dlq_queue.into(),
            poll_interval,
            jobs,
            workers,
            dlq,
        }
    }

    /// 轮询状态队列直到收到停止信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(queue = %self.status_queue, "Status listener started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Status listener stopped");
                    break;
                }
                _ = self.drain_once() => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// 取空当前积压的控制消息
    pub async fn drain_once(&self) {
        loop {
            match self
                .orchestrator
                .receive_message(&self.status_queue, false, None)
                .await
            {
                Ok(Some(raw)) => self.handle_message(raw).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(queue = %self.status_queue, "读取状态队列失败: {}", e);
                    break;
                }
            }
        }
    }

    pub async fn handle_message(&self, raw: serde_json::Value) {
        match ControlMessage::from_queued(&raw) {
            Ok(ControlMessage::JobStatusUpdate(update)) => self.on_status_update(update).await,
            Ok(ControlMessage::WorkerHeartbeat(heartbeat)) => self.on_heartbeat(heartbeat).await,
            Err(e) => {
                warn!(queue = %self.status_queue, "无法解析的控制消息: {}", e);
            }
        }
    }

    async fn on_status_update(&self, update: JobStatusUpdate) {
        debug!(
            job_id = %update.job_id,
            status = ?update.status,
            worker_id = %update.worker_id,
            "Job status update"
        );
        if update.status.is_dead_letter() {
            let job = update.job.clone().unwrap_or_else(|| {
                // 作业连反序列化都没过，用上报字段拼出最小条目
                let mut job = Job::new(
                    update.job_id.clone(),
                    update.schema_name.clone(),
                    serde_json::Value::Null,
                );
                job.id = update.job_id.clone();
                job
            });
            let job = job.with_status(update.status);
            let error_details = update
                .error_message
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "Worker未提供错误详情".to_string());
            if let Err(e) = self
                .orchestrator
                .backend()
                .move_to_dlq(&update.source_queue, &self.dlq_queue, &job, &error_details)
                .await
            {
                warn!(job_id = %update.job_id, "死信镜像到队列 {} 失败: {}", self.dlq_queue, e);
            }
            let entry = DeadLetterEntry::new(job, update.source_queue.clone(), error_details);
            self.dlq.push(entry).await;
        }
        self.jobs.write().await.insert(update.job_id.clone(), update);
    }

    async fn on_heartbeat(&self, heartbeat: WorkerHeartbeat) {
        let mut workers = self.workers.write().await;
        match workers.get_mut(&heartbeat.worker_url) {
            Some(record) => {
                record.last_heartbeat = Utc::now();
                record.status = if heartbeat.current_job_id.is_some() {
                    WorkerStatus::Running
                } else {
                    WorkerStatus::Idle
                };
                record.current_job_id = heartbeat.current_job_id;
            }
            None => {
                warn!(
                    worker_id = %heartbeat.worker_id,
                    worker_url = %heartbeat.worker_url,
                    "收到未注册Worker的心跳"
                );
            }
        }
    }
}
