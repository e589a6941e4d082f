use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_domain::{
    BrokerConnection, DeadLetterEntry, DeclareOptions, DeclareStatus, Job, OrchestratorBackend,
    QueueKind,
};
use conveyor_errors::{ConveyorError, ConveyorResult};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::queues::MemoryQueue;

/// 进程内代理
///
/// 队列注册表是一个显式对象，通过引用传递，声明只对当前进程可见。
/// 结构性变更（declare/delete/clean）持注册表写锁完成。
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: RwLock<HashMap<String, Arc<MemoryQueue>>>,
    connected: RwLock<bool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn queue(&self, name: &str) -> ConveyorResult<Arc<MemoryQueue>> {
        self.queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ConveyorError::queue_not_declared(name))
    }

    /// 导出指定队列的快照
    pub async fn snapshot_queue(&self, name: &str) -> ConveyorResult<serde_json::Value> {
        Ok(self.queue(name).await?.snapshot().await)
    }

    /// 从快照恢复指定队列的内容
    pub async fn restore_queue(
        &self,
        name: &str,
        snapshot: &serde_json::Value,
    ) -> ConveyorResult<()> {
        self.queue(name).await?.restore(snapshot).await
    }
}

#[async_trait]
impl BrokerConnection for MemoryBroker {
    async fn connect(&self) -> ConveyorResult<()> {
        *self.connected.write().await = true;
        Ok(())
    }
    async fn close(&self) -> ConveyorResult<()> {
        *self.connected.write().await = false;
        Ok(())
    }
    async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }
}

#[async_trait]
impl OrchestratorBackend for MemoryBroker {
    async fn declare_queue(
        &self,
        name: &str,
        kind: QueueKind,
        _opts: DeclareOptions,
    ) -> ConveyorResult<DeclareStatus> {
        let mut queues = self.queues.write().await;
        if let Some(existing) = queues.get(name) {
            if existing.kind() != kind {
                return Err(ConveyorError::QueueTypeMismatch {
                    name: name.to_string(),
                    declared: existing.kind().to_string(),
                    requested: kind.to_string(),
                });
            }
            debug!("队列 {} 已存在，跳过声明", name);
            return Ok(DeclareStatus::AlreadyExists);
        }
        queues.insert(name.to_string(), Arc::new(MemoryQueue::new(kind)));
        info!("声明内存队列 {} ({})", name, kind);
        Ok(DeclareStatus::Created)
    }

    async fn delete_queue(&self, name: &str) -> ConveyorResult<()> {
        let mut queues = self.queues.write().await;
        queues
            .remove(name)
            .ok_or_else(|| ConveyorError::queue_not_declared(name))?;
        info!("删除内存队列 {}", name);
        Ok(())
    }

    async fn clean_queue(&self, name: &str) -> ConveyorResult<u64> {
        // 持写锁，避免与并发declare/delete竞争
        let queues = self.queues.write().await;
        let queue = queues
            .get(name)
            .ok_or_else(|| ConveyorError::queue_not_declared(name))?;
        Ok(queue.clean().await)
    }

    async fn publish(
        &self,
        queue: &str,
        job: &Job,
        priority: Option<i64>,
    ) -> ConveyorResult<String> {
        let target = self.queue(queue).await?;
        let mut job = job.clone();
        if job.id.is_empty() {
            job.id = Uuid::new_v4().to_string();
        }
        let job_id = job.id.clone();
        let message = job.to_value().map_err(ConveyorError::from)?;
        target.push(message, priority).await;
        debug!("作业 {} 已入队 {}", job_id, queue);
        Ok(job_id)
    }

    async fn receive_message(
        &self,
        queue: &str,
        block: bool,
        timeout: Option<Duration>,
    ) -> ConveyorResult<Option<serde_json::Value>> {
        let target = self.queue(queue).await?;
        match target.pop(block, timeout).await {
            Ok(message) => Ok(Some(message)),
            Err(ConveyorError::QueueEmpty) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn count_queue_messages(&self, queue: &str) -> ConveyorResult<u64> {
        Ok(self.queue(queue).await?.len().await as u64)
    }

    async fn move_to_dlq(
        &self,
        source_queue: &str,
        dlq: &str,
        job: &Job,
        error_details: &str,
    ) -> ConveyorResult<()> {
        // 死信队列懒声明为fifo，确保消息永不丢失
        {
            let mut queues = self.queues.write().await;
            queues
                .entry(dlq.to_string())
                .or_insert_with(|| Arc::new(MemoryQueue::fifo()));
        }
        let entry = DeadLetterEntry::new(job.clone(), source_queue, error_details);
        let message = serde_json::to_value(&entry).map_err(ConveyorError::from)?;
        self.queue(dlq).await?.push(message, None).await;
        warn!(
            "作业 {} 从队列 {} 移入死信队列 {}: {}",
            job.id, source_queue, dlq, entry.error_details
        );
        Ok(())
    }
}
