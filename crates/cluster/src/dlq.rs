use conveyor_domain::{DeadLetterEntry, JobStatus};
use conveyor_errors::{ConveyorError, ConveyorResult};
use conveyor_orchestrator::{Orchestrator, PublishPayload};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// 死信仓
///
/// 失败作业在这里等待运维决策：`requeue` 恢复可消费性，
/// `discard` 永久移除。两者对未知id都返回 `DeadLetterNotFound`。
#[derive(Default)]
pub struct DeadLetterStore {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl DeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, entry: DeadLetterEntry) {
        warn!(
            job_id = %entry.job_id,
            source_queue = %entry.source_queue,
            "作业进入死信仓: {}",
            entry.error_details
        );
        self.entries.write().await.push(entry);
    }

    pub async fn list(&self) -> Vec<DeadLetterEntry> {
        self.entries.read().await.clone()
    }

    pub async fn get(&self, job_id: &str) -> Option<DeadLetterEntry> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.job_id == job_id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 把死信作业重新发布回原队列并移除条目
    pub async fn requeue(&self, job_id: &str, orchestrator: &Orchestrator) -> ConveyorResult<()> {
        let entry = self
            .take(job_id)
            .await
            .ok_or_else(|| ConveyorError::dead_letter_not_found(job_id))?;

        let job = entry.job.clone().with_status(JobStatus::Queued);
        match orchestrator
            .publish(&entry.source_queue, PublishPayload::Job(job), None)
            .await
        {
            Ok(_) => {
                info!(job_id = %job_id, queue = %entry.source_queue, "死信作业已重新入队");
                Ok(())
            }
            Err(e) => {
                // 发布失败则放回死信仓，避免作业凭空丢失
                self.entries.write().await.push(entry);
                Err(e)
            }
        }
    }

    /// 永久丢弃
    pub async fn discard(&self, job_id: &str) -> ConveyorResult<()> {
        self.take(job_id)
            .await
            .map(|entry| {
                info!(job_id = %entry.job_id, "死信作业已丢弃");
            })
            .ok_or_else(|| ConveyorError::dead_letter_not_found(job_id))
    }

    async fn take(&self, job_id: &str) -> Option<DeadLetterEntry> {
        let mut entries = self.entries.write().await;
        let index = entries.iter().position(|e| e.job_id == job_id)?;
        Some(entries.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use conveyor_domain::{Job, JobSchema, QueueKind};
    use conveyor_infrastructure::MemoryBroker;
    use serde_json::json;

    async fn setup() -> (Arc<Orchestrator>, DeadLetterStore) {
        let orch = Arc::new(Orchestrator::new(Arc::new(MemoryBroker::new())));
        orch.register(JobSchema::new("convert", json!({}), json!({})), QueueKind::Fifo)
            .await
            .unwrap();
        (orch, DeadLetterStore::new())
    }

    fn dead(job_name: &str) -> DeadLetterEntry {
        let job = Job::new(job_name, "convert", json!({"n": 1}));
        DeadLetterEntry::new(job, "convert", "处理器失败")
    }

    #[tokio::test]
    async fn test_requeue_restores_receiveability() {
        let (orch, store) = setup().await;
        let entry = dead("j1");
        let job_id = entry.job_id.clone();
        store.push(entry).await;

        store.requeue(&job_id, &orch).await.unwrap();
        assert!(store.is_empty().await);

        let raw = orch.receive_message("convert", false, None).await.unwrap().unwrap();
        assert_eq!(raw["id"], job_id.as_str());
        assert_eq!(raw["status"], "queued");
    }

    #[tokio::test]
    async fn test_discard_is_permanent() {
        let (_orch, store) = setup().await;
        let entry = dead("j1");
        let job_id = entry.job_id.clone();
        store.push(entry).await;

        store.discard(&job_id).await.unwrap();
        assert!(store.is_empty().await);
        assert!(matches!(
            store.discard(&job_id).await,
            Err(ConveyorError::DeadLetterNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let (orch, store) = setup().await;
        assert!(matches!(
            store.requeue("nope", &orch).await,
            Err(ConveyorError::DeadLetterNotFound { .. })
        ));
        assert!(matches!(
            store.discard("nope").await,
            Err(ConveyorError::DeadLetterNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_requeue_failure_keeps_entry() {
        let (orch, store) = setup().await;
        let job = Job::new("j1", "missing", json!({}));
        let entry = DeadLetterEntry::new(job, "missing_queue", "失败");
        let job_id = entry.job_id.clone();
        store.push(entry).await;

        // 目标队列未声明，发布失败，条目保留
        assert!(store.requeue(&job_id, &orch).await.is_err());
        assert_eq!(store.len().await, 1);
        assert!(store.get(&job_id).await.is_some());
    }
}
