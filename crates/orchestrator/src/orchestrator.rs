use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conveyor_domain::{
    DeclareOptions, DeclareStatus, Job, JobSchema, JobStatus, OrchestratorBackend, QueueKind,
};
use conveyor_errors::{ConveyorError, ConveyorResult};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 可发布的负载：完整作业，或通过已注册模式解析的类型化输入
#[derive(Debug, Clone)]
pub enum PublishPayload {
    Job(Job),
    Input {
        schema_name: String,
        data: serde_json::Value,
    },
}

struct RegisteredSchema {
    schema: JobSchema,
    queue_name: String,
}

/// 作业编排门面
///
/// 持有后端接口和模式注册表。队列以模式名命名，注册即声明；
/// 同名模式重复注册幂等，模式定义以最后一次为准。
pub struct Orchestrator {
    backend: Arc<dyn OrchestratorBackend>,
    schemas: RwLock<HashMap<String, RegisteredSchema>>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn OrchestratorBackend>) -> Self {
        Self {
            backend,
            schemas: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> Arc<dyn OrchestratorBackend> {
        Arc::clone(&self.backend)
    }

    /// 注册作业模式并声明其后备队列，返回队列名
    pub async fn register(&self, schema: JobSchema, kind: QueueKind) -> ConveyorResult<String> {
        let queue_name = schema.name.clone();
        let status = self
            .backend
            .declare_queue(&queue_name, kind, DeclareOptions::default())
            .await?;
        match status {
            DeclareStatus::Created => {
                info!(schema = %schema.name, queue = %queue_name, %kind, "Registered job schema");
            }
            DeclareStatus::AlreadyExists => {
                debug!(schema = %schema.name, "Schema re-registered, definition updated");
            }
        }

        let mut schemas = self.schemas.write().await;
        schemas.insert(
            schema.name.clone(),
            RegisteredSchema {
                schema,
                queue_name: queue_name.clone(),
            },
        );
        Ok(queue_name)
    }

    /// 查询模式对应的队列名，供消费者绑定
    pub async fn queue_for(&self, schema_name: &str) -> Option<String> {
        self.schemas
            .read()
            .await
            .get(schema_name)
            .map(|r| r.queue_name.clone())
    }

    /// 发布作业到队列，返回作业id
    ///
    /// 类型化输入先通过注册表解析模式并校验输入契约，再转换为
    /// `Queued` 状态的作业。
    pub async fn publish(
        &self,
        queue: &str,
        payload: PublishPayload,
        priority: Option<i64>,
    ) -> ConveyorResult<String> {
        let job = match payload {
            PublishPayload::Job(mut job) => {
                if job.id.is_empty() {
                    // 外部构造的作业允许缺id，发布前补齐
                    job.id = uuid::Uuid::new_v4().to_string();
                }
                job.with_status(JobStatus::Queued)
            }
            PublishPayload::Input { schema_name, data } => {
                let schemas = self.schemas.read().await;
                let registered = schemas
                    .get(&schema_name)
                    .ok_or_else(|| ConveyorError::schema_not_found(&schema_name))?;
                Job::from_schema(&registered.schema, data)?.with_status(JobStatus::Queued)
            }
        };

        let job_id = self.backend.publish(queue, &job, priority).await?;
        debug!(queue = %queue, job_id = %job_id, "Job published");
        Ok(job_id)
    }

    pub async fn receive_message(
        &self,
        queue: &str,
        block: bool,
        timeout: Option<Duration>,
    ) -> ConveyorResult<Option<serde_json::Value>> {
        self.backend.receive_message(queue, block, timeout).await
    }

    pub async fn count_queue_messages(&self, queue: &str) -> ConveyorResult<u64> {
        self.backend.count_queue_messages(queue).await
    }

    pub async fn clean_queue(&self, queue: &str) -> ConveyorResult<u64> {
        self.backend.clean_queue(queue).await
    }

    /// 删除队列并移除指向它的模式映射
    pub async fn delete_queue(&self, queue: &str) -> ConveyorResult<()> {
        self.backend.delete_queue(queue).await?;
        let mut schemas = self.schemas.write().await;
        schemas.retain(|_, r| r.queue_name != queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_infrastructure::MemoryBroker;
    use serde_json::json;

    fn schema(name: &str) -> JobSchema {
        JobSchema::new(name, json!({"required": ["path"]}), json!({}))
    }

    async fn orchestrator() -> Orchestrator {
        Orchestrator::new(Arc::new(MemoryBroker::new()))
    }

    #[tokio::test]
    async fn test_register_declares_queue_named_after_schema() {
        let orch = orchestrator().await;
        let queue = orch.register(schema("convert"), QueueKind::Fifo).await.unwrap();
        assert_eq!(queue, "convert");
        assert_eq!(orch.count_queue_messages("convert").await.unwrap(), 0);
        assert_eq!(orch.queue_for("convert").await.as_deref(), Some("convert"));
    }

    #[tokio::test]
    async fn test_register_idempotent_last_definition_wins() {
        let orch = orchestrator().await;
        orch.register(schema("convert"), QueueKind::Fifo).await.unwrap();
        orch.publish(
            "convert",
            PublishPayload::Input {
                schema_name: "convert".to_string(),
                data: json!({"path": "/a"}),
            },
            None,
        )
        .await
        .unwrap();

        // 重注册不清空队列，新定义生效
        let relaxed = JobSchema::new("convert", json!({}), json!({}));
        orch.register(relaxed, QueueKind::Fifo).await.unwrap();
        assert_eq!(orch.count_queue_messages("convert").await.unwrap(), 1);
        orch.publish(
            "convert",
            PublishPayload::Input {
                schema_name: "convert".to_string(),
                data: json!({"other": 1}),
            },
            None,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_register_kind_change_rejected() {
        let orch = orchestrator().await;
        orch.register(schema("convert"), QueueKind::Fifo).await.unwrap();
        let err = orch.register(schema("convert"), QueueKind::Priority).await;
        assert!(matches!(err, Err(ConveyorError::QueueTypeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_publish_input_validates_contract() {
        let orch = orchestrator().await;
        orch.register(schema("convert"), QueueKind::Fifo).await.unwrap();

        let err = orch
            .publish(
                "convert",
                PublishPayload::Input {
                    schema_name: "convert".to_string(),
                    data: json!({"wrong": true}),
                },
                None,
            )
            .await;
        assert!(matches!(err, Err(ConveyorError::ValidationError(_))));
        assert_eq!(orch.count_queue_messages("convert").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_unregistered_schema_fails() {
        let orch = orchestrator().await;
        orch.register(schema("convert"), QueueKind::Fifo).await.unwrap();
        let err = orch
            .publish(
                "convert",
                PublishPayload::Input {
                    schema_name: "missing".to_string(),
                    data: json!({}),
                },
                None,
            )
            .await;
        assert!(matches!(err, Err(ConveyorError::SchemaNotFound { .. })));
    }

    #[tokio::test]
    async fn test_publish_job_queues_with_status() {
        let orch = orchestrator().await;
        orch.register(schema("convert"), QueueKind::Fifo).await.unwrap();

        let job = Job::new("j1", "convert", json!({"path": "/a"}));
        let id = orch
            .publish("convert", PublishPayload::Job(job.clone()), None)
            .await
            .unwrap();
        assert_eq!(id, job.id);

        let raw = orch.receive_message("convert", false, None).await.unwrap().unwrap();
        let received = Job::deserialize_bytes(&serde_json::to_vec(&raw).unwrap()).unwrap();
        assert_eq!(received.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_delete_queue_clears_schema_mapping() {
        let orch = orchestrator().await;
        orch.register(schema("convert"), QueueKind::Fifo).await.unwrap();
        orch.delete_queue("convert").await.unwrap();
        assert!(orch.queue_for("convert").await.is_none());
    }
}
