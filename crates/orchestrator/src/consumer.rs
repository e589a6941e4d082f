use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_domain::{Job, JobStatus};
use conveyor_errors::{ConveyorError, ConveyorResult};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::orchestrator::Orchestrator;

/// 作业处理器回调
///
/// 实现方返回的JSON值作为作业输出；返回错误表示作业失败，
/// 消息仍视为已消费，重试与否由集群/死信层决定。
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> ConveyorResult<serde_json::Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connected,
    Consuming,
}

/// 单条消息的处理结果
///
/// 失败时携带原始作业，供死信层保留完整上下文。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub queue: String,
    pub status: JobStatus,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub job: Option<Job>,
}

/// 消费者：在一个或多个绑定队列上轮询并派发给处理器
///
/// 状态机 `Disconnected → Connected → Consuming → Disconnected`；
/// 停止信号在消息边界检查，绝不打断处理中的作业。
pub struct Consumer {
    orchestrator: Arc<Orchestrator>,
    handler: Arc<dyn JobHandler>,
    queues: RwLock<Vec<String>>,
    state: RwLock<ConsumerState>,
    stop_tx: broadcast::Sender<()>,
    outcome_tx: RwLock<Option<mpsc::UnboundedSender<JobOutcome>>>,
}

impl Consumer {
    pub fn new(orchestrator: Arc<Orchestrator>, handler: Arc<dyn JobHandler>) -> Self {
        let (stop_tx, _) = broadcast::channel(4);
        Self {
            orchestrator,
            handler,
            queues: RwLock::new(Vec::new()),
            state: RwLock::new(ConsumerState::Disconnected),
            stop_tx,
            outcome_tx: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> ConsumerState {
        *self.state.read().await
    }

    pub async fn bound_queues(&self) -> Vec<String> {
        self.queues.read().await.clone()
    }

    /// 每条处理结果额外投递到该通道（Worker层用它上报状态）
    pub async fn set_outcome_channel(&self, tx: mpsc::UnboundedSender<JobOutcome>) {
        *self.outcome_tx.write().await = Some(tx);
    }

    /// 通过模式名绑定：模式必须已在编排器注册
    pub async fn connect(&self, schema_name: &str) -> ConveyorResult<()> {
        let queue = self
            .orchestrator
            .queue_for(schema_name)
            .await
            .ok_or_else(|| ConveyorError::schema_not_found(schema_name))?;
        self.bind_queue(&queue).await;
        info!(schema = %schema_name, queue = %queue, "Consumer connected");
        Ok(())
    }

    /// 直接绑定队列名，不经过模式注册表
    pub async fn bind_queue(&self, queue: &str) {
        let mut queues = self.queues.write().await;
        if !queues.iter().any(|q| q == queue) {
            queues.push(queue.to_string());
        }
        let mut state = self.state.write().await;
        if *state == ConsumerState::Disconnected {
            *state = ConsumerState::Connected;
        }
    }

    /// 请求停止；消费循环在下一个消息边界退出
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    /// 消费消息
    ///
    /// `num_messages == 0` 表示不限数量；`queues` 为None时使用全部绑定队列。
    /// 轮询策略为队列间round-robin取第一条可用消息。阻塞模式下接收层
    /// 错误记录后休眠1秒重试；非阻塞模式直接返回错误。
    /// 返回实际处理的消息数。
    pub async fn consume(
        &self,
        num_messages: usize,
        queues: Option<Vec<String>>,
        block: bool,
    ) -> ConveyorResult<usize> {
        let queues = match queues {
            Some(qs) => qs,
            None => self.queues.read().await.clone(),
        };
        if queues.is_empty() {
            return Err(ConveyorError::Internal(
                "消费者未绑定任何队列".to_string(),
            ));
        }

        {
            let mut state = self.state.write().await;
            *state = ConsumerState::Consuming;
        }
        let result = self.consume_loop(num_messages, &queues, block).await;
        {
            let mut state = self.state.write().await;
            *state = ConsumerState::Connected;
        }
        result
    }

    async fn consume_loop(
        &self,
        num_messages: usize,
        queues: &[String],
        block: bool,
    ) -> ConveyorResult<usize> {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut processed = 0usize;
        let mut next_queue = 0usize;

        loop {
            if num_messages > 0 && processed >= num_messages {
                break;
            }
            if stop_rx.try_recv().is_ok() {
                info!("Consumer stop requested, exiting at message boundary");
                break;
            }

            // round-robin扫一圈，取第一条可用消息
            let mut received = None;
            let mut scan_error = None;
            for offset in 0..queues.len() {
                let queue = &queues[(next_queue + offset) % queues.len()];
                match self.orchestrator.receive_message(queue, false, None).await {
                    Ok(Some(raw)) => {
                        received = Some((queue.clone(), raw));
                        next_queue = (next_queue + offset + 1) % queues.len();
                        break;
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        scan_error = Some(e);
                        break;
                    }
                }
            }

            match (received, scan_error) {
                (Some((queue, raw)), _) => {
                    let outcome = self.process_message(&queue, raw).await;
                    processed += 1;
                    self.report(outcome).await;
                }
                (None, Some(e)) => {
                    if block {
                        error!("接收消息失败，1秒后重试: {}", e);
                        sleep(Duration::from_secs(1)).await;
                    } else {
                        return Err(e);
                    }
                }
                (None, None) => {
                    if block {
                        // 所有队列为空，短暂等待后重扫
                        sleep(Duration::from_millis(200)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        Ok(processed)
    }

    /// 处理一条原始消息并生成结果；任何解析或处理器失败都不panic
    pub async fn process_message(&self, queue: &str, raw: serde_json::Value) -> JobOutcome {
        if !raw.is_object() {
            warn!(queue = %queue, "丢弃非对象消息");
            let err = ConveyorError::InvalidJobPayload("消息不是JSON对象".to_string());
            return JobOutcome {
                job_id: String::new(),
                queue: queue.to_string(),
                status: JobStatus::Failed,
                output: None,
                error_message: Some(err.to_string()),
                job: None,
            };
        }

        let job: Job = match serde_json::from_value(raw.clone()) {
            Ok(job) => job,
            Err(e) => {
                warn!(queue = %queue, "消息无法解析为作业: {}", e);
                let job_id = raw
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let err = ConveyorError::InvalidJobPayload(format!("作业反序列化失败: {e}"));
                return JobOutcome {
                    job_id,
                    queue: queue.to_string(),
                    status: JobStatus::Failed,
                    output: None,
                    error_message: Some(err.to_string()),
                    job: None,
                };
            }
        };

        debug!(job_id = %job.id, queue = %queue, "Processing job");
        match self.handler.handle(&job).await {
            Ok(output) => JobOutcome {
                job_id: job.id,
                queue: queue.to_string(),
                status: JobStatus::Succeeded,
                output: Some(output),
                error_message: None,
                job: None,
            },
            Err(e) => {
                error!(job_id = %job.id, queue = %queue, "作业处理失败: {}", e);
                JobOutcome {
                    job_id: job.id.clone(),
                    queue: queue.to_string(),
                    status: JobStatus::Failed,
                    output: None,
                    error_message: Some(e.to_string()),
                    job: Some(job),
                }
            }
        }
    }

    /// 循环消费直到所有绑定队列为空
    pub async fn consume_until_empty(&self) -> ConveyorResult<usize> {
        let queues = self.queues.read().await.clone();
        let mut total = 0usize;
        loop {
            let mut depth = 0u64;
            for queue in &queues {
                depth += self.orchestrator.count_queue_messages(queue).await?;
            }
            if depth == 0 {
                break;
            }
            total += self.consume(depth as usize, None, false).await?;
        }
        Ok(total)
    }

    async fn report(&self, outcome: JobOutcome) {
        if let Some(tx) = self.outcome_tx.read().await.as_ref() {
            if tx.send(outcome).is_err() {
                warn!("结果通道已关闭，状态上报丢失");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_domain::{JobSchema, QueueKind};
    use conveyor_infrastructure::MemoryBroker;
    use serde_json::json;

    use crate::orchestrator::PublishPayload;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn handle(&self, job: &Job) -> ConveyorResult<serde_json::Value> {
            Ok(json!({"echo": job.payload}))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn handle(&self, _job: &Job) -> ConveyorResult<serde_json::Value> {
            Err(ConveyorError::Internal("处理器故障".to_string()))
        }
    }

    async fn setup(schema_name: &str) -> Arc<Orchestrator> {
        let orch = Arc::new(Orchestrator::new(Arc::new(MemoryBroker::new())));
        orch.register(
            JobSchema::new(schema_name, json!({}), json!({})),
            QueueKind::Fifo,
        )
        .await
        .unwrap();
        orch
    }

    async fn publish_input(orch: &Orchestrator, schema: &str, data: serde_json::Value) -> String {
        orch.publish(
            schema,
            PublishPayload::Input {
                schema_name: schema.to_string(),
                data,
            },
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_requires_registered_schema() {
        let orch = setup("convert").await;
        let consumer = Consumer::new(Arc::clone(&orch), Arc::new(EchoHandler));
        assert_eq!(consumer.state().await, ConsumerState::Disconnected);

        assert!(matches!(
            consumer.connect("missing").await,
            Err(ConveyorError::SchemaNotFound { .. })
        ));
        consumer.connect("convert").await.unwrap();
        assert_eq!(consumer.state().await, ConsumerState::Connected);
        assert_eq!(consumer.bound_queues().await, vec!["convert".to_string()]);
    }

    #[tokio::test]
    async fn test_consume_processes_and_reports_outcomes() {
        let orch = setup("convert").await;
        publish_input(&orch, "convert", json!({"n": 1})).await;
        publish_input(&orch, "convert", json!({"n": 2})).await;

        let consumer = Consumer::new(Arc::clone(&orch), Arc::new(EchoHandler));
        consumer.connect("convert").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        consumer.set_outcome_channel(tx).await;

        let processed = consumer.consume(2, None, false).await.unwrap();
        assert_eq!(processed, 2);
        assert_eq!(consumer.state().await, ConsumerState::Connected);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, JobStatus::Succeeded);
        assert_eq!(first.output.unwrap()["echo"]["n"], 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.output.unwrap()["echo"]["n"], 2);
    }

    #[tokio::test]
    async fn test_handler_failure_yields_failed_outcome() {
        let orch = setup("convert").await;
        let job_id = publish_input(&orch, "convert", json!({"n": 1})).await;

        let consumer = Consumer::new(Arc::clone(&orch), Arc::new(FailingHandler));
        consumer.connect("convert").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        consumer.set_outcome_channel(tx).await;

        consumer.consume(1, None, false).await.unwrap();
        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.job_id, job_id);
        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.error_message.unwrap().contains("处理器故障"));
        // 消息已消费，不回到队列
        assert_eq!(orch.count_queue_messages("convert").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_object_message_fails_without_handler() {
        let orch = setup("convert").await;
        let consumer = Consumer::new(Arc::clone(&orch), Arc::new(FailingHandler));
        let outcome = consumer.process_message("convert", json!([1, 2])).await;
        assert_eq!(outcome.status, JobStatus::Failed);
        // FailingHandler未被调用，错误来自解析层
        assert!(outcome.error_message.unwrap().contains("JSON对象"));
    }

    #[tokio::test]
    async fn test_round_robin_across_two_queues() {
        let orch = setup("a").await;
        orch.register(JobSchema::new("b", json!({}), json!({})), QueueKind::Fifo)
            .await
            .unwrap();
        publish_input(&orch, "a", json!({"q": "a"})).await;
        publish_input(&orch, "b", json!({"q": "b"})).await;

        let consumer = Consumer::new(Arc::clone(&orch), Arc::new(EchoHandler));
        consumer.connect("a").await.unwrap();
        consumer.connect("b").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        consumer.set_outcome_channel(tx).await;

        let processed = consumer.consume(0, None, false).await.unwrap();
        assert_eq!(processed, 2);
        let queues: Vec<String> = vec![rx.recv().await.unwrap().queue, rx.recv().await.unwrap().queue];
        assert!(queues.contains(&"a".to_string()));
        assert!(queues.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn test_consume_until_empty_drains_all() {
        let orch = setup("convert").await;
        for i in 0..5 {
            publish_input(&orch, "convert", json!({"n": i})).await;
        }
        let consumer = Consumer::new(Arc::clone(&orch), Arc::new(EchoHandler));
        consumer.connect("convert").await.unwrap();
        let drained = consumer.consume_until_empty().await.unwrap();
        assert_eq!(drained, 5);
        assert_eq!(orch.count_queue_messages("convert").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_exits_blocking_consume() {
        let orch = setup("convert").await;
        let consumer = Arc::new(Consumer::new(Arc::clone(&orch), Arc::new(EchoHandler)));
        consumer.connect("convert").await.unwrap();

        let handle = {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer.consume(0, None, true).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        consumer.stop();
        let processed = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(processed, 0);
    }
}
