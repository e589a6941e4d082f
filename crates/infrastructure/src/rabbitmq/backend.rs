use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use conveyor_config::RabbitmqConfig;
use conveyor_domain::{
    BrokerConnection, DeadLetterEntry, DeclareOptions, DeclareStatus, Job, OrchestratorBackend,
    QueueKind,
};
use conveyor_errors::{ConveyorError, ConveyorResult};
use lapin::options::{
    BasicGetOptions, BasicPublishOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, ExchangeKind};
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::RabbitmqConnection;

const GET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_MAX_PRIORITY: u8 = 10;

/// 本地记录的队列元数据，用于类型不匹配检测和优先级属性标注
#[derive(Debug, Clone, Copy)]
struct QueueMeta {
    kind: QueueKind,
    max_priority: Option<u8>,
}

/// RabbitMQ编排后端
///
/// 队列声明依赖代理的幂等declare语义，存在性用passive探测；
/// 优先级队列通过 x-max-priority 声明，消息携带priority属性。
/// RabbitMQ没有LIFO队列，stack类型显式返回不支持。
pub struct RabbitmqBackend {
    connection: RabbitmqConnection,
    queues: RwLock<HashMap<String, QueueMeta>>,
    exchanges: RwLock<HashSet<String>>,
}

impl RabbitmqBackend {
    pub async fn new(config: RabbitmqConfig) -> ConveyorResult<Self> {
        let backend = Self {
            connection: RabbitmqConnection::new(config),
            queues: RwLock::new(HashMap::new()),
            exchanges: RwLock::new(HashSet::new()),
        };
        backend.connection.connect().await?;
        Ok(backend)
    }

    fn is_not_found(err: &lapin::Error) -> bool {
        let msg = err.to_string();
        msg.contains("NOT_FOUND") || msg.contains("404")
    }

    /// passive探测队列是否存在；存在时返回消息数
    async fn probe_queue(&self, name: &str) -> ConveyorResult<Option<u32>> {
        let channel = self.connection.channel().await?;
        match channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => Ok(Some(queue.message_count())),
            Err(e) if Self::is_not_found(&e) => Ok(None),
            Err(e) => Err(ConveyorError::message_queue(format!(
                "探测队列 {name} 失败: {e}"
            ))),
        }
    }

    /// passive探测交换机是否存在
    async fn probe_exchange(&self, name: &str) -> ConveyorResult<bool> {
        let channel = self.connection.channel().await?;
        match channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if Self::is_not_found(&e) => Ok(false),
            Err(e) => Err(ConveyorError::message_queue(format!(
                "探测交换机 {name} 失败: {e}"
            ))),
        }
    }

    async fn meta_of(&self, queue: &str) -> ConveyorResult<QueueMeta> {
        if let Some(meta) = self.queues.read().await.get(queue) {
            return Ok(*meta);
        }
        // 本进程未声明过：其他进程可能已在代理上声明，passive探测确认
        if self.probe_queue(queue).await?.is_some() {
            let meta = QueueMeta {
                kind: QueueKind::Fifo,
                max_priority: None,
            };
            self.queues.write().await.insert(queue.to_string(), meta);
            return Ok(meta);
        }
        Err(ConveyorError::queue_not_declared(queue))
    }

    async fn basic_get_once(&self, queue: &str) -> ConveyorResult<Option<Vec<u8>>> {
        let channel = self.connection.channel().await?;
        match channel.basic_get(queue, BasicGetOptions::default()).await {
            Ok(Some(delivery)) => {
                channel
                    .basic_ack(delivery.delivery_tag, Default::default())
                    .await
                    .map_err(|e| ConveyorError::message_queue(format!("确认消息失败: {e}")))?;
                Ok(Some(delivery.delivery.data))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(ConveyorError::message_queue(format!(
                "从队列 {queue} 获取消息失败: {e}"
            ))),
        }
    }
}

#[async_trait]
impl BrokerConnection for RabbitmqBackend {
    async fn connect(&self) -> ConveyorResult<()> {
        self.connection.connect().await
    }
    async fn close(&self) -> ConveyorResult<()> {
        self.connection.close().await
    }
    async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }
}

#[async_trait]
impl OrchestratorBackend for RabbitmqBackend {
    async fn declare_queue(
        &self,
        name: &str,
        kind: QueueKind,
        opts: DeclareOptions,
    ) -> ConveyorResult<DeclareStatus> {
        if kind == QueueKind::Stack {
            return Err(ConveyorError::NotSupported(
                "RabbitMQ不支持stack队列".to_string(),
            ));
        }
        if let Some(existing) = self.queues.read().await.get(name) {
            if existing.kind != kind {
                return Err(ConveyorError::QueueTypeMismatch {
                    name: name.to_string(),
                    declared: existing.kind.to_string(),
                    requested: kind.to_string(),
                });
            }
        }

        let already_exists = self.probe_queue(name).await?.is_some();

        let max_priority = match kind {
            QueueKind::Priority => Some(opts.max_priority.unwrap_or(DEFAULT_MAX_PRIORITY)),
            _ => opts.max_priority,
        };
        let mut arguments = FieldTable::default();
        if let Some(max_priority) = max_priority {
            arguments.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(max_priority));
        }

        let channel = self.connection.channel().await?;
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: opts.durable,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| ConveyorError::message_queue(format!("声明队列 {name} 失败: {e}")))?;

        if let Some(exchange) = &opts.exchange {
            if !self.probe_exchange(exchange).await? {
                if !opts.create_exchange {
                    // 不隐式创建交换机，快速失败
                    return Err(ConveyorError::Configuration(format!(
                        "交换机 {exchange} 不存在；如需创建请显式传入create_exchange"
                    )));
                }
                self.declare_exchange(exchange).await?;
            }
            channel
                .queue_bind(
                    name,
                    exchange,
                    name,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    ConveyorError::message_queue(format!(
                        "绑定队列 {name} 到交换机 {exchange} 失败: {e}"
                    ))
                })?;
        }

        self.queues
            .write()
            .await
            .insert(name.to_string(), QueueMeta { kind, max_priority });

        if already_exists {
            debug!("队列 {} 已存在，声明幂等返回", name);
            Ok(DeclareStatus::AlreadyExists)
        } else {
            info!("声明RabbitMQ队列 {} ({})", name, kind);
            Ok(DeclareStatus::Created)
        }
    }

    async fn delete_queue(&self, name: &str) -> ConveyorResult<()> {
        self.meta_of(name).await?;
        let channel = self.connection.channel().await?;
        channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|e| ConveyorError::message_queue(format!("删除队列 {name} 失败: {e}")))?;
        self.queues.write().await.remove(name);
        info!("队列 {} 已删除", name);
        Ok(())
    }

    async fn clean_queue(&self, name: &str) -> ConveyorResult<u64> {
        self.meta_of(name).await?;
        let channel = self.connection.channel().await?;
        let purged = channel
            .queue_purge(name, QueuePurgeOptions::default())
            .await
            .map_err(|e| ConveyorError::message_queue(format!("清空队列 {name} 失败: {e}")))?;
        debug!("队列 {} 已清空 {} 条消息", name, purged);
        Ok(purged as u64)
    }

    async fn publish(
        &self,
        queue: &str,
        job: &Job,
        priority: Option<i64>,
    ) -> ConveyorResult<String> {
        let meta = self.meta_of(queue).await?;
        let mut job = job.clone();
        if job.id.is_empty() {
            job.id = Uuid::new_v4().to_string();
        }
        let job_id = job.id.clone();
        let payload = job.serialize_bytes().map_err(ConveyorError::from)?;

        let mut properties = BasicProperties::default().with_delivery_mode(2); // 2 = persistent
        if meta.max_priority.is_some() {
            // 声明了max_priority的队列才携带priority属性；负值按0处理
            let priority = priority.unwrap_or(0).clamp(0, u8::MAX as i64) as u8;
            properties = properties.with_priority(priority);
        }

        let channel = self.connection.channel().await?;
        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| {
                ConveyorError::message_queue(format!("发布消息到队列 {queue} 失败: {e}"))
            })?;
        confirm
            .await
            .map_err(|e| ConveyorError::message_queue(format!("消息发布确认失败: {e}")))?;

        debug!("作业 {} 已发布到队列: {}", job_id, queue);
        Ok(job_id)
    }

    async fn receive_message(
        &self,
        queue: &str,
        block: bool,
        timeout: Option<Duration>,
    ) -> ConveyorResult<Option<serde_json::Value>> {
        self.meta_of(queue).await?;

        let data = if block {
            // basic_get没有阻塞版本，轮询直到取到或超时
            let deadline = timeout.map(|t| Instant::now() + t);
            loop {
                if let Some(data) = self.basic_get_once(queue).await? {
                    break Some(data);
                }
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        break None;
                    }
                }
                sleep(GET_POLL_INTERVAL).await;
            }
        } else {
            self.basic_get_once(queue).await?
        };

        Ok(data.and_then(|data| match serde_json::from_slice(&data) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("队列 {} 中存在畸形负载，已跳过: {}", queue, e);
                None
            }
        }))
    }

    async fn count_queue_messages(&self, queue: &str) -> ConveyorResult<u64> {
        match self.probe_queue(queue).await? {
            Some(count) => Ok(count as u64),
            None => Err(ConveyorError::queue_not_declared(queue)),
        }
    }

    async fn move_to_dlq(
        &self,
        source_queue: &str,
        dlq: &str,
        job: &Job,
        error_details: &str,
    ) -> ConveyorResult<()> {
        if self.probe_queue(dlq).await?.is_none() {
            self.declare_queue(
                dlq,
                QueueKind::Fifo,
                DeclareOptions {
                    durable: true,
                    ..Default::default()
                },
            )
            .await?;
        }
        let entry = DeadLetterEntry::new(job.clone(), source_queue, error_details);
        let payload = serde_json::to_vec(&entry).map_err(ConveyorError::from)?;
        let channel = self.connection.channel().await?;
        let confirm = channel
            .basic_publish(
                "",
                dlq,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| ConveyorError::message_queue(format!("写入死信队列 {dlq} 失败: {e}")))?;
        confirm
            .await
            .map_err(|e| ConveyorError::message_queue(format!("死信消息确认失败: {e}")))?;
        warn!(
            "作业 {} 从队列 {} 移入死信队列 {}",
            job.id, source_queue, dlq
        );
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> ConveyorResult<()> {
        let channel = self.connection.channel().await?;
        channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConveyorError::message_queue(format!("声明交换机 {name} 失败: {e}")))?;
        self.exchanges.write().await.insert(name.to_string());
        info!("声明交换机 {}", name);
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> ConveyorResult<()> {
        let channel = self.connection.channel().await?;
        channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|e| ConveyorError::message_queue(format!("删除交换机 {name} 失败: {e}")))?;
        self.exchanges.write().await.remove(name);
        Ok(())
    }

    async fn count_exchanges(&self) -> ConveyorResult<u64> {
        // AMQP没有列举交换机的原语，计数基于本进程声明过的集合
        Ok(self.exchanges.read().await.len() as u64)
    }
}
