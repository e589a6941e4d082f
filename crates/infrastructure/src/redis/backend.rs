use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_config::RedisConfig;
use conveyor_domain::{
    BrokerConnection, DeadLetterEntry, DeclareOptions, DeclareStatus, Job, OrchestratorBackend,
    QueueKind,
};
use conveyor_errors::{ConveyorError, ConveyorResult};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::catalog::QueueCatalog;
use super::connection::RedisConnectionManager;
use super::lock::RedisLock;
use super::{lock_key, queue_key, seq_key};

const LOCK_TTL: Duration = Duration::from_secs(10);
const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const PRIORITY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Redis编排后端
///
/// fifo用RPUSH/LPOP（阻塞时BLPOP），stack用RPUSH/RPOP（阻塞时BRPOP），
/// priority用ZADD/ZPOPMAX，score为优先级，成员带倒序零填充序号前缀，
/// 使同分成员按入队先后出队（ZPOPMAX同分时按成员字典序取大）。
pub struct RedisBackend {
    manager: Arc<RedisConnectionManager>,
    catalog: Arc<QueueCatalog>,
}

impl RedisBackend {
    pub async fn new(config: RedisConfig) -> ConveyorResult<Self> {
        let manager = Arc::new(RedisConnectionManager::new(config)?);
        let catalog = Arc::new(QueueCatalog::new(Arc::clone(&manager)));
        let backend = Self { manager, catalog };
        backend.connect().await?;
        Ok(backend)
    }

    async fn declared_kind(&self, queue: &str) -> ConveyorResult<QueueKind> {
        self.catalog
            .kind_of(queue)
            .await?
            .ok_or_else(|| ConveyorError::queue_not_declared(queue))
    }

    fn encode_priority_member(seq: u64, payload: &str) -> String {
        // 倒序前缀：先入队的成员字典序更大，ZPOPMAX同分时先出队
        format!("{:020}|{}", u64::MAX - seq, payload)
    }

    fn decode_priority_member(member: &str) -> &str {
        member.splitn(2, '|').nth(1).unwrap_or(member)
    }

    fn parse_payload(queue: &str, raw: &str) -> Option<serde_json::Value> {
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                // 畸形负载不会使调用方崩溃
                warn!("队列 {} 中存在畸形负载，已跳过: {}", queue, e);
                None
            }
        }
    }

    async fn pop_once(
        &self,
        queue: &str,
        kind: QueueKind,
    ) -> ConveyorResult<Option<String>> {
        let key = queue_key(queue);
        match kind {
            QueueKind::Fifo => {
                self.manager
                    .execute_command(redis::cmd("LPOP").arg(&key))
                    .await
            }
            QueueKind::Stack => {
                self.manager
                    .execute_command(redis::cmd("RPOP").arg(&key))
                    .await
            }
            QueueKind::Priority => {
                let popped: Vec<String> = self
                    .manager
                    .execute_command(redis::cmd("ZPOPMAX").arg(&key).arg(1))
                    .await?;
                // ZPOPMAX返回 [member, score]
                Ok(popped
                    .into_iter()
                    .next()
                    .map(|member| Self::decode_priority_member(&member).to_string()))
            }
        }
    }

    async fn blocking_pop(
        &self,
        queue: &str,
        kind: QueueKind,
        timeout: Option<Duration>,
    ) -> ConveyorResult<Option<String>> {
        match kind {
            QueueKind::Fifo | QueueKind::Stack => {
                let command = if kind == QueueKind::Fifo { "BLPOP" } else { "BRPOP" };
                let timeout_secs = timeout.map(|t| t.as_secs_f64()).unwrap_or(0.0);
                // 阻塞命令走独立连接，避免饿死共享连接上的其他命令
                let mut conn = self.manager.dedicated_connection().await?;
                let popped: Option<(String, String)> = redis::cmd(command)
                    .arg(queue_key(queue))
                    .arg(timeout_secs)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| {
                        ConveyorError::message_queue(format!("Redis {command} failed: {e}"))
                    })?;
                Ok(popped.map(|(_, payload)| payload))
            }
            QueueKind::Priority => {
                // ZPOPMAX没有阻塞版本，轮询直到取到或超时
                let deadline = timeout.map(|t| Instant::now() + t);
                loop {
                    if let Some(payload) = self.pop_once(queue, kind).await? {
                        return Ok(Some(payload));
                    }
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Ok(None);
                        }
                    }
                    sleep(PRIORITY_POLL_INTERVAL).await;
                }
            }
        }
    }
}

#[async_trait]
impl BrokerConnection for RedisBackend {
    async fn connect(&self) -> ConveyorResult<()> {
        self.manager.connect().await?;
        self.catalog.start().await?;
        info!("Redis后端连接就绪");
        Ok(())
    }
    async fn close(&self) -> ConveyorResult<()> {
        self.catalog.stop().await;
        self.manager.close().await;
        Ok(())
    }
    async fn is_connected(&self) -> bool {
        self.manager.is_connected().await
    }
}

#[async_trait]
impl OrchestratorBackend for RedisBackend {
    async fn declare_queue(
        &self,
        name: &str,
        kind: QueueKind,
        _opts: DeclareOptions,
    ) -> ConveyorResult<DeclareStatus> {
        let lock = RedisLock::acquire(
            Arc::clone(&self.manager),
            lock_key(name),
            LOCK_TTL,
            LOCK_ACQUIRE_TIMEOUT,
        )
        .await?;

        let result = async {
            if let Some(existing) = self.catalog.kind_of(name).await? {
                if existing != kind {
                    return Err(ConveyorError::QueueTypeMismatch {
                        name: name.to_string(),
                        declared: existing.to_string(),
                        requested: kind.to_string(),
                    });
                }
                debug!("队列 {} 已存在，跳过声明", name);
                return Ok(DeclareStatus::AlreadyExists);
            }
            self.catalog.insert(name, kind).await?;
            info!("声明Redis队列 {} ({})", name, kind);
            Ok(DeclareStatus::Created)
        }
        .await;

        lock.release().await?;
        result
    }

    async fn delete_queue(&self, name: &str) -> ConveyorResult<()> {
        let lock = RedisLock::acquire(
            Arc::clone(&self.manager),
            lock_key(name),
            LOCK_TTL,
            LOCK_ACQUIRE_TIMEOUT,
        )
        .await?;

        let result = async {
            self.declared_kind(name).await?;
            let _: () = self
                .manager
                .execute_command(redis::cmd("DEL").arg(queue_key(name)).arg(seq_key(name)))
                .await?;
            self.catalog.remove(name).await?;
            info!("删除Redis队列 {}", name);
            Ok(())
        }
        .await;

        lock.release().await?;
        result
    }

    async fn clean_queue(&self, name: &str) -> ConveyorResult<u64> {
        let lock = RedisLock::acquire(
            Arc::clone(&self.manager),
            lock_key(name),
            LOCK_TTL,
            LOCK_ACQUIRE_TIMEOUT,
        )
        .await?;

        let result = async {
            let kind = self.declared_kind(name).await?;
            let count = self.count_for(name, kind).await?;
            let _: () = self
                .manager
                .execute_command(redis::cmd("DEL").arg(queue_key(name)))
                .await?;
            Ok(count)
        }
        .await;

        lock.release().await?;
        result
    }

    async fn publish(
        &self,
        queue: &str,
        job: &Job,
        priority: Option<i64>,
    ) -> ConveyorResult<String> {
        let kind = self.declared_kind(queue).await?;
        let mut job = job.clone();
        if job.id.is_empty() {
            job.id = Uuid::new_v4().to_string();
        }
        let job_id = job.id.clone();
        let payload = job.serialize().map_err(ConveyorError::from)?;
        let key = queue_key(queue);

        match kind {
            QueueKind::Fifo | QueueKind::Stack => {
                let _: () = self
                    .manager
                    .execute_command(redis::cmd("RPUSH").arg(&key).arg(&payload))
                    .await?;
            }
            QueueKind::Priority => {
                let seq: u64 = self
                    .manager
                    .execute_command(redis::cmd("INCR").arg(seq_key(queue)))
                    .await?;
                let member = Self::encode_priority_member(seq, &payload);
                let _: () = self
                    .manager
                    .execute_command(
                        redis::cmd("ZADD")
                            .arg(&key)
                            .arg(priority.unwrap_or(0))
                            .arg(member),
                    )
                    .await?;
            }
        }
        debug!("作业 {} 已入队Redis队列 {}", job_id, queue);
        Ok(job_id)
    }

    async fn receive_message(
        &self,
        queue: &str,
        block: bool,
        timeout: Option<Duration>,
    ) -> ConveyorResult<Option<serde_json::Value>> {
        let kind = self.declared_kind(queue).await?;
        let popped = if block {
            self.blocking_pop(queue, kind, timeout).await?
        } else {
            self.pop_once(queue, kind).await?
        };
        Ok(popped.and_then(|raw| Self::parse_payload(queue, &raw)))
    }

    async fn count_queue_messages(&self, queue: &str) -> ConveyorResult<u64> {
        let kind = self.declared_kind(queue).await?;
        self.count_for(queue, kind).await
    }

    async fn move_to_dlq(
        &self,
        source_queue: &str,
        dlq: &str,
        job: &Job,
        error_details: &str,
    ) -> ConveyorResult<()> {
        // 死信队列懒声明为fifo；消息永不丢失
        if self.catalog.kind_of(dlq).await?.is_none() {
            self.declare_queue(dlq, QueueKind::Fifo, DeclareOptions::default())
                .await?;
        }
        let entry = DeadLetterEntry::new(job.clone(), source_queue, error_details);
        let payload = serde_json::to_string(&entry).map_err(ConveyorError::from)?;
        let _: () = self
            .manager
            .execute_command(redis::cmd("RPUSH").arg(queue_key(dlq)).arg(payload))
            .await?;
        warn!(
            "作业 {} 从队列 {} 移入死信队列 {}",
            job.id, source_queue, dlq
        );
        Ok(())
    }
}

impl RedisBackend {
    async fn count_for(&self, queue: &str, kind: QueueKind) -> ConveyorResult<u64> {
        let key = queue_key(queue);
        let command = match kind {
            QueueKind::Fifo | QueueKind::Stack => "LLEN",
            QueueKind::Priority => "ZCARD",
        };
        self.manager
            .execute_command(redis::cmd(command).arg(&key))
            .await
    }
}
