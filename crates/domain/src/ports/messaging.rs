use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_errors::{ConveyorError, ConveyorResult};
use serde::{Deserialize, Serialize};

use crate::entities::Job;

/// 队列的排序规则，声明后固定，不删除重建不可变更
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Fifo,
    Stack,
    Priority,
}

impl Default for QueueKind {
    fn default() -> Self {
        QueueKind::Fifo
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Fifo => write!(f, "fifo"),
            QueueKind::Stack => write!(f, "stack"),
            QueueKind::Priority => write!(f, "priority"),
        }
    }
}

impl QueueKind {
    pub fn parse(s: &str) -> ConveyorResult<Self> {
        match s.to_lowercase().as_str() {
            "fifo" => Ok(QueueKind::Fifo),
            "stack" => Ok(QueueKind::Stack),
            "priority" => Ok(QueueKind::Priority),
            other => Err(ConveyorError::Configuration(format!(
                "不支持的队列类型: {other}，支持的类型: fifo, stack, priority"
            ))),
        }
    }
}

/// 队列声明的附加选项
#[derive(Debug, Clone, Default)]
pub struct DeclareOptions {
    /// RabbitMQ: 队列的最大优先级 (x-max-priority)
    pub max_priority: Option<u8>,
    /// RabbitMQ: 绑定到的交换机
    pub exchange: Option<String>,
    /// 绑定到不存在的交换机时是否创建；false时快速失败
    pub create_exchange: bool,
    pub durable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareStatus {
    Created,
    AlreadyExists,
}

/// 面向代理的编排后端接口
///
/// 每种代理（内存、Redis、RabbitMQ）一个实现；编排器门面只持有该接口，
/// 从不区分具体类型。所有队列操作对未声明的队列返回 `QueueNotDeclared`。
#[async_trait]
pub trait OrchestratorBackend: Send + Sync {
    /// 声明队列；幂等。同名同类型返回 `AlreadyExists` 且不清空内容，
    /// 同名不同类型返回 `QueueTypeMismatch`。
    async fn declare_queue(
        &self,
        name: &str,
        kind: QueueKind,
        opts: DeclareOptions,
    ) -> ConveyorResult<DeclareStatus>;

    /// 删除队列声明以及所有未消费消息
    async fn delete_queue(&self, name: &str) -> ConveyorResult<()>;

    /// 清空队列，返回被清除的消息数量
    async fn clean_queue(&self, name: &str) -> ConveyorResult<u64>;

    /// 序列化并入队一条作业消息，返回作业id
    async fn publish(
        &self,
        queue: &str,
        job: &Job,
        priority: Option<i64>,
    ) -> ConveyorResult<String>;

    /// 按队列排序规则取出下一条消息
    ///
    /// 空队列/超时返回 `Ok(None)`；存储中的畸形负载解析为 `None`，
    /// 不会使调用方崩溃。
    async fn receive_message(
        &self,
        queue: &str,
        block: bool,
        timeout: Option<Duration>,
    ) -> ConveyorResult<Option<serde_json::Value>>;

    async fn count_queue_messages(&self, queue: &str) -> ConveyorResult<u64>;

    /// 把失败作业记录到死信队列；契约是"消息永不丢失"，
    /// 具体代理可以把持久化委托给集群层的死信存储。
    async fn move_to_dlq(
        &self,
        source_queue: &str,
        dlq: &str,
        job: &Job,
        error_details: &str,
    ) -> ConveyorResult<()>;

    // 交换机操作只有RabbitMQ支持，其余代理显式返回不支持
    async fn declare_exchange(&self, _name: &str) -> ConveyorResult<()> {
        Err(ConveyorError::NotSupported(
            "该代理不支持交换机操作".to_string(),
        ))
    }
    async fn delete_exchange(&self, _name: &str) -> ConveyorResult<()> {
        Err(ConveyorError::NotSupported(
            "该代理不支持交换机操作".to_string(),
        ))
    }
    async fn count_exchanges(&self) -> ConveyorResult<u64> {
        Err(ConveyorError::NotSupported(
            "该代理不支持交换机操作".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_kind_parse() {
        assert_eq!(QueueKind::parse("fifo").unwrap(), QueueKind::Fifo);
        assert_eq!(QueueKind::parse("STACK").unwrap(), QueueKind::Stack);
        assert_eq!(QueueKind::parse("Priority").unwrap(), QueueKind::Priority);
        assert!(QueueKind::parse("ring").is_err());
    }

    #[test]
    fn test_queue_kind_display() {
        assert_eq!(QueueKind::Priority.to_string(), "priority");
        assert_eq!(QueueKind::default(), QueueKind::Fifo);
    }
}
