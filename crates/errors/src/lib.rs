use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConveyorError {
    #[error("队列未声明: {name}")]
    QueueNotDeclared { name: String },
    #[error("队列 {name} 类型不匹配: 已声明为 {declared}, 请求为 {requested}")]
    QueueTypeMismatch {
        name: String,
        declared: String,
        requested: String,
    },
    #[error("队列为空")]
    QueueEmpty,
    #[error("作业模式未注册: {name}")]
    SchemaNotFound { name: String },
    #[error("无效的作业负载: {0}")]
    InvalidJobPayload(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("消息队列错误: {0}")]
    MessageQueue(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("不支持的操作: {0}")]
    NotSupported(String),
    #[error("死信队列中不存在作业: {job_id}")]
    DeadLetterNotFound { job_id: String },
    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },
    #[error("节点不可达: {url} - {reason}")]
    NodeUnreachable { url: String, reason: String },
    #[error("作业类型 {job_type} 没有注册任何路由目标")]
    RoutingNotFound { job_type: String },
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type ConveyorResult<T> = Result<T, ConveyorError>;

impl ConveyorError {
    pub fn queue_not_declared<S: Into<String>>(name: S) -> Self {
        Self::QueueNotDeclared { name: name.into() }
    }
    pub fn schema_not_found<S: Into<String>>(name: S) -> Self {
        Self::SchemaNotFound { name: name.into() }
    }
    pub fn message_queue<S: Into<String>>(msg: S) -> Self {
        Self::MessageQueue(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn dead_letter_not_found<S: Into<String>>(job_id: S) -> Self {
        Self::DeadLetterNotFound {
            job_id: job_id.into(),
        }
    }
    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConveyorError::MessageQueue(_)
                | ConveyorError::Network(_)
                | ConveyorError::Timeout(_)
        )
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConveyorError::Configuration(_) | ConveyorError::Internal(_)
        )
    }
}

impl From<serde_json::Error> for ConveyorError {
    fn from(err: serde_json::Error) -> Self {
        ConveyorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ConveyorError {
    fn from(err: anyhow::Error) -> Self {
        ConveyorError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ConveyorError::MessageQueue("连接断开".to_string()).is_retryable());
        assert!(ConveyorError::Network("dns".to_string()).is_retryable());
        assert!(!ConveyorError::QueueEmpty.is_retryable());
        assert!(ConveyorError::Configuration("bad".to_string()).is_fatal());
        assert!(!ConveyorError::QueueEmpty.is_fatal());
    }

    #[test]
    fn test_helper_constructors() {
        let err = ConveyorError::queue_not_declared("jobs");
        assert!(matches!(err, ConveyorError::QueueNotDeclared { ref name } if name == "jobs"));

        let err = ConveyorError::dead_letter_not_found("abc-123");
        assert_eq!(err.to_string(), "死信队列中不存在作业: abc-123");
    }

    #[test]
    fn test_serde_json_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ConveyorError = json_err.into();
        assert!(matches!(err, ConveyorError::Serialization(_)));
    }
}
