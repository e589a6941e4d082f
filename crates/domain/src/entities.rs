use chrono::{DateTime, Utc};
use conveyor_errors::{ConveyorError, ConveyorResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 作业模式：命名的输入/输出契约
///
/// 队列以模式为单位声明，生产者提交的负载必须满足 `input_schema` 的约束。
/// 同名模式的重复注册在编排器层是幂等的。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSchema {
    pub name: String,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
}

impl JobSchema {
    pub fn new(
        name: impl Into<String>,
        input_schema: serde_json::Value,
        output_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            input_schema,
            output_schema,
        }
    }

    /// 校验类型化输入是否满足输入契约
    ///
    /// 输入必须是JSON对象，并且包含契约中 `required` 数组列出的所有属性。
    pub fn validate_input(&self, input: &serde_json::Value) -> ConveyorResult<()> {
        let obj = input.as_object().ok_or_else(|| {
            ConveyorError::validation_error(format!(
                "模式 {} 的输入必须是JSON对象",
                self.name
            ))
        })?;

        if let Some(required) = self.input_schema.get("required").and_then(|r| r.as_array()) {
            for field in required {
                if let Some(field_name) = field.as_str() {
                    if !obj.contains_key(field_name) {
                        return Err(ConveyorError::validation_error(format!(
                            "模式 {} 的输入缺少必需字段: {field_name}",
                            self.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Queued,
    Running,
    Succeeded,
    // Failed 与 Error 保持为两个独立取值，死信处理上语义一致
    Failed,
    Error,
}

impl JobStatus {
    /// 该状态是否触发死信处理
    pub fn is_dead_letter(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Error)
    }
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Error
        )
    }
}

/// 一个提交的工作单元
///
/// `id` 在创建时生成且全局唯一；`created_at` 创建后不再变更。
/// 所有权从生产者转移到队列，再转移到成功接收它的消费者（至少一次投递）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub schema_name: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        schema_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            schema_name: schema_name.into(),
            payload,
            status: JobStatus::Created,
            created_at: Utc::now(),
        }
    }

    /// 基于已注册模式和类型化输入构造作业
    pub fn from_schema(schema: &JobSchema, input: serde_json::Value) -> ConveyorResult<Self> {
        schema.validate_input(&input)?;
        Ok(Self::new(schema.name.clone(), schema.name.clone(), input))
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
    pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
    pub fn serialize_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
    pub fn deserialize_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// 死信条目：处理失败、等待运维决策的作业
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: String,
    pub job: Job,
    pub source_queue: String,
    pub error_details: String,
    pub dead_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(job: Job, source_queue: impl Into<String>, error_details: impl Into<String>) -> Self {
        let mut error_details = error_details.into();
        if error_details.is_empty() {
            // 死信条目的错误原因不允许为空
            error_details = "未提供错误详情".to_string();
        }
        Self {
            job_id: job.id.clone(),
            job,
            source_queue: source_queue.into(),
            error_details,
            dead_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStatus {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "NONEXISTENT")]
    Nonexistent,
}

/// 集群侧缓存的Worker记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub worker_url: String,
    pub worker_type: String,
    pub status: WorkerStatus,
    pub current_job_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(
        worker_id: impl Into<String>,
        worker_url: impl Into<String>,
        worker_type: impl Into<String>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_url: worker_url.into(),
            worker_type: worker_type.into(),
            status: WorkerStatus::Idle,
            current_job_id: None,
            last_heartbeat: Utc::now(),
        }
    }
}

/// 作业类型的路由目标，同一作业类型最多一个，后注册者覆盖
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobTarget {
    /// 直接路由到指定Worker
    Worker { url: String },
    /// 网关式转发到另一个已注册应用的端点
    Endpoint { url: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Queued,
    Error,
}

/// `submit_job` 的返回结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub status: SubmitStatus,
    pub job_id: Option<String>,
    pub message: Option<String>,
}

impl SubmitOutcome {
    pub fn queued(job_id: impl Into<String>) -> Self {
        Self {
            status: SubmitStatus::Queued,
            job_id: Some(job_id.into()),
            message: None,
        }
    }
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: SubmitStatus::Error,
            job_id: None,
            message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> JobSchema {
        JobSchema::new(
            "scan_reconstruct",
            json!({"required": ["scan_id", "quality"]}),
            json!({"required": ["mesh_url"]}),
        )
    }

    #[test]
    fn test_validate_input_accepts_complete_object() {
        let s = schema();
        assert!(s
            .validate_input(&json!({"scan_id": "s1", "quality": "high", "extra": 1}))
            .is_ok());
    }

    #[test]
    fn test_validate_input_rejects_missing_field() {
        let s = schema();
        let err = s.validate_input(&json!({"scan_id": "s1"})).unwrap_err();
        assert!(err.to_string().contains("quality"));
    }

    #[test]
    fn test_validate_input_rejects_non_object() {
        let s = schema();
        assert!(s.validate_input(&json!([1, 2, 3])).is_err());
        assert!(s.validate_input(&json!("payload")).is_err());
    }

    #[test]
    fn test_job_from_schema() {
        let s = schema();
        let job = Job::from_schema(&s, json!({"scan_id": "s1", "quality": "low"})).unwrap();
        assert_eq!(job.schema_name, "scan_reconstruct");
        assert_eq!(job.status, JobStatus::Created);
        assert!(!job.id.is_empty());
    }

    #[test]
    fn test_job_wire_round_trip() {
        let job = Job::new("j", "scan_reconstruct", json!({"scan_id": "s1"}));
        let wire = job.serialize().unwrap();
        let back = Job::deserialize(&wire).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.created_at, job.created_at);
        assert_eq!(back.payload, job.payload);
    }

    #[test]
    fn test_dead_letter_entry_never_empty_details() {
        let job = Job::new("j", "s", json!({}));
        let entry = DeadLetterEntry::new(job, "q", "");
        assert!(!entry.error_details.is_empty());
    }

    #[test]
    fn test_status_classification() {
        assert!(JobStatus::Failed.is_dead_letter());
        assert!(JobStatus::Error.is_dead_letter());
        assert!(!JobStatus::Succeeded.is_dead_letter());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_worker_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&WorkerStatus::Nonexistent).unwrap(),
            "\"NONEXISTENT\""
        );
        assert_eq!(serde_json::to_string(&WorkerStatus::Idle).unwrap(), "\"IDLE\"");
    }
}
