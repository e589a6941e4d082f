use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::JobStatus;

/// 集群状态队列上的控制消息信封
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    JobStatusUpdate(JobStatusUpdate),
    WorkerHeartbeat(WorkerHeartbeat),
}

/// Worker汇报的单个作业状态变更
///
/// 失败变更附带完整作业，死信层据此保留重新入队所需的负载。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    pub job_id: String,
    pub schema_name: String,
    pub source_queue: String,
    pub status: JobStatus,
    pub worker_id: String,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub job: Option<crate::entities::Job>,
    pub timestamp: DateTime<Utc>,
}

/// Worker周期性心跳
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub worker_url: String,
    pub current_job_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ControlMessage {
    pub fn status_update(update: JobStatusUpdate) -> Self {
        ControlMessage::JobStatusUpdate(update)
    }
    pub fn heartbeat(heartbeat: WorkerHeartbeat) -> Self {
        ControlMessage::WorkerHeartbeat(heartbeat)
    }
    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
    pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
    pub fn message_type_str(&self) -> &'static str {
        match self {
            ControlMessage::JobStatusUpdate(_) => "job_status_update",
            ControlMessage::WorkerHeartbeat(_) => "worker_heartbeat",
        }
    }

    /// 包装为作业信封，使控制消息能走统一的发布通道
    pub fn to_job(&self, status_queue: &str) -> Result<crate::entities::Job, serde_json::Error> {
        Ok(crate::entities::Job::new(
            self.message_type_str(),
            status_queue,
            serde_json::to_value(self)?,
        ))
    }

    /// 从队列取出的原始作业信封中还原控制消息
    pub fn from_queued(raw: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let payload = raw.get("payload").cloned().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_round_trip() {
        let msg = ControlMessage::status_update(JobStatusUpdate {
            job_id: "j-1".to_string(),
            schema_name: "scan".to_string(),
            source_queue: "scan".to_string(),
            status: JobStatus::Failed,
            worker_id: "w-1".to_string(),
            output: None,
            error_message: Some("boom".to_string()),
            job: None,
            timestamp: Utc::now(),
        });
        let wire = msg.serialize().unwrap();
        let back = ControlMessage::deserialize(&wire).unwrap();
        assert_eq!(back.message_type_str(), "job_status_update");
        if let ControlMessage::JobStatusUpdate(update) = back {
            assert_eq!(update.status, JobStatus::Failed);
            assert_eq!(update.error_message.as_deref(), Some("boom"));
        } else {
            panic!("expected JobStatusUpdate");
        }
    }

    #[test]
    fn test_control_message_job_envelope() {
        let msg = ControlMessage::heartbeat(WorkerHeartbeat {
            worker_id: "w-1".to_string(),
            worker_url: "http://127.0.0.1:9000".to_string(),
            current_job_id: None,
            timestamp: Utc::now(),
        });
        let job = msg.to_job("cluster_status").unwrap();
        assert_eq!(job.name, "worker_heartbeat");
        assert_eq!(job.schema_name, "cluster_status");

        let raw = job.to_value().unwrap();
        let back = ControlMessage::from_queued(&raw).unwrap();
        assert_eq!(back.message_type_str(), "worker_heartbeat");
    }
}
