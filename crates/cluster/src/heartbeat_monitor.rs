use std::time::Duration;

use chrono::Utc;
use conveyor_domain::WorkerStatus;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::status_listener::WorkerRegistry;

/// 心跳监视器
///
/// 周期扫描Worker记录表，心跳超时的实例标记为 `Nonexistent` 并清除
/// 当前作业id；已标记的实例不再重复告警。
pub struct HeartbeatMonitor {
    workers: WorkerRegistry,
    timeout: Duration,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(workers: WorkerRegistry, timeout: Duration, interval: Duration) -> Self {
        Self {
            workers,
            timeout,
            interval,
        }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            timeout_secs = self.timeout.as_secs(),
            "Heartbeat monitor started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Heartbeat monitor stopped");
                    break;
                }
            }
        }
    }

    /// 单次扫描，返回本次新标记失联的Worker数
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut expired = 0;
        let mut workers = self.workers.write().await;
        for record in workers.values_mut() {
            if record.status == WorkerStatus::Nonexistent {
                continue;
            }
            let age = now.signed_duration_since(record.last_heartbeat);
            if age.num_seconds() >= 0 && age.to_std().unwrap_or(Duration::ZERO) > self.timeout {
                warn!(
                    worker_id = %record.worker_id,
                    worker_url = %record.worker_url,
                    age_secs = age.num_seconds(),
                    "Worker心跳超时，标记为失联"
                );
                record.status = WorkerStatus::Nonexistent;
                record.current_job_id = None;
                expired += 1;
            }
        }
        if expired > 0 {
            debug!(expired, "Heartbeat sweep marked workers nonexistent");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;
    use conveyor_domain::WorkerRecord;
    use tokio::sync::RwLock;

    fn registry_with(records: Vec<WorkerRecord>) -> WorkerRegistry {
        let map: HashMap<String, WorkerRecord> = records
            .into_iter()
            .map(|r| (r.worker_url.clone(), r))
            .collect();
        Arc::new(RwLock::new(map))
    }

    #[tokio::test]
    async fn test_stale_worker_marked_nonexistent() {
        let mut stale = WorkerRecord::new("w-1", "http://w1", "t");
        stale.status = WorkerStatus::Running;
        stale.current_job_id = Some("j-1".to_string());
        stale.last_heartbeat = Utc::now() - ChronoDuration::seconds(120);

        let fresh = WorkerRecord::new("w-2", "http://w2", "t");

        let workers = registry_with(vec![stale, fresh]);
        let monitor = HeartbeatMonitor::new(
            Arc::clone(&workers),
            Duration::from_secs(90),
            Duration::from_secs(1),
        );
        assert_eq!(monitor.sweep().await, 1);

        let workers = workers.read().await;
        let stale = workers.get("http://w1").unwrap();
        assert_eq!(stale.status, WorkerStatus::Nonexistent);
        assert!(stale.current_job_id.is_none());
        assert_eq!(workers.get("http://w2").unwrap().status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_already_nonexistent_not_recounted() {
        let mut gone = WorkerRecord::new("w-1", "http://w1", "t");
        gone.status = WorkerStatus::Nonexistent;
        gone.last_heartbeat = Utc::now() - ChronoDuration::seconds(999);

        let workers = registry_with(vec![gone]);
        let monitor = HeartbeatMonitor::new(
            Arc::clone(&workers),
            Duration::from_secs(90),
            Duration::from_secs(1),
        );
        assert_eq!(monitor.sweep().await, 0);
        assert_eq!(monitor.sweep().await, 0);
    }
}
