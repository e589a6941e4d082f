use std::sync::Arc;
use std::time::Duration;

use conveyor_errors::{ConveyorError, ConveyorResult};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::RedisConnectionManager;

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 基于 SET NX PX 的分布式锁
///
/// 守护多步结构性操作（declare/delete/clean），避免两个进程
/// 同时修改同一队列的元数据。锁带过期时间，持有者崩溃后自动释放；
/// 释放时校验令牌，不会误删他人持有的锁。
pub struct RedisLock {
    manager: Arc<RedisConnectionManager>,
    key: String,
    token: String,
    ttl: Duration,
}

impl RedisLock {
    /// 获取锁；在 `acquire_timeout` 内轮询，超时返回 `Timeout` 错误
    pub async fn acquire(
        manager: Arc<RedisConnectionManager>,
        key: impl Into<String>,
        ttl: Duration,
        acquire_timeout: Duration,
    ) -> ConveyorResult<Self> {
        let key = key.into();
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + acquire_timeout;

        loop {
            let acquired: Option<String> = manager
                .execute_command(
                    redis::cmd("SET")
                        .arg(&key)
                        .arg(&token)
                        .arg("NX")
                        .arg("PX")
                        .arg(ttl.as_millis() as u64),
                )
                .await?;
            if acquired.is_some() {
                debug!("获取分布式锁 {}", key);
                return Ok(Self {
                    manager,
                    key,
                    token,
                    ttl,
                });
            }
            if Instant::now() >= deadline {
                return Err(ConveyorError::Timeout(format!(
                    "获取分布式锁超时: {key}"
                )));
            }
            sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    /// 释放锁；令牌不匹配（锁已过期并被他人获取）时不做任何事
    pub async fn release(self) -> ConveyorResult<()> {
        let holder: Option<String> = self
            .manager
            .execute_command(redis::cmd("GET").arg(&self.key))
            .await?;
        match holder {
            Some(token) if token == self.token => {
                let _: () = self
                    .manager
                    .execute_command(redis::cmd("DEL").arg(&self.key))
                    .await?;
                debug!("释放分布式锁 {}", self.key);
            }
            Some(_) => {
                warn!("锁 {} 已被其他持有者接管（TTL {}ms 已过期）", self.key, self.ttl.as_millis());
            }
            None => {}
        }
        Ok(())
    }
}
