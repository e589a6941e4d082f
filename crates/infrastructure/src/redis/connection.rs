use std::time::Duration;

use conveyor_config::RedisConfig;
use conveyor_errors::{ConveyorError, ConveyorResult};
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Redis连接管理器
///
/// 连接失败时按配置的次数和间隔重试，重试耗尽后透出底层错误；
/// 底层套接字断开后，下一次命令会先透明重连一次再重试该命令。
pub struct RedisConnectionManager {
    client: Client,
    config: RedisConfig,
    conn: RwLock<Option<MultiplexedConnection>>,
}

impl RedisConnectionManager {
    pub fn new(config: RedisConfig) -> ConveyorResult<Self> {
        let redis_url = config.build_connection_url();
        let client = Client::open(redis_url).map_err(|e| {
            ConveyorError::message_queue(format!("创建Redis客户端失败: {e}"))
        })?;
        Ok(Self {
            client,
            config,
            conn: RwLock::new(None),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn connect(&self) -> ConveyorResult<()> {
        let conn = self.connect_with_retry().await?;
        *self.conn.write().await = Some(conn);
        self.ping().await?;
        debug!(
            "Successfully connected to Redis at {}:{}",
            self.config.host, self.config.port
        );
        Ok(())
    }

    pub async fn close(&self) {
        *self.conn.write().await = None;
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.read().await.is_some()
    }

    async fn connect_with_retry(&self) -> ConveyorResult<MultiplexedConnection> {
        let mut last_error = None;
        let attempts = self.config.max_retry_attempts.max(1);

        for attempt in 0..attempts {
            match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    if attempt > 0 {
                        debug!(
                            "Successfully reconnected to Redis after {} attempts",
                            attempt + 1
                        );
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    if attempt < attempts - 1 {
                        warn!(
                            "Failed to connect to Redis (attempt {}/{}): {}. Retrying in {}s...",
                            attempt + 1,
                            attempts,
                            e,
                            self.config.retry_delay_seconds
                        );
                        sleep(Duration::from_secs(self.config.retry_delay_seconds)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let error_msg = format!(
            "Failed to connect to Redis after {} attempts. Last error: {}",
            attempts,
            last_error.map_or("Unknown".to_string(), |e| e.to_string())
        );
        error!("{}", error_msg);
        Err(ConveyorError::message_queue(error_msg))
    }

    async fn connection(&self) -> ConveyorResult<MultiplexedConnection> {
        if let Some(conn) = self.conn.read().await.clone() {
            return Ok(conn);
        }
        let conn = self.connect_with_retry().await?;
        *self.conn.write().await = Some(conn.clone());
        Ok(conn)
    }

    /// 执行一条Redis命令；连接断开时重连一次并重试该命令一次
    pub async fn execute_command<T: redis::FromRedisValue>(
        &self,
        cmd: &redis::Cmd,
    ) -> ConveyorResult<T> {
        let mut conn = self.connection().await?;
        match cmd.query_async(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_connection_dropped() || e.is_io_error() => {
                warn!("Redis连接已断开，尝试重连后重试命令: {}", e);
                self.close().await;
                let mut conn = self.connection().await?;
                cmd.query_async(&mut conn)
                    .await
                    .map_err(|e| ConveyorError::message_queue(format!("Redis command failed: {e}")))
            }
            Err(e) => Err(ConveyorError::message_queue(format!(
                "Redis command failed: {e}"
            ))),
        }
    }

    /// 获取一条独立连接，用于阻塞命令（BLPOP/BRPOP），
    /// 避免阻塞共享的多路复用连接。
    pub async fn dedicated_connection(&self) -> ConveyorResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ConveyorError::message_queue(format!("获取Redis独立连接失败: {e}")))
    }

    pub async fn ping(&self) -> ConveyorResult<()> {
        let response: String = self.execute_command(&redis::cmd("PING")).await?;
        if response == "PONG" {
            Ok(())
        } else {
            let error_msg = format!("Unexpected PING response: {response}");
            error!("{}", error_msg);
            Err(ConveyorError::message_queue(error_msg))
        }
    }
}
