use std::time::Duration;

use conveyor_config::RabbitmqConfig;
use conveyor_errors::{ConveyorError, ConveyorResult};
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

struct ConnectionState {
    connection: Option<Connection>,
    channel: Option<Channel>,
}

/// RabbitMQ连接管理器
///
/// 连接失败按配置重试；通道或底层套接字断开后，下一次 `channel()`
/// 调用透明重建连接和通道，调用方重试一次操作即可。
pub struct RabbitmqConnection {
    config: RabbitmqConfig,
    state: Mutex<ConnectionState>,
}

impl RabbitmqConnection {
    pub fn new(config: RabbitmqConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ConnectionState {
                connection: None,
                channel: None,
            }),
        }
    }

    pub async fn connect(&self) -> ConveyorResult<()> {
        let mut state = self.state.lock().await;
        if Self::state_connected(&state) {
            return Ok(());
        }
        let connection = self.connect_with_retry().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ConveyorError::message_queue(format!("创建通道失败: {e}")))?;
        info!("成功连接到RabbitMQ: {}", self.config.url);
        state.connection = Some(connection);
        state.channel = Some(channel);
        Ok(())
    }

    pub async fn close(&self) -> ConveyorResult<()> {
        let mut state = self.state.lock().await;
        if let Some(connection) = state.connection.take() {
            connection
                .close(200, "正常关闭")
                .await
                .map_err(|e| ConveyorError::message_queue(format!("关闭连接失败: {e}")))?;
            info!("RabbitMQ连接已关闭");
        }
        state.channel = None;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        Self::state_connected(&*self.state.lock().await)
    }

    fn state_connected(state: &ConnectionState) -> bool {
        state
            .connection
            .as_ref()
            .map(|c| c.status().connected())
            .unwrap_or(false)
    }

    async fn connect_with_retry(&self) -> ConveyorResult<Connection> {
        let mut last_error = None;
        let attempts = self.config.max_retry_attempts.max(1);

        for attempt in 0..attempts {
            match Connection::connect(&self.config.url, ConnectionProperties::default()).await {
                Ok(connection) => {
                    if attempt > 0 {
                        debug!("第 {} 次尝试后重新连上RabbitMQ", attempt + 1);
                    }
                    return Ok(connection);
                }
                Err(e) => {
                    if attempt < attempts - 1 {
                        warn!(
                            "连接RabbitMQ失败 (attempt {}/{}): {}. {}s后重试...",
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
            "连接RabbitMQ失败，已重试 {} 次。最后错误: {}",
            attempts,
            last_error.map_or("Unknown".to_string(), |e| e.to_string())
        );
        error!("{}", error_msg);
        Err(ConveyorError::message_queue(error_msg))
    }

    /// 获取可用通道；连接或通道已断开时先重建
    pub async fn channel(&self) -> ConveyorResult<Channel> {
        let mut state = self.state.lock().await;
        let channel_ok = Self::state_connected(&state)
            && state
                .channel
                .as_ref()
                .map(|ch| ch.status().connected())
                .unwrap_or(false);
        if !channel_ok {
            if !Self::state_connected(&state) {
                warn!("RabbitMQ连接已断开，正在重建");
                state.connection = Some(self.connect_with_retry().await?);
            }
            let connection = state.connection.as_ref().ok_or_else(|| {
                ConveyorError::Internal("RabbitMQ连接重建后仍不可用".to_string())
            })?;
            let channel = connection
                .create_channel()
                .await
                .map_err(|e| ConveyorError::message_queue(format!("创建通道失败: {e}")))?;
            state.channel = Some(channel);
        }
        state
            .channel
            .as_ref()
            .cloned()
            .ok_or_else(|| ConveyorError::Internal("RabbitMQ通道不可用".to_string()))
    }
}
