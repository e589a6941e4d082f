use async_trait::async_trait;
use conveyor_errors::ConveyorResult;

/// 代理连接的生命周期接口
///
/// 网络型实现（Redis、RabbitMQ）在 `connect` 内部带退避重试，
/// 重试耗尽后透出底层连接错误。
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn connect(&self) -> ConveyorResult<()>;
    async fn close(&self) -> ConveyorResult<()>;
    async fn is_connected(&self) -> bool;

    /// 未连接时先连接，已连接时为空操作
    async fn ensure_connected(&self) -> ConveyorResult<()> {
        if !self.is_connected().await {
            self.connect().await?;
        }
        Ok(())
    }
}
