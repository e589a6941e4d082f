use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conveyor_domain::QueueKind;
use conveyor_errors::{ConveyorError, ConveyorResult};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::RedisConnectionManager;

const CATALOG_HASH: &str = "conveyor:queues";
const EVENT_CHANNEL: &str = "conveyor:queue_events";

/// 目录变更事件，经发布/订阅在进程间传播
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CatalogEvent {
    Declare { queue: String, kind: QueueKind },
    Delete { queue: String },
}

/// 跨进程队列目录
///
/// 队列名到队列类型的映射存在Redis哈希里，declare/delete事件发布到
/// 共享频道；每个进程用后台任务订阅该频道维护本地缓存，
/// 任何进程声明一次，所有进程收敛到同一组已声明队列。
pub struct QueueCatalog {
    manager: Arc<RedisConnectionManager>,
    cache: Arc<RwLock<HashMap<String, QueueKind>>>,
    sync_handle: RwLock<Option<JoinHandle<()>>>,
}

impl QueueCatalog {
    pub fn new(manager: Arc<RedisConnectionManager>) -> Self {
        Self {
            manager,
            cache: Arc::new(RwLock::new(HashMap::new())),
            sync_handle: RwLock::new(None),
        }
    }

    /// 从元数据哈希预热本地缓存，并启动订阅同步任务
    pub async fn start(&self) -> ConveyorResult<()> {
        self.reload().await?;
        let client = self.manager.client().clone();
        let cache = Arc::clone(&self.cache);

        let handle = tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.subscribe(EVENT_CHANNEL).await {
                            warn!("订阅队列事件频道失败: {}", e);
                        } else {
                            debug!("队列目录同步任务已订阅 {}", EVENT_CHANNEL);
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                let payload: String = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(e) => {
                                        warn!("读取队列事件负载失败: {}", e);
                                        continue;
                                    }
                                };
                                match serde_json::from_str::<CatalogEvent>(&payload) {
                                    Ok(CatalogEvent::Declare { queue, kind }) => {
                                        cache.write().await.insert(queue, kind);
                                    }
                                    Ok(CatalogEvent::Delete { queue }) => {
                                        cache.write().await.remove(&queue);
                                    }
                                    Err(e) => {
                                        warn!("无法解析队列事件 {payload}: {e}");
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("建立队列事件订阅连接失败: {}", e);
                    }
                }
                // 订阅断开后稍候重建
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        *self.sync_handle.write().await = Some(handle);
        info!("队列目录已加载，跨进程同步任务已启动");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.sync_handle.write().await.take() {
            handle.abort();
        }
    }

    /// 从元数据哈希重建本地缓存
    pub async fn reload(&self) -> ConveyorResult<()> {
        let entries: HashMap<String, String> = self
            .manager
            .execute_command(redis::cmd("HGETALL").arg(CATALOG_HASH))
            .await?;
        let mut cache = self.cache.write().await;
        cache.clear();
        for (queue, kind) in entries {
            match QueueKind::parse(&kind) {
                Ok(kind) => {
                    cache.insert(queue, kind);
                }
                Err(_) => warn!("目录中队列 {} 的类型非法: {}", queue, kind),
            }
        }
        Ok(())
    }

    /// 查询队列类型；本地缓存未命中时回源到元数据哈希
    pub async fn kind_of(&self, queue: &str) -> ConveyorResult<Option<QueueKind>> {
        if let Some(kind) = self.cache.read().await.get(queue) {
            return Ok(Some(*kind));
        }
        let stored: Option<String> = self
            .manager
            .execute_command(redis::cmd("HGET").arg(CATALOG_HASH).arg(queue))
            .await?;
        match stored {
            Some(kind) => {
                let kind = QueueKind::parse(&kind)?;
                self.cache.write().await.insert(queue.to_string(), kind);
                Ok(Some(kind))
            }
            None => Ok(None),
        }
    }

    /// 登记队列声明并广播事件
    pub async fn insert(&self, queue: &str, kind: QueueKind) -> ConveyorResult<()> {
        let _: () = self
            .manager
            .execute_command(
                redis::cmd("HSET")
                    .arg(CATALOG_HASH)
                    .arg(queue)
                    .arg(kind.to_string()),
            )
            .await?;
        self.cache.write().await.insert(queue.to_string(), kind);
        self.publish_event(&CatalogEvent::Declare {
            queue: queue.to_string(),
            kind,
        })
        .await
    }

    /// 移除队列声明并广播事件
    pub async fn remove(&self, queue: &str) -> ConveyorResult<()> {
        let _: () = self
            .manager
            .execute_command(redis::cmd("HDEL").arg(CATALOG_HASH).arg(queue))
            .await?;
        self.cache.write().await.remove(queue);
        self.publish_event(&CatalogEvent::Delete {
            queue: queue.to_string(),
        })
        .await
    }

    async fn publish_event(&self, event: &CatalogEvent) -> ConveyorResult<()> {
        let payload = serde_json::to_string(event).map_err(ConveyorError::from)?;
        let _: () = self
            .manager
            .execute_command(redis::cmd("PUBLISH").arg(EVENT_CHANNEL).arg(payload))
            .await?;
        Ok(())
    }
}
