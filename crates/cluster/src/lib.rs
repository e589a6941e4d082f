//! 集群控制面
//!
//! `ClusterManager` 负责作业路由、Worker生命周期和状态缓存；状态监听器
//! 消费Worker上报的控制消息，心跳监视器剔除失联实例，死信仓保存失败
//! 作业等待重新入队或丢弃。

pub mod clients;
pub mod dlq;
pub mod heartbeat_monitor;
pub mod manager;
pub mod status_listener;

pub use clients::{NodeClient, ShutdownSelector, WorkerClient};
pub use dlq::DeadLetterStore;
pub use heartbeat_monitor::HeartbeatMonitor;
pub use manager::{ClusterManager, WorkerTypeSpec};
pub use status_listener::StatusListener;
