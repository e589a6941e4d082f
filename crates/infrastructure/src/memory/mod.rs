//! 进程内消息队列模块
//!
//! 提供三种排序规则的内存队列容器以及基于显式注册表的进程内代理后端，
//! 适用于嵌入式部署和测试场景。

pub mod broker;
pub mod queues;

pub use broker::MemoryBroker;
pub use queues::MemoryQueue;
