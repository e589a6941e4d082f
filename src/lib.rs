//! Conveyor：分布式作业队列与集群协调系统
//!
//! 生产者按作业模式提交类型化输入，编排层把作业发布到可插拔的消息
//! 代理（内存、Redis或RabbitMQ），Worker消费执行并把状态回流到集群
//! 控制面；失败作业进入死信仓等待重新入队或丢弃。

pub mod shutdown;

pub use shutdown::ShutdownManager;

pub use conveyor_cluster as cluster;
pub use conveyor_config as config;
pub use conveyor_domain as domain;
pub use conveyor_errors as errors;
pub use conveyor_infrastructure as infrastructure;
pub use conveyor_orchestrator as orchestrator;
pub use conveyor_worker as worker;
