//! RabbitMQ消息队列模块
//!
//! 依赖代理自身的幂等声明语义（passive探测）而非显式元数据频道；
//! 队列的最大优先级通过 x-max-priority 参数声明，消息携带priority属性。

pub mod backend;
pub mod connection;

pub use backend::RabbitmqBackend;
pub use connection::RabbitmqConnection;
