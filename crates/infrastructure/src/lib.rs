pub mod backend_factory;
pub mod memory;
pub mod rabbitmq;
pub mod redis;

pub use backend_factory::BackendFactory;
pub use memory::{MemoryBroker, MemoryQueue};
pub use rabbitmq::RabbitmqBackend;
pub use redis::RedisBackend;
