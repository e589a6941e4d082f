pub mod loader;
pub mod models;

pub use loader::AppConfig;
pub use models::{BrokerConfig, BrokerType, ClusterConfig, RabbitmqConfig, RedisConfig};
