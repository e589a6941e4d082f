//! Redis消息队列模块
//!
//! 基于Redis原生原子操作（RPUSH/LPOP/BLPOP、ZADD/ZPOPMAX）的队列后端，
//! 配合跨进程队列目录（元数据哈希 + 发布/订阅事件）和分布式锁，
//! 按职责分解为多个子模块。

pub mod backend;
pub mod catalog;
pub mod connection;
pub mod lock;

pub use backend::RedisBackend;
pub use catalog::QueueCatalog;
pub use connection::RedisConnectionManager;
pub use lock::RedisLock;

/// 所有conveyor键的公共前缀
pub(crate) const KEY_PREFIX: &str = "conveyor";

pub(crate) fn queue_key(name: &str) -> String {
    format!("{KEY_PREFIX}:queue:{name}")
}

pub(crate) fn seq_key(name: &str) -> String {
    format!("{KEY_PREFIX}:queue:{name}:seq")
}

pub(crate) fn lock_key(name: &str) -> String {
    format!("{KEY_PREFIX}:lock:{name}")
}
