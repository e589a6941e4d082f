//! Worker执行层
//!
//! `WorkerService` 把消费循环、状态上报和心跳组合成一个可独立运行的
//! 执行单元，并通过axum暴露RPC；`Node` 在单机上托管多个Worker实例。

pub mod node;
pub mod node_routes;
pub mod routes;
pub mod service;

pub use node::{Node, WorkerSummary};
pub use service::{WorkerService, WorkerServiceBuilder};
