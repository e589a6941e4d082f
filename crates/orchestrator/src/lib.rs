//! 作业编排层
//!
//! `Orchestrator` 是生产者与消费者共同依赖的门面：注册模式、发布作业、
//! 从队列接收消息，全部委托给可插拔的 `OrchestratorBackend`。
//! `Consumer` 在此之上提供带处理器回调的消费循环。

pub mod consumer;
pub mod orchestrator;

pub use consumer::{Consumer, ConsumerState, JobHandler, JobOutcome};
pub use orchestrator::{Orchestrator, PublishPayload};
