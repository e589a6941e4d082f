//! 真实代理集成测试
//!
//! 默认跳过；设置 CONVEYOR_TEST_REDIS_URL / CONVEYOR_TEST_AMQP_URL
//! 指向可用实例后运行。每个测试使用独立的队列名避免互相干扰。

use std::time::Duration;

use conveyor_domain::{DeclareOptions, DeclareStatus, Job, OrchestratorBackend, QueueKind};
use conveyor_infrastructure::{BackendFactory, RabbitmqBackend};
use serde_json::json;
use uuid::Uuid;

fn redis_backend_url() -> Option<String> {
    std::env::var("CONVEYOR_TEST_REDIS_URL").ok()
}

fn amqp_url() -> Option<String> {
    std::env::var("CONVEYOR_TEST_AMQP_URL").ok()
}

fn unique_queue(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

fn job(name: &str) -> Job {
    Job::new(name, "integration_schema", json!({"name": name}))
}

async fn redis_backend() -> Option<std::sync::Arc<dyn OrchestratorBackend>> {
    let url = redis_backend_url()?;
    let config = BackendFactory::parse_redis_url(&url).expect("invalid test redis url");
    let backend = BackendFactory::create(&conveyor_config::BrokerConfig::redis(config))
        .await
        .expect("failed to connect to test redis");
    Some(backend)
}

#[tokio::test]
async fn redis_fifo_roundtrip() {
    let Some(backend) = redis_backend().await else {
        eprintln!("CONVEYOR_TEST_REDIS_URL未设置，跳过");
        return;
    };
    let queue = unique_queue("it_fifo");

    let status = backend
        .declare_queue(&queue, QueueKind::Fifo, DeclareOptions::default())
        .await
        .unwrap();
    assert_eq!(status, DeclareStatus::Created);

    backend.publish(&queue, &job("first"), None).await.unwrap();
    backend.publish(&queue, &job("second"), None).await.unwrap();
    assert_eq!(backend.count_queue_messages(&queue).await.unwrap(), 2);

    let first = backend.receive_message(&queue, false, None).await.unwrap().unwrap();
    assert_eq!(first["name"], "first");

    backend.delete_queue(&queue).await.unwrap();
}

#[tokio::test]
async fn redis_priority_ordering_with_ties() {
    let Some(backend) = redis_backend().await else {
        eprintln!("CONVEYOR_TEST_REDIS_URL未设置，跳过");
        return;
    };
    let queue = unique_queue("it_prio");

    backend
        .declare_queue(&queue, QueueKind::Priority, DeclareOptions::default())
        .await
        .unwrap();
    backend.publish(&queue, &job("low"), Some(1)).await.unwrap();
    backend.publish(&queue, &job("tie_a"), Some(5)).await.unwrap();
    backend.publish(&queue, &job("tie_b"), Some(5)).await.unwrap();
    backend.publish(&queue, &job("high"), Some(9)).await.unwrap();

    let mut order = Vec::new();
    while let Some(msg) = backend.receive_message(&queue, false, None).await.unwrap() {
        order.push(msg["name"].as_str().unwrap().to_string());
    }
    // 同分值按入队顺序出队
    assert_eq!(order, vec!["high", "tie_a", "tie_b", "low"]);

    backend.delete_queue(&queue).await.unwrap();
}

#[tokio::test]
async fn redis_blocking_receive_times_out_empty() {
    let Some(backend) = redis_backend().await else {
        eprintln!("CONVEYOR_TEST_REDIS_URL未设置，跳过");
        return;
    };
    let queue = unique_queue("it_block");

    backend
        .declare_queue(&queue, QueueKind::Fifo, DeclareOptions::default())
        .await
        .unwrap();
    let received = backend
        .receive_message(&queue, true, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(received.is_none());

    backend.delete_queue(&queue).await.unwrap();
}

#[tokio::test]
async fn rabbitmq_fifo_and_priority() {
    let Some(url) = amqp_url() else {
        eprintln!("CONVEYOR_TEST_AMQP_URL未设置，跳过");
        return;
    };
    let config = conveyor_config::RabbitmqConfig {
        url,
        ..Default::default()
    };
    let backend = RabbitmqBackend::new(config).await.expect("failed to connect to test rabbitmq");

    let queue = unique_queue("it_amqp");
    backend
        .declare_queue(&queue, QueueKind::Fifo, DeclareOptions::default())
        .await
        .unwrap();
    backend.publish(&queue, &job("only"), None).await.unwrap();
    let msg = backend.receive_message(&queue, false, None).await.unwrap().unwrap();
    assert_eq!(msg["name"], "only");
    backend.delete_queue(&queue).await.unwrap();

    let pq = unique_queue("it_amqp_prio");
    backend
        .declare_queue(&pq, QueueKind::Priority, DeclareOptions::default())
        .await
        .unwrap();
    backend.publish(&pq, &job("low"), Some(1)).await.unwrap();
    backend.publish(&pq, &job("high"), Some(9)).await.unwrap();
    // 代理端需要时间完成优先级排序
    tokio::time::sleep(Duration::from_millis(200)).await;
    let first = backend.receive_message(&pq, false, None).await.unwrap().unwrap();
    assert_eq!(first["name"], "high");
    backend.delete_queue(&pq).await.unwrap();
}

#[tokio::test]
async fn rabbitmq_rejects_stack_queues() {
    let Some(url) = amqp_url() else {
        eprintln!("CONVEYOR_TEST_AMQP_URL未设置，跳过");
        return;
    };
    let config = conveyor_config::RabbitmqConfig {
        url,
        ..Default::default()
    };
    let backend = RabbitmqBackend::new(config).await.expect("failed to connect to test rabbitmq");

    let result = backend
        .declare_queue(&unique_queue("it_stack"), QueueKind::Stack, DeclareOptions::default())
        .await;
    assert!(matches!(result, Err(conveyor_errors::ConveyorError::NotSupported(_))));
}
