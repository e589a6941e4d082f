use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_config::ClusterConfig;
use conveyor_domain::{Job, JobSchema, QueueKind, WorkerStatus};
use conveyor_errors::ConveyorResult;
use conveyor_infrastructure::MemoryBroker;
use conveyor_orchestrator::{JobHandler, Orchestrator, PublishPayload};
use conveyor_worker::Node;
use serde_json::json;

struct Doubler;

#[async_trait]
impl JobHandler for Doubler {
    async fn handle(&self, job: &Job) -> ConveyorResult<serde_json::Value> {
        let n = job.payload.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(json!({"doubled": n * 2}))
    }
}

async fn setup_node() -> (Arc<Orchestrator>, Arc<Node>) {
    let orch = Arc::new(Orchestrator::new(Arc::new(MemoryBroker::new())));
    orch.register(JobSchema::new("double", json!({}), json!({})), QueueKind::Fifo)
        .await
        .unwrap();

    let cluster = ClusterConfig::default();
    let node = Arc::new(Node::new(Arc::clone(&orch), &cluster, "127.0.0.1"));
    node.register_worker_type("doubler", Arc::new(|| Arc::new(Doubler) as Arc<dyn JobHandler>))
        .await;
    (orch, node)
}

#[tokio::test]
async fn launch_process_and_query_over_rpc() {
    let (orch, node) = setup_node().await;
    let (worker_id, url) = node.launch("doubler", 0, "double").await.unwrap();

    let client = reqwest::Client::new();

    let heartbeat: serde_json::Value = client
        .get(format!("{url}/heartbeat"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(heartbeat["worker_id"], worker_id);

    let job = Job::new("j", "double", json!({"n": 21}));
    let job_id = job.id.clone();
    orch.publish("double", PublishPayload::Job(job), None).await.unwrap();

    // 轮询直到作业完成
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let resp = client
            .get(format!("{url}/jobs/{job_id}/result"))
            .send()
            .await
            .unwrap();
        if resp.status().is_success() {
            let outcome: serde_json::Value = resp.json().await.unwrap();
            assert_eq!(outcome["status"], "succeeded");
            assert_eq!(outcome["output"]["doubled"], 42);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "作业未在期限内完成");
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let status: serde_json::Value = client
        .get(format!("{url}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "IDLE");

    let listed = node.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].worker_id, worker_id);
    node.shutdown_by_id(&worker_id).await.unwrap();
    assert!(node.list().await.is_empty());
}

#[tokio::test]
async fn unknown_job_returns_404() {
    let (_orch, node) = setup_node().await;
    let (worker_id, url) = node.launch("doubler", 0, "double").await.unwrap();

    let resp = reqwest::get(format!("{url}/jobs/nope/status")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    node.shutdown_by_id(&worker_id).await.unwrap();
}

#[tokio::test]
async fn shutdown_rpc_marks_worker_nonexistent() {
    let (_orch, node) = setup_node().await;
    let (worker_id, url) = node.launch("doubler", 0, "double").await.unwrap();

    let client = reqwest::Client::new();
    let resp: serde_json::Value = client
        .post(format!("{url}/shutdown"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "stopping");

    // 实例仍在节点清单中，但状态已是NONEXISTENT
    let listed = node.list().await;
    assert_eq!(listed[0].status, WorkerStatus::Nonexistent);
    assert!(listed[0].job_id.is_none());
    node.shutdown_by_id(&worker_id).await.unwrap();
}

#[tokio::test]
async fn launch_unregistered_type_fails() {
    let (_orch, node) = setup_node().await;
    assert!(node.launch("nope", 0, "double").await.is_err());
}
