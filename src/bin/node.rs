//! Worker节点进程：暴露节点RPC，托管按需启动的Worker实例

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use conveyor::ShutdownManager;
use conveyor_config::AppConfig;
use conveyor_domain::Job;
use conveyor_errors::ConveyorResult;
use conveyor_infrastructure::BackendFactory;
use conveyor_orchestrator::{JobHandler, Orchestrator};
use conveyor_worker::{node_routes, Node};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "conveyor-node", about = "Conveyor Worker节点")]
struct Args {
    /// 配置文件路径（TOML）
    #[arg(short, long)]
    config: Option<String>,
    /// 对外公布的主机名
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// 节点RPC监听端口
    #[arg(short, long, default_value_t = 8400)]
    port: u16,
}

/// 内置回显处理器，把作业负载原样作为输出返回
struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn handle(&self, job: &Job) -> ConveyorResult<serde_json::Value> {
        Ok(job.payload.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;

    let backend = BackendFactory::create(&config.broker).await?;
    let orchestrator = Arc::new(Orchestrator::new(backend));
    let node = Arc::new(Node::new(
        Arc::clone(&orchestrator),
        &config.cluster,
        args.host.clone(),
    ));
    node.register_worker_type("echo", Arc::new(|| Arc::new(EchoHandler) as Arc<dyn JobHandler>))
        .await;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!(host = %args.host, port = args.port, "Conveyor node listening");

    let shutdown = ShutdownManager::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("监听Ctrl-C失败: {}", e);
            }
            shutdown.shutdown().await;
        });
    }

    let router = node_routes::router(Arc::clone(&node));
    let mut shutdown_rx = shutdown.subscribe().await;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    node.shutdown_all().await;
    info!("Conveyor node stopped");
    Ok(())
}
