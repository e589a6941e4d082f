//! 独立Worker进程：绑定一个作业模式，消费执行并上报状态

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use conveyor::ShutdownManager;
use conveyor_config::AppConfig;
use conveyor_domain::{Job, JobSchema, QueueKind};
use conveyor_errors::ConveyorResult;
use conveyor_infrastructure::BackendFactory;
use conveyor_orchestrator::{JobHandler, Orchestrator};
use conveyor_worker::{routes, WorkerService};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "conveyor-worker", about = "Conveyor独立Worker")]
struct Args {
    /// 配置文件路径（TOML）
    #[arg(short, long)]
    config: Option<String>,
    /// 绑定的作业模式名
    #[arg(short, long)]
    schema: String,
    /// Worker RPC监听端口，0表示系统分配
    #[arg(short, long, default_value_t = 0)]
    port: u16,
    /// 对外公布的主机名
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
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
    // 独立Worker对负载不设约束，队列类型沿用已有声明
    orchestrator
        .register(
            JobSchema::new(&args.schema, serde_json::json!({}), serde_json::json!({})),
            QueueKind::Fifo,
        )
        .await?;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await?;
    let port = listener.local_addr()?.port();
    let worker_url = format!("http://{}:{}", args.host, port);

    let service = WorkerService::builder()
        .orchestrator(Arc::clone(&orchestrator))
        .handler(Arc::new(EchoHandler))
        .schema_name(&args.schema)
        .worker_type("echo")
        .worker_url(&worker_url)
        .status_queue(config.cluster.status_queue_name())
        .heartbeat_interval(Duration::from_secs(config.cluster.heartbeat_interval_seconds))
        .build()
        .await?;
    service.start().await?;
    info!(worker_id = %service.worker_id(), url = %worker_url, "Conveyor worker started");

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

    let router = routes::router(Arc::clone(&service));
    let mut shutdown_rx = shutdown.subscribe().await;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    service.stop().await;
    info!("Conveyor worker stopped");
    Ok(())
}
