//! 集群管理器进程：启动控制面后台任务，接受Ctrl-C优雅退出

use std::sync::Arc;

use clap::Parser;
use conveyor::ShutdownManager;
use conveyor_cluster::ClusterManager;
use conveyor_config::AppConfig;
use conveyor_infrastructure::BackendFactory;
use conveyor_orchestrator::Orchestrator;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "conveyor-manager", about = "Conveyor集群管理器")]
struct Args {
    /// 配置文件路径（TOML）
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;
    info!(
        cluster = %config.cluster.name,
        broker = ?config.broker.r#type,
        "Starting conveyor manager"
    );

    let backend = BackendFactory::create(&config.broker).await?;
    let orchestrator = Arc::new(Orchestrator::new(backend));
    let manager = ClusterManager::new(orchestrator, config.cluster.clone())?;
    manager.start().await?;

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

    shutdown.wait_for_shutdown().await;
    manager.stop();
    info!("Conveyor manager stopped");
    Ok(())
}
