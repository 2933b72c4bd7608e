//! 服务装配与生命周期
//!
//! 监视循环在前台任务里跑，主任务只等退出信号；收到信号后依次
//! 停监视、拆会话、关 MongoDB 客户端。

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::SyncConfig;

mod wire;

pub use wire::ApplicationContext;

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用的主入口点
    pub async fn run() -> Result<()> {
        let config = SyncConfig::from_env()?;
        info!(
            db = %config.mongodb_db,
            poll_ms = config.poll_interval.as_millis() as u64,
            device_list_ms = config.device_list_interval.as_millis() as u64,
            "Starting device sync service"
        );

        // 使用 Wire 风格的依赖注入构建应用上下文
        let context = self::wire::initialize(&config).await?;

        info!("ApplicationBootstrap created successfully");

        Self::run_with_context(context).await
    }

    /// 运行服务（带应用上下文）
    async fn run_with_context(context: ApplicationContext) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);

        let watcher = context.watcher;
        let watcher_task = tokio::spawn(async move {
            watcher.run(stop_rx).await;
        });

        wait_for_shutdown_signal().await;
        info!("Shutdown signal received, draining device sessions");

        let _ = stop_tx.send(true);
        if let Err(e) = watcher_task.await {
            warn!(error = %e, "Registry watcher task ended abnormally");
        }

        context.supervisor.shutdown().await;
        context.client.shutdown().await;

        info!("Device sync service stopped");
        Ok(())
    }
}

/// 等待 Ctrl+C 或 SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, falling back to Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received (Ctrl+C)");
            }
            _ = sigterm.recv() => {
                info!("shutdown signal received (SIGTERM)");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received (Ctrl+C)");
    }
}
