use anyhow::Result;
use hms_device_sync::service::ApplicationBootstrap;
use tracing_subscriber::EnvFilter;

/// 初始化日志系统
fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    ApplicationBootstrap::run().await
}
