mod api;
mod config;
mod context;
mod error;
mod logger;
mod manager;
mod serial;

use std::sync::Arc;
use tracing::{error, info};

use config::GatewayConfig;
use context::context::{Context, IContext};
use serial::SerialConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::load()?;

    // 初始化日志系统
    let _log_guard = logger::init(&config.log)?;

    info!("启动 Puter 串口网关...");

    let connector = Arc::new(SerialConnector::new(config.manager.read_timeout()));
    let ctx = Context::init(&config, connector).await;

    let api_server = api::api::ApiServer::new(Arc::clone(&ctx) as Arc<dyn IContext + Sync + Send>);

    let shutdown_ctx = Arc::clone(&ctx);
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("收到 Ctrl-C，准备退出"),
            _ = shutdown_ctx.shutdown_requested() => info!("收到 /shutdown 请求，准备退出"),
        }
    };

    if let Err(e) = api_server.run(&config.server.listen, shutdown).await {
        error!("API 服务器运行失败: {:?}", e);
    }

    ctx.teardown().await;
    info!("串口设备已关闭");
    Ok(())
}
