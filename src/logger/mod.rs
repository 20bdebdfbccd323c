use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

/// 日志文件名前缀，按天滚动
const LOG_FILE_PREFIX: &str = "puter-gateway.log";

/// 初始化日志系统
///
/// RUST_LOG 优先于配置中的过滤指令。配置了日志目录时额外写入按天滚动的文件，
/// 返回的 guard 必须在进程退出前一直持有，否则缓冲中的日志会丢失。
pub fn init(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.filter))?;

    match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()?;

            Ok(Some(guard))
        }
        None => {
            fmt().with_env_filter(filter).try_init().map_err(|e| anyhow::anyhow!(e))?;
            Ok(None)
        }
    }
}
