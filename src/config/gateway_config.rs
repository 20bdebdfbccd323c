use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::manager::DeviceConfig;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "puter.toml";

/// 完整的网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub manager: ManagerConfig,
    pub log: LogConfig,
    pub devices: Vec<DeviceConfig>,
}

/// HTTP 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub listen: String,
}

/// 设备管理器配置（时间单位均为毫秒）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// 后台扫描间隔
    pub scan_interval_ms: u64,

    /// 普通命令超时
    pub request_timeout_ms: u64,

    /// 固件探测（info）超时
    pub probe_timeout_ms: u64,

    /// 打开串口后等待板子复位的时间
    pub settle_ms: u64,

    /// 串口单次读取超时
    pub read_timeout_ms: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// EnvFilter 指令，RUST_LOG 优先
    pub filter: String,

    /// 日志文件目录，为空时只输出到终端
    pub dir: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            manager: ManagerConfig::default(),
            log: LogConfig::default(),
            devices: vec![DeviceConfig::new("light_controller", "/dev/ttyUSB0", 115200)],
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 5000,
            request_timeout_ms: 1500,
            probe_timeout_ms: 1000,
            settle_ms: 2000,
            read_timeout_ms: 200,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "puter_gateway=debug,tower_http=info,axum=info".to_string(),
            dir: None,
        }
    }
}

impl ManagerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl GatewayConfig {
    /// 从 TOML 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Self::from_toml(&content)
    }

    /// 从 TOML 字符串解析并校验
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// 按 PUTER_CONFIG 加载配置，文件不存在时使用默认值，然后应用环境变量覆盖
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("PUTER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };

        if let Ok(listen) = std::env::var("PUTER_LISTEN") {
            config.server.listen = listen;
        }

        if let Ok(dir) = std::env::var("PUTER_LOG_DIR") {
            config.log.dir = Some(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.manager;
        if m.scan_interval_ms == 0 || m.request_timeout_ms == 0 || m.probe_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "扫描间隔和超时必须大于 0".to_string(),
            ));
        }
        // 为 0 时串口读取退化为忙轮询；settle_ms 可以为 0（板子打开串口不复位）
        if m.read_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "串口读取超时必须大于 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(ConfigError::ValidationError("设备 id 不能为空".to_string()));
            }
            if device.baud == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "设备 {} 的波特率不能为 0",
                    device.id
                )));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "设备 id 重复: {}",
                    device.id
                )));
            }
        }

        Ok(())
    }
}

/// 配置错误
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO 错误: {0}")]
    IoError(String),

    #[error("解析错误: {0}")]
    ParseError(String),

    #[error("验证错误: {0}")]
    ValidationError(String),
}
