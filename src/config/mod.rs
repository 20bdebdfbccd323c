//! 网关配置模块

mod gateway_config;

pub use gateway_config::{GatewayConfig, LogConfig, ManagerConfig};
