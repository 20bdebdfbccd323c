//! 设备管理相关的类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_baud() -> u32 {
    115200
}

/// 设备连接参数，添加后不可修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, port: impl Into<String>, baud: u32) -> Self {
        Self {
            id: id.into(),
            port: port.into(),
            baud,
        }
    }
}

/// 对外可见的设备状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub port: String,
    pub baud: u32,
    pub online: bool,
    pub firmware: Option<String>,
    /// 最后一次成功探测或收到命令响应的时间
    pub last_seen: Option<DateTime<Utc>>,
}

/// 设备管理器事件
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// 设备已添加
    DeviceAdded { id: String },

    /// 固件探测成功，设备上线
    DeviceOnline { id: String, firmware: String },

    /// 设备离线
    DeviceOffline { id: String, reason: String },

    /// 设备已移除
    DeviceRemoved { id: String },
}
