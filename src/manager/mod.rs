//! 设备管理模块
//!
//! 统一管理设备注册、串口会话、固件探测、重连和周期扫描

mod device_entry;
mod device_manager;
mod types;

pub use device_manager::{ManagerSettings, SerialManager};
pub use types::{DeviceConfig, DeviceInfo, ManagerEvent};
