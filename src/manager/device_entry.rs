//! 设备条目实现
//!
//! 表示注册表中的单个设备及其会话、连接任务和状态

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::types::{DeviceConfig, DeviceInfo};
use crate::serial::DeviceSession;

/// 设备条目
pub struct DeviceEntry {
    /// 连接参数
    pub config: DeviceConfig,

    /// 代数，每次 add 分配新值，用于丢弃过期的连接结果
    pub epoch: u64,

    /// 探测通过后才安装的会话
    pub session: Option<Arc<DeviceSession>>,

    /// 正在进行的连接任务
    pub connect_task: Option<JoinHandle<()>>,

    /// 探测到的固件版本，仅在线时有值
    pub firmware: Option<String>,

    /// 最后一次确认设备存活的时间
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceEntry {
    /// 创建新的设备条目（离线）
    pub fn new(config: DeviceConfig, epoch: u64) -> Self {
        Self {
            config,
            epoch,
            session: None,
            connect_task: None,
            firmware: None,
            last_seen: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.session.is_some()
    }

    /// 是否有尚未结束的连接任务
    pub fn is_connecting(&self) -> bool {
        self.connect_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// 上线：安装会话并记录固件
    pub fn set_online(&mut self, session: Arc<DeviceSession>, firmware: String) {
        self.session = Some(session);
        self.firmware = Some(firmware);
        self.touch();
    }

    /// 离线：取出会话并清空固件，会话由调用方在锁外关闭
    pub fn set_offline(&mut self) -> Option<Arc<DeviceSession>> {
        self.firmware = None;
        self.session.take()
    }

    /// 更新最后存活时间
    pub fn touch(&mut self) {
        self.last_seen = Some(Utc::now());
    }

    /// 是否仍持有指定的会话
    pub fn holds(&self, session: &Arc<DeviceSession>) -> bool {
        self.session
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }

    /// 获取设备信息
    pub fn to_info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.config.id.clone(),
            port: self.config.port.clone(),
            baud: self.config.baud,
            online: self.is_online(),
            firmware: self.firmware.clone(),
            last_seen: self.last_seen,
        }
    }
}
