//! 设备管理器实现
//!
//! 负责设备的添加/移除、异步连接与固件探测、命令转发以及周期扫描。
//!
//! 锁的约定：
//! - `devices` 写锁只在安装/移除会话等短操作时持有，不跨越任何串口阻塞调用
//! - 会话内部的互斥锁保证同一设备同一时间只有一个请求
//! - `scan_lock` 只用 `try_lock`，并发的扫描直接返回

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

use super::device_entry::DeviceEntry;
use super::types::{DeviceConfig, DeviceInfo, ManagerEvent};
use crate::config::ManagerConfig;
use crate::error::{AppError, Result};
use crate::serial::{Connector, DeviceSession};

/// 管理器运行参数
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// 普通命令超时
    pub request_timeout: Duration,
    /// 固件探测超时
    pub probe_timeout: Duration,
    /// 打开串口后的复位等待
    pub settle: Duration,
}

impl From<&ManagerConfig> for ManagerSettings {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            probe_timeout: config.probe_timeout(),
            settle: config.settle(),
        }
    }
}

/// 串口设备管理器
pub struct SerialManager {
    /// 设备注册表
    devices: RwLock<HashMap<String, DeviceEntry>>,

    /// 传输工厂
    connector: Arc<dyn Connector>,

    settings: ManagerSettings,

    /// 保证同一时间只有一次扫描
    scan_lock: Mutex<()>,

    next_epoch: AtomicU64,

    /// 事件发送器
    event_tx: broadcast::Sender<ManagerEvent>,
}

impl SerialManager {
    /// 创建新的设备管理器
    pub fn new(connector: Arc<dyn Connector>, settings: ManagerSettings) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);

        Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            connector,
            settings,
            scan_lock: Mutex::new(()),
            next_epoch: AtomicU64::new(1),
            event_tx,
        })
    }

    /// 订阅事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.event_tx.subscribe()
    }

    /// 添加设备并在后台开始连接。已存在的同名设备会先被完整移除
    ///
    /// 串口是独占打开的，旧会话必须先关闭，新的连接任务才能打开同一个端口。
    pub async fn add(self: &Arc<Self>, config: DeviceConfig) {
        let id = config.id.clone();
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);

        let replaced = {
            let mut devices = self.devices.write().await;
            let old = devices.remove(&id);
            devices.insert(id.clone(), DeviceEntry::new(config, epoch));
            let _ = self.event_tx.send(ManagerEvent::DeviceAdded { id: id.clone() });
            old
        };

        if let Some(old) = replaced {
            info!(device = %id, "替换已有设备配置");
            Self::discard(old).await;
        }

        {
            let mut devices = self.devices.write().await;
            if let Some(entry) = devices.get_mut(&id) {
                // 期间被再次替换或移除时由新的调用负责连接
                if entry.epoch == epoch {
                    self.spawn_connect(entry);
                }
            }
        }

        info!(device = %id, "设备已添加");
    }

    /// 移除设备，取消连接任务并关闭会话。设备不存在时返回 false
    pub async fn remove(&self, id: &str) -> bool {
        let entry = self.devices.write().await.remove(id);

        match entry {
            Some(entry) => {
                Self::discard(entry).await;
                let _ = self.event_tx.send(ManagerEvent::DeviceRemoved { id: id.to_string() });
                info!(device = %id, "设备已移除");
                true
            }
            None => false,
        }
    }

    /// 移除所有设备
    pub async fn remove_all(&self) {
        let entries: Vec<DeviceEntry> = {
            let mut devices = self.devices.write().await;
            devices.drain().map(|(_, entry)| entry).collect()
        };

        let ids: Vec<String> = entries.iter().map(|e| e.config.id.clone()).collect();
        futures::future::join_all(entries.into_iter().map(Self::discard)).await;

        for id in ids {
            let _ = self.event_tx.send(ManagerEvent::DeviceRemoved { id });
        }
    }

    /// 获取所有设备状态，按 id 排序
    pub async fn list(&self) -> Vec<DeviceInfo> {
        let devices = self.devices.read().await;
        let mut infos: Vec<DeviceInfo> = devices.values().map(|entry| entry.to_info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// 获取单个设备状态
    pub async fn get(&self, id: &str) -> Option<DeviceInfo> {
        let devices = self.devices.read().await;
        devices.get(id).map(|entry| entry.to_info())
    }

    /// 设备是否有正在进行的连接
    pub async fn is_connecting(&self, id: &str) -> bool {
        let devices = self.devices.read().await;
        devices.get(id).is_some_and(|entry| entry.is_connecting())
    }

    /// 向设备发送命令。设备离线时返回 NotConnected 并在后台尝试重连
    pub async fn send(self: &Arc<Self>, id: &str, cmd: &str, data: Value) -> Result<Value> {
        let session = {
            let mut devices = self.devices.write().await;
            let entry = devices
                .get_mut(id)
                .ok_or_else(|| AppError::UnknownDevice(id.to_string()))?;

            match entry.session.clone() {
                Some(session) => session,
                None => {
                    self.spawn_connect(entry);
                    return Err(AppError::NotConnected(id.to_string()));
                }
            }
        };

        match session.request(cmd, data, self.settings.request_timeout).await {
            Ok(reply) => {
                self.refresh(id, &session, None).await;
                Ok(reply)
            }
            Err(e) if e.is_timeout() => {
                warn!(device = %id, "命令 {} 超时", cmd);
                Err(e)
            }
            Err(e) => {
                self.drop_session(id, &session, format!("发送失败: {}", e)).await;
                Err(e)
            }
        }
    }

    /// 扫描所有设备一次。已有扫描在进行时立即返回 false
    pub async fn scan(self: &Arc<Self>) -> bool {
        let Ok(_guard) = self.scan_lock.try_lock() else {
            debug!("扫描进行中，跳过");
            return false;
        };

        let snapshot: Vec<(String, Option<Arc<DeviceSession>>)> = {
            let devices = self.devices.read().await;
            let mut snapshot: Vec<_> = devices
                .iter()
                .map(|(id, entry)| (id.clone(), entry.session.clone()))
                .collect();
            snapshot.sort_by(|a, b| a.0.cmp(&b.0));
            snapshot
        };

        for (id, session) in snapshot {
            match session {
                None => {
                    let mut devices = self.devices.write().await;
                    if let Some(entry) = devices.get_mut(&id) {
                        if entry.session.is_none() {
                            entry.set_offline();
                            self.spawn_connect(entry);
                        }
                    }
                }
                Some(session) => match self.probe(&session).await {
                    Ok(firmware) => self.refresh(&id, &session, Some(firmware)).await,
                    Err(e) => {
                        self.drop_session(&id, &session, format!("探测失败: {}", e))
                            .await
                    }
                },
            }
        }

        debug!("扫描完成");
        true
    }

    /// 重新打开串口（触发板子复位）并重新探测固件
    pub async fn reset(&self, id: &str) -> Result<DeviceInfo> {
        let session = {
            let devices = self.devices.read().await;
            let entry = devices
                .get(id)
                .ok_or_else(|| AppError::UnknownDevice(id.to_string()))?;
            entry
                .session
                .clone()
                .ok_or_else(|| AppError::NotConnected(id.to_string()))?
        };

        info!(device = %id, "重置设备");
        let result = match session.reopen().await {
            Ok(()) => self.probe(&session).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(firmware) => {
                self.refresh(id, &session, Some(firmware)).await;
                self.get(id)
                    .await
                    .ok_or_else(|| AppError::UnknownDevice(id.to_string()))
            }
            Err(e) => {
                self.drop_session(id, &session, format!("重置失败: {}", e)).await;
                Err(e)
            }
        }
    }

    /// 后台启动连接任务，已有任务或已在线时不重复启动
    fn spawn_connect(self: &Arc<Self>, entry: &mut DeviceEntry) {
        if entry.session.is_some() || entry.is_connecting() {
            return;
        }

        let manager = Arc::clone(self);
        let config = entry.config.clone();
        let epoch = entry.epoch;
        entry.connect_task = Some(tokio::spawn(async move {
            manager.connect(config, epoch).await;
        }));
    }

    async fn connect(&self, config: DeviceConfig, epoch: u64) {
        debug!(device = %config.id, "连接 {} @ {}", config.port, config.baud);

        let session = match DeviceSession::open(
            Arc::clone(&self.connector),
            config.clone(),
            self.settings.settle,
        )
        .await
        {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!(device = %config.id, "打开串口失败: {}", e);
                return;
            }
        };

        let firmware = match self.probe(&session).await {
            Ok(firmware) => firmware,
            Err(e) => {
                warn!(device = %config.id, "固件探测失败: {}", e);
                session.close().await;
                return;
            }
        };

        let installed = {
            let mut devices = self.devices.write().await;
            match devices.get_mut(&config.id) {
                Some(entry) if entry.epoch == epoch && entry.session.is_none() => {
                    entry.set_online(Arc::clone(&session), firmware.clone());
                    true
                }
                _ => false,
            }
        };

        if !installed {
            debug!(device = %config.id, "设备已移除或被替换，丢弃本次连接");
            session.close().await;
            return;
        }

        debug!(device = %config.id, "连接完成，固件 {}", firmware);
        let _ = self.event_tx.send(ManagerEvent::DeviceOnline {
            id: config.id,
            firmware,
        });
    }

    /// 发送 info 并提取固件版本
    async fn probe(&self, session: &DeviceSession) -> Result<String> {
        let reply = session
            .request("info", json!({}), self.settings.probe_timeout)
            .await?;
        parse_firmware(&reply)
    }

    /// 会话仍是当前会话时更新存活时间，可选更新固件
    async fn refresh(&self, id: &str, session: &Arc<DeviceSession>, firmware: Option<String>) {
        let mut devices = self.devices.write().await;
        if let Some(entry) = devices.get_mut(id) {
            if entry.holds(session) {
                if let Some(firmware) = firmware {
                    entry.firmware = Some(firmware);
                }
                entry.touch();
            }
        }
    }

    /// 丢弃会话并标记离线
    async fn drop_session(&self, id: &str, session: &Arc<DeviceSession>, reason: String) {
        let dropped = {
            let mut devices = self.devices.write().await;
            match devices.get_mut(id) {
                Some(entry) if entry.holds(session) => entry.set_offline().is_some(),
                _ => false,
            }
        };

        session.close().await;

        if dropped {
            debug!(device = %id, "会话已丢弃: {}", reason);
            let _ = self.event_tx.send(ManagerEvent::DeviceOffline {
                id: id.to_string(),
                reason,
            });
        }
    }

    /// 清理已从注册表取出的条目
    async fn discard(mut entry: DeviceEntry) {
        if let Some(task) = entry.connect_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(session) = entry.set_offline() {
            session.close().await;
        }
    }
}

/// 从 info 响应中提取 `data.fw`
fn parse_firmware(reply: &Value) -> Result<String> {
    if reply["ok"].as_bool() != Some(true) {
        return Err(AppError::ProbeFailure(format!("设备返回失败: {}", reply)));
    }

    reply["data"]["fw"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| AppError::ProbeFailure(format!("响应缺少 fw 字段: {}", reply)))
}
