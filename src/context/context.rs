use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::manager::{ManagerEvent, ManagerSettings, SerialManager};
use crate::serial::Connector;

/// Context trait，定义 API 层需要的接口
pub trait IContext: Send + Sync {
    fn manager(&self) -> &Arc<SerialManager>;

    /// 请求进程有序退出
    fn request_shutdown(&self);
}

/// 进程级状态：设备管理器、后台任务和退出信号
pub struct Context {
    manager: Arc<SerialManager>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Context {
    /// 创建管理器，添加配置中的设备并启动后台扫描
    pub async fn init(config: &GatewayConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let manager = SerialManager::new(connector, ManagerSettings::from(&config.manager));
        let event_task = spawn_event_logger(manager.subscribe_events());

        for device in &config.devices {
            manager.add(device.clone()).await;
        }
        info!("已添加 {} 个串口设备", config.devices.len());

        let scan_task = spawn_scan_loop(Arc::clone(&manager), config.manager.scan_interval());
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Context {
            manager,
            scan_task: Mutex::new(Some(scan_task)),
            event_task: Mutex::new(Some(event_task)),
            shutdown_tx,
        })
    }

    /// 停止后台扫描（包括进行中的一轮）并移除所有设备
    pub async fn teardown(&self) {
        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
            let _ = task.await;
            debug!("后台扫描已停止");
        }
        self.manager.remove_all().await;
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
        info!("所有串口设备已关闭");
    }

    /// 等待 /shutdown 请求
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

impl IContext for Context {
    fn manager(&self) -> &Arc<SerialManager> {
        &self.manager
    }

    fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// 按固定间隔调用 scan，单次扫描的 panic 不会终止循环
///
/// 扫描在循环任务内执行，abort 循环任务时进行中的一轮也随之取消。
fn spawn_scan_loop(manager: Arc<SerialManager>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即返回，初次连接已由 add 发起
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if AssertUnwindSafe(manager.scan()).catch_unwind().await.is_err() {
                error!("扫描任务异常退出，等待下一轮");
            }
        }
    })
}

/// 把设备状态变化写入日志，直到管理器被释放
fn spawn_event_logger(mut events: broadcast::Receiver<ManagerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ManagerEvent::DeviceAdded { id }) => debug!(device = %id, "设备已注册"),
                Ok(ManagerEvent::DeviceOnline { id, firmware }) => {
                    info!(device = %id, "设备上线，固件 {}", firmware)
                }
                Ok(ManagerEvent::DeviceOffline { id, reason }) => {
                    warn!(device = %id, "设备离线: {}", reason)
                }
                Ok(ManagerEvent::DeviceRemoved { id }) => info!(device = %id, "设备已注销"),
                Err(RecvError::Lagged(skipped)) => warn!("设备事件积压，跳过 {} 条", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
