//! 设备会话
//!
//! 一个会话持有一个已打开的传输，按行收发 JSON。同一会话上的请求
//! 通过异步互斥锁串行执行，阻塞读写放到 `spawn_blocking` 中完成。

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::transport::{Connector, Transport};
use crate::error::{AppError, Result};
use crate::manager::DeviceConfig;

pub struct DeviceSession {
    config: DeviceConfig,
    connector: Arc<dyn Connector>,
    settle: Duration,
    port: Arc<Mutex<Box<dyn Transport>>>,
}

impl DeviceSession {
    /// 打开传输，等待板子复位后清空缓冲区
    pub async fn open(
        connector: Arc<dyn Connector>,
        config: DeviceConfig,
        settle: Duration,
    ) -> Result<Self> {
        let transport = {
            let connector = Arc::clone(&connector);
            let config = config.clone();
            tokio::task::spawn_blocking(move || open_settled(connector.as_ref(), &config, settle))
                .await??
        };

        debug!(device = %config.id, "串口已打开: {}", config.port);
        Ok(Self {
            config,
            connector,
            settle,
            port: Arc::new(Mutex::new(transport)),
        })
    }

    /// 发送一条命令并等待第一行合法 JSON 响应
    pub async fn request(&self, cmd: &str, data: Value, timeout: Duration) -> Result<Value> {
        let packet = json!({ "cmd": cmd, "data": data });
        let mut line = serde_json::to_vec(&packet)?;
        line.push(b'\n');

        let mut port = Arc::clone(&self.port).lock_owned().await;
        trace!(device = %self.config.id, "发送: {}", packet);

        tokio::task::spawn_blocking(move || exchange(&mut **port, &line, timeout)).await?
    }

    /// 关闭后重新打开传输
    pub async fn reopen(&self) -> Result<()> {
        let mut port = Arc::clone(&self.port).lock_owned().await;
        let connector = Arc::clone(&self.connector);
        let config = self.config.clone();
        let settle = self.settle;

        tokio::task::spawn_blocking(move || {
            port.close();
            *port = open_settled(connector.as_ref(), &config, settle)?;
            Ok::<_, AppError>(())
        })
        .await??;

        debug!(device = %self.config.id, "串口已重新打开");
        Ok(())
    }

    /// 释放传输，不返回错误
    pub async fn close(&self) {
        let mut port = self.port.lock().await;
        port.close();
        debug!(device = %self.config.id, "串口已关闭");
    }
}

fn open_settled(
    connector: &dyn Connector,
    config: &DeviceConfig,
    settle: Duration,
) -> Result<Box<dyn Transport>> {
    let mut transport = connector.open(config)?;
    if !settle.is_zero() {
        std::thread::sleep(settle);
    }
    let _ = transport.clear_all();
    Ok(transport)
}

fn exchange(port: &mut dyn Transport, line: &[u8], timeout: Duration) -> Result<Value> {
    let deadline = Instant::now() + timeout;

    // 上一次交互残留的字节不能被当成本次响应
    let _ = port.clear_input();
    port.write_all(line)?;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AppError::Timeout(timeout.as_millis()));
        }

        let Some(raw) = port.read_line(remaining)? else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(raw) {
            Ok(value) => return Ok(value),
            Err(e) => trace!("跳过非法响应行 {:?}: {}", raw, e),
        }
    }
}
