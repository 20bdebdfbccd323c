//! 测试用的内存串口设备

use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::transport::{Connector, Transport};
use crate::error::{AppError, Result};
use crate::manager::DeviceConfig;

/// 模拟的 Arduino 设备，多个传输句柄共享同一份状态
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    firmware: Option<String>,
    silent: bool,
    disconnected: bool,
    noise_before_reply: bool,
    outbox: VecDeque<String>,
    commands: Vec<String>,
    /// 当前未关闭的传输句柄数
    handles: usize,
    /// 按时间顺序记录的 open / close
    port_log: Vec<&'static str>,
}

impl MockDevice {
    /// 对 info 返回指定固件版本的设备
    pub fn with_firmware(fw: &str) -> Self {
        let device = Self::default();
        device.state.lock().unwrap().firmware = Some(fw.to_string());
        device
    }

    /// 对 info 的响应缺少 fw 字段
    pub fn without_firmware() -> Self {
        Self::default()
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().unwrap().disconnected = disconnected;
    }

    /// 每次响应前先输出空行和非法 JSON
    pub fn set_noise(&self, noise: bool) {
        self.state.lock().unwrap().noise_before_reply = noise;
    }

    /// 向输入缓冲区注入一行
    pub fn inject(&self, line: &str) {
        self.state.lock().unwrap().outbox.push_back(line.to_string());
    }

    /// 设备收到的命令名
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// 端口打开和关闭的先后顺序
    pub fn port_log(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().port_log.clone()
    }

    fn reply_to(state: &MockState, request: &Value) -> Value {
        let cmd = request["cmd"].as_str().unwrap_or_default();
        match cmd {
            "info" => match &state.firmware {
                Some(fw) => json!({ "ok": true, "data": { "id": "mock", "fw": fw, "baud": 115200 } }),
                None => json!({ "ok": true, "data": { "id": "mock" } }),
            },
            "" => json!({ "ok": false, "error": "missing cmd" }),
            _ => json!({ "ok": true, "data": { "cmd": cmd, "echo": request["data"].clone() } }),
        }
    }
}

/// 模拟传输句柄
pub struct MockTransport {
    device: MockDevice,
    closed: bool,
}

impl MockTransport {
    fn check(&self, state: &MockState) -> io::Result<()> {
        if self.closed || state.disconnected {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock 设备已断开"));
        }
        Ok(())
    }
}

impl Transport for MockTransport {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.device.state.lock().unwrap();
        self.check(&state)?;

        let text = String::from_utf8_lossy(buf);
        let request: Value = serde_json::from_str(text.trim())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let cmd = request["cmd"].as_str().unwrap_or_default().to_string();
        state.commands.push(cmd);

        if state.silent {
            return Ok(());
        }
        if state.noise_before_reply {
            state.outbox.push_back(String::new());
            state.outbox.push_back("{not json".to_string());
        }
        let reply = MockDevice::reply_to(&state, &request);
        state.outbox.push_back(reply.to_string());
        Ok(())
    }

    fn read_line(&mut self, wait: Duration) -> io::Result<Option<String>> {
        {
            let mut state = self.device.state.lock().unwrap();
            self.check(&state)?;
            if let Some(line) = state.outbox.pop_front() {
                return Ok(Some(line));
            }
        }
        std::thread::sleep(wait.min(Duration::from_millis(10)));
        Ok(None)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let mut state = self.device.state.lock().unwrap();
        self.check(&state)?;
        state.outbox.clear();
        Ok(())
    }

    fn clear_all(&mut self) -> io::Result<()> {
        self.clear_input()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.device.state.lock().unwrap();
        state.handles -= 1;
        state.port_log.push("close");
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// 按端口名查找模拟设备的连接器
#[derive(Default)]
pub struct MockConnector {
    devices: Mutex<HashMap<String, MockDevice>>,
    open_delay: Mutex<Duration>,
    opens: AtomicUsize,
    exclusive: AtomicBool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, port: &str, device: MockDevice) {
        self.devices.lock().unwrap().insert(port.to_string(), device);
    }

    /// 与 Linux 串口一致：端口被占用时再次打开返回 ResourceBusy
    pub fn set_exclusive(&self, exclusive: bool) {
        self.exclusive.store(exclusive, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn open(&self, config: &DeviceConfig) -> Result<Box<dyn Transport>> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let delay = *self.open_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let device = self
            .devices
            .lock()
            .unwrap()
            .get(&config.port)
            .cloned()
            .ok_or_else(|| {
                AppError::Transport(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("端口不存在: {}", config.port),
                ))
            })?;

        {
            let mut state = device.state.lock().unwrap();
            if state.disconnected {
                return Err(AppError::Transport(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("端口不可用: {}", config.port),
                )));
            }
            if self.exclusive.load(Ordering::SeqCst) && state.handles > 0 {
                return Err(AppError::Transport(io::Error::new(
                    io::ErrorKind::ResourceBusy,
                    format!("端口已被占用: {}", config.port),
                )));
            }
            state.handles += 1;
            state.port_log.push("open");
        }

        Ok(Box::new(MockTransport {
            device,
            closed: false,
        }))
    }
}
