//! 串口传输抽象
//!
//! `Transport` 是面向字节流的阻塞接口，所有方法都只能在阻塞线程
//! （`spawn_blocking`）中调用。`Connector` 负责按设备配置打开传输。

use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::Result;
use crate::manager::DeviceConfig;

/// 单行最大长度，超过后丢弃已缓冲的数据
const MAX_LINE_LEN: usize = 4096;

/// 阻塞式字节传输
pub trait Transport: Send {
    /// 写入全部字节并刷新
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// 在 `wait` 内读取一行（不含换行符）。没有完整行时返回 `Ok(None)`
    fn read_line(&mut self, wait: Duration) -> io::Result<Option<String>>;

    /// 丢弃输入缓冲区
    fn clear_input(&mut self) -> io::Result<()>;

    /// 丢弃输入和输出缓冲区
    fn clear_all(&mut self) -> io::Result<()>;

    /// 释放底层资源，错误被吞掉
    fn close(&mut self);
}

/// 传输工厂
pub trait Connector: Send + Sync {
    fn open(&self, config: &DeviceConfig) -> Result<Box<dyn Transport>>;
}

/// 基于 serialport 的连接器
pub struct SerialConnector {
    read_timeout: Duration,
}

impl SerialConnector {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Connector for SerialConnector {
    fn open(&self, config: &DeviceConfig) -> Result<Box<dyn Transport>> {
        debug!(device = %config.id, "打开串口 {} @ {}", config.port, config.baud);
        let port = serialport::new(&config.port, config.baud)
            .timeout(self.read_timeout)
            .open()?;

        Ok(Box::new(SerialTransport::new(port, self.read_timeout)))
    }
}

/// 串口传输，自行维护未读完的半行数据
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    read_timeout: Duration,
    pending: Vec<u8>,
}

impl SerialTransport {
    pub fn new(port: Box<dyn SerialPort>, read_timeout: Duration) -> Self {
        Self {
            port: Some(port),
            read_timeout,
            pending: Vec::new(),
        }
    }

    fn port_mut(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "串口已关闭"))
    }

    /// 从缓冲区中取出一行
    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let port = self.port_mut()?;
        port.write_all(buf)?;
        port.flush()
    }

    fn read_line(&mut self, wait: Duration) -> io::Result<Option<String>> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }

        let deadline = Instant::now() + wait;
        let mut chunk = [0u8; 256];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let read_timeout = self.read_timeout;
            let port = self.port_mut()?;
            port.set_timeout(remaining.min(read_timeout))?;

            match port.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "串口已断开"));
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    if let Some(line) = self.take_line() {
                        return Ok(Some(line));
                    }
                    if self.pending.len() > MAX_LINE_LEN {
                        self.pending.clear();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.port_mut()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn clear_all(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.port_mut()?.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn close(&mut self) {
        // 丢弃句柄即关闭端口
        self.pending.clear();
        self.port = None;
    }
}
