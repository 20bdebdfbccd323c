//! 串口传输与设备会话

mod session;
mod transport;

#[cfg(test)]
pub mod mock;

pub use session::DeviceSession;
pub use transport::{Connector, SerialConnector};
