use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// 应用程序统一错误类型
#[derive(Error, Debug)]
pub enum AppError {
    /// 设备未配置
    #[error("未知设备: {0}")]
    UnknownDevice(String),

    /// 设备已配置但没有可用会话
    #[error("设备未连接: {0}")]
    NotConnected(String),

    /// 在截止时间之前没有收到合法的响应行
    #[error("等待设备响应超时 ({0} ms)")]
    Timeout(u128),

    /// 串口打开/读写失败
    #[error("串口传输错误: {0}")]
    Transport(#[from] std::io::Error),

    /// serialport 打开端口失败
    #[error("串口错误: {0}")]
    Serial(#[from] serialport::Error),

    /// 握手响应缺少固件版本
    #[error("固件探测失败: {0}")]
    ProbeFailure(String),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// 请求体无法解析为命令
    #[error("请求格式错误: {0}")]
    InvalidRequest(String),

    /// 未知错误
    #[error("未知错误: {0}")]
    Unknown(String),
}

/// AppError 的 Result 类型别名
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// 将错误转换为 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::UnknownDevice(_) => StatusCode::NOT_FOUND,
            AppError::NotConnected(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Json(_) | AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Transport(_)
            | AppError::Serial(_)
            | AppError::ProbeFailure(_)
            | AppError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 是否为超时错误（超时不会断开会话）
    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::Timeout(_))
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        AppError::Unknown(format!("后台任务失败: {}", e))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "ok": false, "error": self.to_string() }))).into_response()
    }
}
