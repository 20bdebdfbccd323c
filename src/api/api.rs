use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::context::context::IContext;
use crate::error::{AppError, Result};
use crate::manager::DeviceInfo;

type SharedContext = Arc<dyn IContext + Sync + Send>;

/// 命令请求
#[derive(Debug, Deserialize)]
pub struct CmdRequest {
    pub cmd: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// 简单成功响应
#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// 设备列表响应
#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub ok: bool,
    pub devices: Vec<DeviceInfo>,
}

/// 单个设备响应
#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub ok: bool,
    pub device: DeviceInfo,
}

/// 命令响应，data 为设备原样返回的 JSON
#[derive(Debug, Serialize)]
pub struct CmdResponse {
    pub ok: bool,
    pub data: Value,
}

pub struct ApiServer {
    pub app: Router,
}

impl ApiServer {
    pub fn new(ctx: SharedContext) -> Self {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = Router::new()
            .route("/health", get(Self::health))
            .route("/arduino/devices", get(Self::list_devices))
            .route("/arduino/scan", post(Self::scan))
            .route("/arduino/rescan", post(Self::scan))
            .route("/arduino/{id}", get(Self::get_device))
            .route("/arduino/{id}/cmd", post(Self::send_cmd))
            .route("/arduino/{id}/reset", post(Self::reset_device))
            .route("/shutdown", post(Self::shutdown))
            .layer(cors)
            .with_state(ctx);
        ApiServer { app }
    }

    /// 启动 API 服务器，`shutdown` 完成后优雅退出
    pub async fn run<F>(self, listen: &str, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(listen).await?;
        info!("Server running on http://{}", listener.local_addr()?);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await
    }

    /// 存活检查
    async fn health() -> Json<OkResponse> {
        Json(OkResponse { ok: true })
    }

    /// 获取设备列表
    async fn list_devices(State(ctx): State<SharedContext>) -> Json<DevicesResponse> {
        debug!("收到获取设备列表请求");
        Json(DevicesResponse {
            ok: true,
            devices: ctx.manager().list().await,
        })
    }

    /// 立即扫描一次
    async fn scan(State(ctx): State<SharedContext>) -> Result<Json<DevicesResponse>> {
        debug!("收到扫描请求");
        let manager = Arc::clone(ctx.manager());
        tokio::spawn(async move { manager.scan().await }).await?;

        Ok(Json(DevicesResponse {
            ok: true,
            devices: ctx.manager().list().await,
        }))
    }

    /// 获取设备状态
    async fn get_device(
        State(ctx): State<SharedContext>,
        Path(id): Path<String>,
    ) -> Result<Json<DeviceResponse>> {
        let device = ctx
            .manager()
            .get(&id)
            .await
            .ok_or(AppError::UnknownDevice(id))?;

        Ok(Json(DeviceResponse { ok: true, device }))
    }

    /// 转发命令到设备
    async fn send_cmd(
        State(ctx): State<SharedContext>,
        Path(id): Path<String>,
        payload: std::result::Result<Json<CmdRequest>, JsonRejection>,
    ) -> Result<Json<CmdResponse>> {
        let Json(req) = payload?;
        debug!(device = %id, "收到命令: {}", req.cmd);
        let data = ctx
            .manager()
            .send(&id, &req.cmd, Value::Object(req.data))
            .await?;

        Ok(Json(CmdResponse { ok: true, data }))
    }

    /// 重置设备（重新打开串口）
    async fn reset_device(
        State(ctx): State<SharedContext>,
        Path(id): Path<String>,
    ) -> Result<Json<DeviceResponse>> {
        let device = ctx.manager().reset(&id).await?;
        Ok(Json(DeviceResponse { ok: true, device }))
    }

    /// 请求进程退出
    async fn shutdown(State(ctx): State<SharedContext>) -> Json<OkResponse> {
        info!("收到退出请求");
        ctx.request_shutdown();
        Json(OkResponse { ok: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::context::context::Context;
    use crate::manager::DeviceConfig;
    use crate::serial::mock::{MockConnector, MockDevice};
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use std::time::{Duration, Instant};
    use tower::ServiceExt;

    async fn setup(device: Option<MockDevice>) -> (Arc<Context>, Router) {
        let connector = Arc::new(MockConnector::new());
        if let Some(device) = device {
            connector.attach("/dev/ttyUSB0", device);
        }

        let mut config = GatewayConfig::default();
        config.manager.scan_interval_ms = 60_000;
        config.manager.settle_ms = 0;
        config.manager.probe_timeout_ms = 200;
        config.manager.request_timeout_ms = 300;
        config.devices = vec![DeviceConfig::new("light_controller", "/dev/ttyUSB0", 115200)];

        let ctx = Context::init(&config, connector).await;
        let deadline = Instant::now() + Duration::from_secs(3);
        while ctx.manager().is_connecting("light_controller").await {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let app = ApiServer::new(ctx.clone()).app;
        (ctx, app)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (_ctx, app) = setup(None).await;
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_list_devices() {
        let (_ctx, app) = setup(Some(MockDevice::with_firmware("v1.2"))).await;
        let (status, body) = call(&app, "GET", "/arduino/devices", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["devices"][0]["id"], "light_controller");
        assert_eq!(body["devices"][0]["online"], true);
        assert_eq!(body["devices"][0]["firmware"], "v1.2");
    }

    #[tokio::test]
    async fn test_cmd_forwards_reply() {
        let (_ctx, app) = setup(Some(MockDevice::with_firmware("v1"))).await;
        let (status, body) = call(
            &app,
            "POST",
            "/arduino/light_controller/cmd",
            Some(serde_json::json!({ "cmd": "blink", "data": { "times": 2 } })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["data"]["data"]["cmd"], "blink");
        assert_eq!(body["data"]["data"]["echo"]["times"], 2);
    }

    #[tokio::test]
    async fn test_cmd_data_defaults_to_empty() {
        let (_ctx, app) = setup(Some(MockDevice::with_firmware("v1"))).await;
        let (status, body) = call(
            &app,
            "POST",
            "/arduino/light_controller/cmd",
            Some(serde_json::json!({ "cmd": "ping" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["data"]["echo"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_cmd_malformed_body() {
        let (_ctx, app) = setup(Some(MockDevice::with_firmware("v1"))).await;

        for body in [
            serde_json::json!({ "data": { "n": 1 } }),
            serde_json::json!({ "cmd": "blink", "data": 3 }),
        ] {
            let (status, body) = call(&app, "POST", "/arduino/light_controller/cmd", Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["ok"], false);
            assert!(body["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_cmd_unknown_device() {
        let (_ctx, app) = setup(None).await;
        let (status, body) = call(
            &app,
            "POST",
            "/arduino/missing-id/cmd",
            Some(serde_json::json!({ "cmd": "ping" })),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_cmd_not_connected() {
        let (_ctx, app) = setup(None).await;
        let (status, body) = call(
            &app,
            "POST",
            "/arduino/light_controller/cmd",
            Some(serde_json::json!({ "cmd": "ping" })),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_cmd_timeout() {
        let device = MockDevice::with_firmware("v1");
        let (_ctx, app) = setup(Some(device.clone())).await;
        device.set_silent(true);

        let (status, body) = call(
            &app,
            "POST",
            "/arduino/light_controller/cmd",
            Some(serde_json::json!({ "cmd": "blink" })),
        )
        .await;

        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["ok"], false);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_scan_returns_devices() {
        let device = MockDevice::with_firmware("v1");
        let (_ctx, app) = setup(Some(device.clone())).await;
        device.set_disconnected(true);

        let (status, body) = call(&app, "POST", "/arduino/scan", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["devices"][0]["online"], false);
        assert_eq!(body["devices"][0]["firmware"], Value::Null);
    }

    #[tokio::test]
    async fn test_get_and_reset_device() {
        let (_ctx, app) = setup(Some(MockDevice::with_firmware("v4"))).await;

        let (status, body) = call(&app, "GET", "/arduino/light_controller", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device"]["firmware"], "v4");

        let (status, body) = call(&app, "POST", "/arduino/light_controller/reset", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device"]["online"], true);

        let (status, _) = call(&app, "GET", "/arduino/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_shutdown_request() {
        let (ctx, app) = setup(None).await;
        let (status, body) = call(&app, "POST", "/shutdown", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        tokio::time::timeout(Duration::from_secs(1), ctx.shutdown_requested())
            .await
            .unwrap();
    }
}
