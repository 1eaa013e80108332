//! Driver-specific JSON API backing the control panel: status polling,
//! port management, manual moves, limit/zero configuration and the
//! protocol log.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::DriverError;
use crate::focuser::FocuserController;
use crate::protocol::log::LogEntry;
use crate::protocol::scan::{self, DiscoveredDevice, PortInfo};
use crate::settings::Mode;

pub(crate) fn router(controller: Arc<FocuserController>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/ports", get(ports))
        .route("/scan", post(scan_ports))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/move", post(do_move))
        .route("/halt", post(halt))
        .route("/set-zero", post(set_zero))
        .route("/set-max", post(set_max))
        .route("/set-min", post(set_min))
        .route("/set-max-increment", post(set_max_increment))
        .route("/set-backlash", post(set_backlash))
        .route("/logs", get(logs))
        .route("/logs/clear", post(clear_logs))
        .route("/mode", get(mode).post(set_mode))
        .with_state(controller)
}

/// Driver errors become JSON problem bodies with a status that matches the
/// kind; the control panel shows the message verbatim.
struct GuiError(DriverError);

impl From<DriverError> for GuiError {
    fn from(err: DriverError) -> Self {
        Self(err)
    }
}

impl IntoResponse for GuiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            DriverError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            DriverError::InvalidOperation(_) => StatusCode::CONFLICT,
            DriverError::NotConnected
            | DriverError::PortOpen { .. }
            | DriverError::PortUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DriverError::SerialTimeout { .. } | DriverError::Protocol(_) | DriverError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type GuiResult<T> = Result<Json<T>, GuiError>;

#[derive(Debug, Serialize)]
struct GuiStatus {
    mode: Mode,
    connected: bool,
    port: Option<String>,
    position: i32,
    target_position: i32,
    is_moving: bool,
    temperature: Option<f64>,
    firmware_version: Option<String>,
    max_step: i32,
    max_increment: u32,
    min_step: u32,
    backlash: i16,
}

async fn status(State(controller): State<Arc<FocuserController>>) -> Json<GuiStatus> {
    let snapshot = controller.snapshot().await;
    Json(GuiStatus {
        mode: snapshot.mode,
        connected: snapshot.connected,
        port: snapshot.port,
        position: snapshot.position,
        target_position: snapshot.target,
        is_moving: snapshot.moving,
        temperature: snapshot.temperature,
        firmware_version: snapshot.firmware,
        max_step: snapshot.max_step,
        max_increment: snapshot.max_increment,
        min_step: snapshot.min_step,
        backlash: snapshot.backlash,
    })
}

async fn ports() -> Json<Vec<PortInfo>> {
    Json(scan::list_ports())
}

async fn scan_ports(
    State(controller): State<Arc<FocuserController>>,
) -> Json<Vec<DiscoveredDevice>> {
    Json(controller.scan_devices().await)
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    /// Omitted in simulator mode.
    port: Option<String>,
}

async fn connect(
    State(controller): State<Arc<FocuserController>>,
    Json(request): Json<ConnectRequest>,
) -> GuiResult<()> {
    if let Some(port) = request.port {
        controller.set_port(port).await?;
    }
    controller.connect().await?;
    Ok(Json(()))
}

async fn disconnect(State(controller): State<Arc<FocuserController>>) -> GuiResult<()> {
    controller.disconnect().await?;
    Ok(Json(()))
}

#[derive(Debug, Deserialize)]
struct MoveRequest {
    /// Absolute target, in logical steps.
    position: Option<i32>,
    /// Relative step count, paired with `direction`.
    steps: Option<u32>,
    /// `"in"` or `"out"`.
    direction: Option<String>,
}

async fn do_move(
    State(controller): State<Arc<FocuserController>>,
    Json(request): Json<MoveRequest>,
) -> GuiResult<()> {
    match (request.position, request.steps, request.direction.as_deref()) {
        (Some(position), None, None) => controller.move_to(position).await?,
        (None, Some(steps), Some(direction)) => {
            let steps = i32::try_from(steps)
                .map_err(|_| DriverError::InvalidValue("step count too large".to_owned()))?;
            let delta = match direction {
                "in" => -steps,
                "out" => steps,
                other => {
                    return Err(DriverError::InvalidValue(format!(
                        "direction must be \"in\" or \"out\", got {other:?}"
                    ))
                    .into())
                }
            };
            controller.move_relative(delta).await?;
        }
        _ => {
            return Err(DriverError::InvalidValue(
                "specify either position, or steps and direction".to_owned(),
            )
            .into())
        }
    }
    Ok(Json(()))
}

async fn halt(State(controller): State<Arc<FocuserController>>) -> GuiResult<()> {
    controller.halt().await?;
    Ok(Json(()))
}

#[derive(Debug, Deserialize)]
struct SetPositionRequest {
    position: i32,
}

async fn set_zero(
    State(controller): State<Arc<FocuserController>>,
    Json(request): Json<SetPositionRequest>,
) -> GuiResult<()> {
    controller.set_zero(request.position).await?;
    Ok(Json(()))
}

#[derive(Debug, Deserialize)]
struct SetValueRequest {
    value: i32,
}

async fn set_max(
    State(controller): State<Arc<FocuserController>>,
    Json(request): Json<SetValueRequest>,
) -> GuiResult<()> {
    let value = u32::try_from(request.value)
        .map_err(|_| DriverError::InvalidValue("max travel must not be negative".to_owned()))?;
    controller.set_max_travel(value).await?;
    Ok(Json(()))
}

async fn set_min(
    State(controller): State<Arc<FocuserController>>,
    Json(request): Json<SetValueRequest>,
) -> GuiResult<()> {
    controller.set_min_position(request.value).await?;
    Ok(Json(()))
}

async fn set_max_increment(
    State(controller): State<Arc<FocuserController>>,
    Json(request): Json<SetValueRequest>,
) -> GuiResult<()> {
    controller.set_max_increment(request.value).await?;
    Ok(Json(()))
}

async fn set_backlash(
    State(controller): State<Arc<FocuserController>>,
    Json(request): Json<SetValueRequest>,
) -> GuiResult<()> {
    let value = i16::try_from(request.value)
        .map_err(|_| DriverError::InvalidValue("backlash out of range".to_owned()))?;
    controller.set_backlash(value).await?;
    Ok(Json(()))
}

async fn logs(State(controller): State<Arc<FocuserController>>) -> Json<Vec<LogEntry>> {
    Json(controller.protocol_log().snapshot())
}

async fn clear_logs(State(controller): State<Arc<FocuserController>>) -> Json<()> {
    controller.protocol_log().clear();
    Json(())
}

#[derive(Debug, Serialize, Deserialize)]
struct ModeBody {
    mode: Mode,
}

async fn mode(State(controller): State<Arc<FocuserController>>) -> Json<ModeBody> {
    Json(ModeBody {
        mode: controller.mode(),
    })
}

async fn set_mode(
    State(controller): State<Arc<FocuserController>>,
    Json(request): Json<ModeBody>,
) -> GuiResult<()> {
    controller.set_mode(request.mode).await?;
    Ok(Json(()))
}
