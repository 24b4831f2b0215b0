use std::{convert::Infallible, sync::Arc};

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::info;

use crate::{
    app_state::AppState,
    camera::args::ArgMap,
    core::{
        errors::AppError,
        state::{ControlStatus, Mode},
    },
    settings::SettingsKind,
};

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    app: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(flatten)]
    control: ControlStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest_file: Option<String>,
}

#[derive(Deserialize)]
pub struct ModeRequest {
    mode: Mode,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        app: state.config.app_name.clone(),
    })
}

fn settings_kind(group: &str) -> Result<SettingsKind, AppError> {
    group
        .parse()
        .map_err(|err: String| AppError::new(StatusCode::NOT_FOUND, err))
}

pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
) -> Result<Json<ArgMap>, AppError> {
    let kind = settings_kind(&group)?;
    Ok(Json(state.settings.read(kind)))
}

/// Applies a settings update and restarts a running stream so it picks the
/// change up. Capture modes see new settings on their next start.
pub async fn apply_settings(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
    Json(update): Json<ArgMap>,
) -> Result<Json<ArgMap>, AppError> {
    let kind = settings_kind(&group)?;
    if state.settings.apply(kind, update) {
        info!("{kind} settings changed");
        state.control.restart_stream().await;
    }
    Ok(Json(state.settings.read(kind)))
}

async fn status_response(state: &AppState) -> StatusResponse {
    StatusResponse {
        control: state.control.status(),
        latest_file: state.watcher.latest_file().await,
    }
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(status_response(&state).await)
}

pub async fn start(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    info!("camera start requested");
    state.control.start().await;
    Json(status_response(&state).await)
}

pub async fn stop(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    info!("camera stop requested");
    state.control.stop().await;
    Json(status_response(&state).await)
}

pub async fn set_mode(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ModeRequest>,
) -> Json<StatusResponse> {
    state.control.set_mode(payload.mode).await;
    Json(status_response(&state).await)
}

/// Pipes the live stream to the client. Disconnecting only drops this
/// subscription; the capture process keeps running.
pub async fn live(State(state): State<Arc<AppState>>) -> Response {
    info!(
        consumers = state.control.stream().receiver_count(),
        "live stream requested"
    );
    let chunks = state
        .control
        .stream()
        .into_stream()
        .map(Ok::<_, Infallible>);

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));

    (StatusCode::OK, headers, Body::from_stream(chunks)).into_response()
}
