//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to the chime store, capture
//! buffer, and stats tracker. Arbitration errors surface as HTTP status
//! codes through `IntercomError::into_response`.

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::api::ws::ws_handler;
use crate::api::{require_auth, AppState};
use crate::capture::{CaptureFilter, Direction};
use crate::error::{IntercomError, IntercomResult};
use crate::packet::DeviceId;
use crate::protocol::MAX_CHIME_UPLOAD_BYTES;

/// Builds the API router.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/chimes", get(list_chimes))
        .route("/api/chimes/upload", post(upload_chime))
        .route("/api/chimes/active", post(select_chime))
        .route("/api/chimes/{name}", delete(delete_chime))
        .route("/api/audio_capture", post(control_capture).get(fetch_capture))
        .route("/api/audio_stats", get(audio_stats).post(reset_stats))
        .route("/api/status", get(status))
        .layer(DefaultBodyLimit::max(MAX_CHIME_UPLOAD_BYTES + 64 * 1024))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(api)
        .route("/ws", get(ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Chimes
// ─────────────────────────────────────────────────────────────────────────────

async fn list_chimes(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "chimes": state.chimes.list(),
        "active": state.chimes.active_name(),
    }))
}

async fn upload_chime(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> IntercomResult<impl IntoResponse> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| IntercomError::InvalidRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .ok_or_else(|| IntercomError::InvalidRequest("missing file name".to_string()))?
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|_| IntercomError::TooLarge(MAX_CHIME_UPLOAD_BYTES))?;
        let info = state.chimes.upload(&file_name, &bytes)?;
        return Ok((StatusCode::CREATED, Json(info)));
    }
    Err(IntercomError::InvalidRequest(
        "multipart field 'file' is required".to_string(),
    ))
}

#[derive(Deserialize)]
struct SelectChime {
    name: String,
}

async fn select_chime(
    State(state): State<AppState>,
    Json(body): Json<SelectChime>,
) -> IntercomResult<impl IntoResponse> {
    state.chimes.set_active(&body.name)?;
    Ok(Json(json!({ "active": body.name })))
}

async fn delete_chime(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> IntercomResult<impl IntoResponse> {
    state.chimes.delete(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

// ─────────────────────────────────────────────────────────────────────────────
// Audio Capture
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CaptureControl {
    action: String,
}

async fn control_capture(
    State(state): State<AppState>,
    Json(body): Json<CaptureControl>,
) -> IntercomResult<impl IntoResponse> {
    match body.action.as_str() {
        "start" => state.capture.start(),
        "stop" => state.capture.stop(),
        "clear" => state.capture.clear(),
        other => {
            return Err(IntercomError::InvalidRequest(format!(
                "unknown action '{}'",
                other
            )))
        }
    }
    Ok(Json(json!({
        "enabled": state.capture.is_enabled(),
        "frames": state.capture.len(),
    })))
}

#[derive(Deserialize)]
struct CaptureQuery {
    direction: Option<String>,
    device_id: Option<String>,
    since: Option<u64>,
    limit: Option<usize>,
}

async fn fetch_capture(
    State(state): State<AppState>,
    Query(query): Query<CaptureQuery>,
) -> IntercomResult<impl IntoResponse> {
    let direction = match query.direction.as_deref() {
        None | Some("") => None,
        Some(s) => Some(Direction::parse(s).ok_or_else(|| {
            IntercomError::InvalidRequest(format!("unknown direction '{}'", s))
        })?),
    };
    let device_id = match query.device_id.as_deref() {
        None | Some("") => None,
        Some(s) => Some(DeviceId::parse_hex(s).ok_or_else(|| {
            IntercomError::InvalidRequest(format!("bad device id '{}'", s))
        })?),
    };
    let frames = state.capture.fetch(&CaptureFilter {
        direction,
        device_id,
        since_ms: query.since,
        limit: query.limit,
    });
    Ok(Json(json!({
        "enabled": state.capture.is_enabled(),
        "count": frames.len(),
        "frames": frames,
    })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats & Status
// ─────────────────────────────────────────────────────────────────────────────

async fn audio_stats(State(state): State<AppState>) -> impl IntoResponse {
    let senders: serde_json::Map<String, serde_json::Value> = state
        .stats
        .snapshot()
        .into_iter()
        .map(|(id, stats)| (id, serde_json::to_value(stats).unwrap_or_default()))
        .collect();
    Json(json!({
        "senders": senders,
        "tx": state.stats.tx_snapshot(),
    }))
}

async fn reset_stats(State(state): State<AppState>) -> impl IntoResponse {
    state.stats.reset();
    Json(json!({ "reset": true }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let speaker = state
        .arbiter
        .active()
        .map(|(origin, priority, target)| {
            json!({
                "origin": origin.to_string(),
                "priority": priority,
                "target": target.to_string(),
            })
        });
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "device_name": state.config.device_name,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "channel_busy": state.router.is_channel_busy(),
        "dnd": state.arbiter.dnd(),
        "speaker": speaker,
        "nodes": state.nodes.len(),
        "web_clients": state.clients.len(),
        "capture_enabled": state.capture.is_enabled(),
        "active_chime": state.chimes.active_name(),
    }))
}
