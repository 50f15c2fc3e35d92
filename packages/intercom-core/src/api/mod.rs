//! HTTP/WebSocket API layer.
//!
//! This module contains thin handlers that delegate to the core
//! subsystems. It provides router construction and server startup.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::arbiter::ChannelArbiter;
use crate::capture::AudioCaptureBuffer;
use crate::chime::ChimeStore;
use crate::clients::WebClientRegistry;
use crate::router::SessionRouter;
use crate::state::{Config, NodeRegistry};
use crate::stats::SequenceTracker;
use crate::tts::TtsBridge;

pub mod http;
pub mod ws;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the TCP listener.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// A thin wrapper over the hub's subsystems; all business logic lives in
/// the subsystems themselves.
#[derive(Clone)]
pub struct AppState {
    pub arbiter: Arc<ChannelArbiter>,
    pub router: Arc<SessionRouter>,
    pub chimes: Arc<ChimeStore>,
    pub capture: Arc<AudioCaptureBuffer>,
    pub stats: Arc<SequenceTracker>,
    pub nodes: Arc<NodeRegistry>,
    pub clients: Arc<WebClientRegistry>,
    pub tts: TtsBridge,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

/// Bearer-token check applied to every `/api` route.
///
/// With no `admin_password` configured the whole surface is open (it
/// lives on the LAN); with one configured, every route requires it -
/// `/api/status` included.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ref password) = state.config.admin_password else {
        return next.run(request).await;
    };
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == password)
        .unwrap_or(false);
    if authorized {
        next.run(request).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

/// Starts the HTTP/WebSocket server on the configured port.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let port = state.config.ws_port;
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    log::info!("[Server] Listening on http://0.0.0.0:{}", port);
    let app = http::create_router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}
