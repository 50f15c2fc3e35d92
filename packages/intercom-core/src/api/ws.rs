//! Web PTT WebSocket server.
//!
//! Per-client state machine: Connecting -> Ready -> (Transmitting |
//! Receiving) -> Ready -> Closed. The server speaks first
//! (`{"type":"hello","protocol":"intercom/1"}`); the client's first
//! meaningful message is `identify`.
//!
//! Binary ingress is raw 16-bit mono 16 kHz PCM, accumulated to exact
//! 20 ms frames, encoded, and packetized under the client's hub-owned
//! device id with a sequence that stays monotonic across browser
//! suspend/resume - a paused audio context never offsets or resets the
//! stream on other sinks. Binary egress is decoded PCM from the active
//! speaker.
//!
//! [`publish_state`] is the only server->client state emitter; targeted
//! per-client updates pass `notify_web = false` to the accompanying
//! broadcast so nothing is notified twice.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::api::AppState;
use crate::arbiter::{ArbiterEvent, Origin, ReleaseReason, RoomTarget};
use crate::clients::{WebClientHandle, WsClientState, WsOutbound};
use crate::codec::{pcm_from_le_bytes, AudioEncoder};
use crate::error::ErrorCode;
use crate::packet::{AudioFrame, Priority};
use crate::protocol::{FRAME_SAMPLES, WS_PROTOCOL};

/// Close idle sockets after this long without any client traffic.
const WS_HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// Interval between heartbeat checks.
const WS_HEARTBEAT_CHECK_INTERVAL_SECS: u64 = 1;

static NEXT_ANON: AtomicU32 = AtomicU32::new(1);

// ─────────────────────────────────────────────────────────────────────────────
// Protocol
// ─────────────────────────────────────────────────────────────────────────────

/// Incoming control messages.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WsIncoming {
    Identify {
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        device_name: Option<String>,
    },
    State {
        state: String,
    },
    Target {
        target: String,
    },
    Volume {
        volume: u8,
    },
    Mute {
        mute: bool,
    },
    Dnd {
        dnd: bool,
    },
    Agc {
        agc: bool,
    },
    Priority {
        priority: String,
    },
    Call {
        #[serde(default)]
        target: Option<String>,
    },
}

fn hello_json() -> String {
    json!({ "type": "hello", "protocol": WS_PROTOCOL }).to_string()
}

fn reject_json(code: &str) -> String {
    json!({ "type": "reject", "reason": code }).to_string()
}

/// Per-client state message: the client's own state plus the channel's.
fn client_state_json(app: &AppState, client: &WebClientHandle) -> String {
    let speaker = app.arbiter.active();
    json!({
        "type": "state",
        "state": client.state().name(),
        "speaker": speaker.as_ref().map(|(origin, _, _)| origin.to_string()),
        "target": client.target().to_string(),
        "volume": client.volume(),
        "mute": client.mute(),
        "dnd": client.dnd(),
        "agc": client.agc(),
        "priority": client.priority(),
    })
    .to_string()
}

/// The only server->client state emitter. `notify_web = false` skips the
/// broadcast (used when a targeted update was already delivered).
pub fn publish_state(app: &AppState, notify_web: bool) {
    if !notify_web {
        return;
    }
    app.clients
        .for_each(|client| client.send(WsOutbound::Json(client_state_json(app, client))));
}

/// Sends one client its own state, suppressing the broadcast.
pub fn notify_targeted_web_client_state(app: &AppState, client_id: &str) {
    if let Some(client) = app.clients.get(client_id) {
        client.send(WsOutbound::Json(client_state_json(app, &client)));
    }
    publish_state(app, false);
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection Handling
// ─────────────────────────────────────────────────────────────────────────────

/// Upgrade-request credentials. Browsers cannot set headers on a
/// WebSocket handshake, so a `?token=` query param stands in for the
/// `Authorization` bearer.
#[derive(Deserialize)]
pub struct WsAuthQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Applies the same admin-password rule as the HTTP surface: with no
/// password configured the endpoint is open; with one configured the
/// upgrade must carry it.
fn upgrade_authorized(password: Option<&str>, headers: &HeaderMap, token: Option<&str>) -> bool {
    let Some(password) = password else {
        return true;
    };
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    bearer == Some(password) || token == Some(password)
}

/// WebSocket upgrade handler. Rejects the handshake outright when an
/// admin password is configured and the request does not carry it - no
/// hello, no client registration.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(auth): Query<WsAuthQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if !upgrade_authorized(
        state.config.admin_password.as_deref(),
        &headers,
        auth.token.as_deref(),
    ) {
        log::warn!("[Web] Rejected unauthorized WebSocket upgrade");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_ws(socket, state))
        .into_response()
}

/// Cleanup on every exit path: releases the channel if this client held
/// it and removes the client from the arena.
struct ClientGuard {
    app: AppState,
    client: Arc<WebClientHandle>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let device = self.client.device;
        if self
            .app
            .arbiter
            .active()
            .map(|(origin, _, _)| origin.device() == device)
            .unwrap_or(false)
        {
            self.app.arbiter.end(device);
        }
        self.app.clients.remove(&self.client.client_id);
        log::info!("[Web] Client '{}' disconnected", self.client.client_id);
        publish_state(&self.app, true);
    }
}

async fn handle_ws(socket: WebSocket, app: AppState) {
    let (mut sender, mut receiver) = socket.split();

    if sender
        .send(Message::Text(hello_json().into()))
        .await
        .is_err()
    {
        return;
    }

    // Identify phase: wait for the first parseable identify message.
    let (client_id, device_name) = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Ok(WsIncoming::Identify {
                    client_id,
                    device_name,
                }) = serde_json::from_str::<WsIncoming>(&text)
                {
                    let device_name = device_name.unwrap_or_else(|| "browser".to_string());
                    let client_id = client_id
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| {
                            format!("web-{}", NEXT_ANON.fetch_add(1, Ordering::Relaxed))
                        });
                    break (client_id, device_name);
                }
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            _ => {}
        }
    };

    let Ok(mut encoder) = AudioEncoder::new() else {
        log::error!("[Web] Could not allocate encoder for '{}'", client_id);
        return;
    };

    let (client, mut outbound) = app.clients.register(&client_id, &device_name);
    log::info!(
        "[Web] Client '{}' ({}) connected as {}",
        client_id,
        device_name,
        client.device
    );
    let guard = ClientGuard {
        app: app.clone(),
        client: Arc::clone(&client),
    };

    // Ack the identify with the fresh client state.
    notify_targeted_web_client_state(&app, &client_id);

    let mut events = app.arbiter.subscribe();
    let mut pending: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES * 4);
    let mut last_activity = Instant::now();
    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(WS_HEARTBEAT_CHECK_INTERVAL_SECS));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Outbound queue -> socket.
            out = outbound.recv() => {
                let Some(out) = out else { break };
                let message = match out {
                    WsOutbound::Pcm(pcm) => Message::Binary(pcm),
                    WsOutbound::Json(text) => Message::Text(text.into()),
                };
                if sender.send(message).await.is_err() {
                    break;
                }
            }

            // Client -> server.
            inbound = receiver.next() => {
                last_activity = Instant::now();
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsIncoming>(&text) {
                            Ok(msg) => handle_control(&app, &guard.client, &mut pending, msg),
                            Err(_) => log::debug!("[Web] '{}': unknown message ignored", client_id),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        ingest_pcm(&app, &guard.client, &mut encoder, &mut pending, &data);
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }

            // Arbiter events drive the Receiving half of the state machine.
            event = events.recv() => {
                match event {
                    Ok(event) => handle_arbiter_event(&app, &guard.client, event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // Resync: push the current state.
                        notify_targeted_web_client_state(&app, &client_id);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat.tick() => {
                if last_activity.elapsed() > Duration::from_secs(WS_HEARTBEAT_TIMEOUT_SECS) {
                    log::warn!("[Web] '{}' heartbeat timeout", client_id);
                    break;
                }
            }
        }
    }

    // ClientGuard::drop releases the channel and the arena slot.
}

/// Applies a JSON control message.
fn handle_control(
    app: &AppState,
    client: &Arc<WebClientHandle>,
    pending: &mut Vec<i16>,
    msg: WsIncoming,
) {
    match msg {
        WsIncoming::Identify { .. } => {
            // Already identified; ignore.
        }
        WsIncoming::State { state } => match state.as_str() {
            "transmitting" => {
                let origin = Origin::WebClient {
                    client_id: client.client_id.clone(),
                    device: client.device,
                };
                match app.arbiter.try_admit(
                    origin,
                    client.priority(),
                    client.target(),
                    Instant::now(),
                ) {
                    Ok(()) => {
                        app.clients.set_state(client, WsClientState::Transmitting);
                        notify_targeted_web_client_state(app, &client.client_id);
                    }
                    Err(e) => {
                        client.send(WsOutbound::Json(reject_json(e.code())));
                    }
                }
            }
            "idle" => {
                if client.state() == WsClientState::Transmitting {
                    app.arbiter.end(client.device);
                }
                pending.clear();
                app.clients.set_state(client, WsClientState::Idle);
                notify_targeted_web_client_state(app, &client.client_id);
            }
            other => {
                log::debug!("[Web] '{}': unsupported state '{}'", client.client_id, other);
            }
        },
        WsIncoming::Target { target } => {
            client.set_target(RoomTarget::parse(&target));
            notify_targeted_web_client_state(app, &client.client_id);
        }
        WsIncoming::Volume { volume } => {
            client.set_volume(volume);
            notify_targeted_web_client_state(app, &client.client_id);
        }
        WsIncoming::Mute { mute } => {
            client.set_mute(mute);
            notify_targeted_web_client_state(app, &client.client_id);
        }
        WsIncoming::Dnd { dnd } => {
            client.set_dnd(dnd);
            notify_targeted_web_client_state(app, &client.client_id);
        }
        WsIncoming::Agc { agc } => {
            client.set_agc(agc);
            notify_targeted_web_client_state(app, &client.client_id);
        }
        WsIncoming::Priority { priority } => {
            match Priority::parse_name(&priority) {
                Some(p) => {
                    client.set_priority(p);
                    notify_targeted_web_client_state(app, &client.client_id);
                }
                None => client.send(WsOutbound::Json(reject_json("invalid_request"))),
            }
        }
        WsIncoming::Call { target } => {
            let target = target
                .map(|t| RoomTarget::parse(&t))
                .unwrap_or_else(|| client.target());
            let chime = app.chimes.active_chime();
            let router = Arc::clone(&app.router);
            let from = client.client_id.clone();
            let priority = client.priority();
            tokio::spawn(async move {
                router.announce_call(from, target, priority, &chime).await;
            });
        }
    }
}

/// Accumulates raw PCM to exact frames, encodes, and routes.
///
/// A browser whose audio context was suspended stops heartbeating and
/// loses the channel to the 500 ms reclaim; when its frames resume while
/// PTT is still held, the stream re-admits transparently and the
/// sequence continues where it left off.
fn ingest_pcm(
    app: &AppState,
    client: &Arc<WebClientHandle>,
    encoder: &mut AudioEncoder,
    pending: &mut Vec<i16>,
    data: &[u8],
) {
    if client.state() != WsClientState::Transmitting {
        return;
    }
    pending.extend(pcm_from_le_bytes(data));
    while pending.len() >= FRAME_SAMPLES {
        let now = Instant::now();
        if !app.arbiter.heartbeat(client.device, now) {
            let origin = Origin::WebClient {
                client_id: client.client_id.clone(),
                device: client.device,
            };
            if let Err(e) =
                app.arbiter
                    .try_admit(origin, client.priority(), client.target(), now)
            {
                log::debug!("[Web] '{}': resume not admitted: {}", client.client_id, e);
                pending.clear();
                return;
            }
        }
        let frame_pcm: Vec<i16> = pending.drain(..FRAME_SAMPLES).collect();
        match encoder.encode(&frame_pcm) {
            Ok(payload) => {
                let frame = AudioFrame::new(
                    client.device,
                    client.next_seq(),
                    client.priority(),
                    payload.into(),
                );
                app.router.route_frame(frame, false);
            }
            Err(e) => {
                log::debug!("[Web] '{}': encode error: {}", client.client_id, e);
                app.stats.record_tx_error();
            }
        }
    }
}

/// Maps channel transitions onto this client's Receiving state.
fn handle_arbiter_event(app: &AppState, client: &Arc<WebClientHandle>, event: ArbiterEvent) {
    match event {
        ArbiterEvent::Admitted { origin, target, .. } => {
            if origin.device() == client.device {
                return;
            }
            let listening = match &target {
                RoomTarget::All => true,
                RoomTarget::Room(room) => match client.target() {
                    RoomTarget::All => true,
                    RoomTarget::Room(r) => &r == room,
                },
            };
            if listening && client.state() == WsClientState::Idle {
                app.clients.set_state(client, WsClientState::Receiving);
                notify_targeted_web_client_state(app, &client.client_id);
            }
        }
        ArbiterEvent::Released { origin, reason, .. } => {
            if origin.device() == client.device {
                // Timeout reclaim keeps the client logically transmitting:
                // its PTT is still held and the next frames re-admit. An
                // explicit end or a preemption means the stream is over.
                if reason != ReleaseReason::Timeout
                    && client.state() == WsClientState::Transmitting
                {
                    app.clients.set_state(client, WsClientState::Idle);
                    notify_targeted_web_client_state(app, &client.client_id);
                }
            } else if client.state() == WsClientState::Receiving {
                app.clients.set_state(client, WsClientState::Idle);
                notify_targeted_web_client_state(app, &client.client_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::ChannelArbiter;
    use crate::capture::AudioCaptureBuffer;
    use crate::chime::ChimeStore;
    use crate::clients::WebClientRegistry;
    use crate::router::{tx_queue, SessionRouter, TxItem};
    use crate::state::{Config, NodeRegistry};
    use crate::stats::SequenceTracker;
    use crate::tts::TtsBridge;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn test_app_state(
        cancel: &CancellationToken,
        data_dir: &std::path::Path,
    ) -> (AppState, mpsc::Receiver<TxItem>) {
        let arbiter = Arc::new(ChannelArbiter::new());
        let nodes = Arc::new(NodeRegistry::new());
        let clients = Arc::new(WebClientRegistry::new());
        let capture = Arc::new(AudioCaptureBuffer::new(64));
        let stats = Arc::new(SequenceTracker::new());
        let chimes = Arc::new(ChimeStore::open(data_dir).unwrap());
        let (tx, tx_rx) = tx_queue();
        let (publish, _publish_rx) = mpsc::channel(8);
        let router = Arc::new(
            SessionRouter::new(
                Arc::clone(&arbiter),
                Arc::clone(&nodes),
                Arc::clone(&clients),
                Arc::clone(&capture),
                Arc::clone(&stats),
                tx,
                publish,
                vec![],
                5005,
            )
            .unwrap(),
        );
        let tts = TtsBridge::start(
            "127.0.0.1".to_string(),
            1,
            Arc::clone(&arbiter),
            Arc::clone(&router),
            cancel.clone(),
        );
        let app = AppState {
            arbiter,
            router,
            chimes,
            capture,
            stats,
            nodes,
            clients,
            tts,
            config: Arc::new(Config::default()),
            started_at: Instant::now(),
        };
        (app, tx_rx)
    }

    #[tokio::test]
    async fn resumed_bursts_stay_sequence_contiguous() {
        let cancel = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let (app, mut tx_rx) = test_app_state(&cancel, dir.path());
        let (client, _out_rx) = app.clients.register("kiosk", "hall");
        app.clients.set_state(&client, WsClientState::Transmitting);

        let mut encoder = AudioEncoder::new().unwrap();
        let mut pending = Vec::new();
        let one_frame = vec![0u8; FRAME_SAMPLES * 2];

        // First burst: admits on the first frame.
        for _ in 0..3 {
            ingest_pcm(&app, &client, &mut encoder, &mut pending, &one_frame);
        }
        assert!(app.arbiter.channel_busy());

        // Browser audio context suspends; the 500 ms reclaim fires.
        let reclaimed = app
            .arbiter
            .reclaim_idle(Instant::now() + Duration::from_millis(600));
        assert!(reclaimed.is_some());
        assert!(!app.arbiter.channel_busy());

        // Resume: still logically transmitting, re-admits transparently.
        for _ in 0..2 {
            ingest_pcm(&app, &client, &mut encoder, &mut pending, &one_frame);
        }

        let mut seqs = Vec::new();
        while let Ok(item) = tx_rx.try_recv() {
            if let TxItem::Multicast(wire) = item {
                seqs.push(AudioFrame::parse(&wire).unwrap().frame.seq);
            }
        }
        // Both bursts, contiguous monotonic sequences, no 3 s offset.
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn ingest_drops_frames_while_not_transmitting() {
        let cancel = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let (app, mut tx_rx) = test_app_state(&cancel, dir.path());
        let (client, _out_rx) = app.clients.register("kiosk", "hall");

        let mut encoder = AudioEncoder::new().unwrap();
        let mut pending = Vec::new();
        ingest_pcm(
            &app,
            &client,
            &mut encoder,
            &mut pending,
            &vec![0u8; FRAME_SAMPLES * 2],
        );
        assert!(!app.arbiter.channel_busy());
        assert!(tx_rx.try_recv().is_err());
        cancel.cancel();
    }

    #[test]
    fn incoming_messages_parse_from_their_tags() {
        let msg: WsIncoming =
            serde_json::from_str(r#"{"type":"identify","client_id":"kiosk","device_name":"Hall"}"#)
                .unwrap();
        assert!(matches!(msg, WsIncoming::Identify { .. }));

        let msg: WsIncoming = serde_json::from_str(r#"{"type":"state","state":"transmitting"}"#).unwrap();
        assert!(matches!(msg, WsIncoming::State { .. }));

        let msg: WsIncoming = serde_json::from_str(r#"{"type":"priority","priority":"high"}"#).unwrap();
        assert!(matches!(msg, WsIncoming::Priority { .. }));

        let msg: WsIncoming = serde_json::from_str(r#"{"type":"call"}"#).unwrap();
        assert!(matches!(msg, WsIncoming::Call { target: None }));

        assert!(serde_json::from_str::<WsIncoming>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn upgrade_is_open_without_a_password() {
        let headers = HeaderMap::new();
        assert!(upgrade_authorized(None, &headers, None));
        assert!(upgrade_authorized(None, &headers, Some("anything")));
    }

    #[test]
    fn upgrade_requires_the_password_when_configured() {
        let headers = HeaderMap::new();
        assert!(!upgrade_authorized(Some("hunter2"), &headers, None));
        assert!(!upgrade_authorized(Some("hunter2"), &headers, Some("wrong")));
        assert!(upgrade_authorized(Some("hunter2"), &headers, Some("hunter2")));
    }

    #[test]
    fn upgrade_accepts_a_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer hunter2".parse().unwrap());
        assert!(upgrade_authorized(Some("hunter2"), &headers, None));

        let mut wrong = HeaderMap::new();
        wrong.insert(header::AUTHORIZATION, "Bearer nope".parse().unwrap());
        assert!(!upgrade_authorized(Some("hunter2"), &wrong, None));
    }

    #[test]
    fn hello_carries_the_protocol_id() {
        let hello: serde_json::Value = serde_json::from_str(&hello_json()).unwrap();
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["protocol"], "intercom/1");
    }

    #[test]
    fn reject_carries_the_error_code() {
        let reject: serde_json::Value = serde_json::from_str(&reject_json("busy")).unwrap();
        assert_eq!(reject["type"], "reject");
        assert_eq!(reject["reason"], "busy");
    }
}
