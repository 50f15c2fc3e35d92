//! TTS bridge: queued synthesis injected as a synthetic speaker.
//!
//! Requests queue in a worker task. The worker waits for a free channel
//! (Emergency skips the wait), synthesizes over Piper's TCP protocol
//! (newline-delimited JSON request, raw 16-bit 16 kHz mono PCM until
//! EOF), pre-encodes to Opus frames, then admits and streams with
//! wall-clock pacing. Synthesis failure fails the request with
//! `TtsUnavailable` - the channel is never held across synthesis.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::arbiter::{ChannelArbiter, Origin, RoomTarget};
use crate::codec::{pcm_from_le_bytes, AudioEncoder};
use crate::error::{IntercomError, IntercomResult};
use crate::packet::Priority;
use crate::protocol::FRAME_SAMPLES;
use crate::router::{SessionRouter, HUB_TTS_DEVICE};

/// How long the worker waits for the channel before giving up.
const CHANNEL_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for the channel.
const CHANNEL_POLL: Duration = Duration::from_millis(100);

/// Connect/synthesis timeout against Piper.
const SYNTH_TIMEOUT: Duration = Duration::from_secs(10);

/// A queued synthesis request.
pub struct TtsRequest {
    pub message: String,
    pub target: RoomTarget,
    pub priority: Priority,
    /// Resolved when the request has been spoken (or failed).
    pub done: Option<oneshot::Sender<IntercomResult<()>>>,
}

/// Handle for enqueueing synthesis requests.
#[derive(Clone)]
pub struct TtsBridge {
    tx: mpsc::Sender<TtsRequest>,
}

impl TtsBridge {
    /// Creates the bridge and spawns its worker task.
    pub fn start(
        piper_host: String,
        piper_port: u16,
        arbiter: Arc<ChannelArbiter>,
        router: Arc<SessionRouter>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_worker(piper_host, piper_port, arbiter, router, rx, cancel));
        Self { tx }
    }

    /// Queues a request. Accepting is immediate; completion (or
    /// `TtsUnavailable`) arrives on the returned receiver.
    pub fn speak(
        &self,
        message: String,
        target: RoomTarget,
        priority: Priority,
    ) -> IntercomResult<oneshot::Receiver<IntercomResult<()>>> {
        let (done_tx, done_rx) = oneshot::channel();
        let request = TtsRequest {
            message,
            target,
            priority,
            done: Some(done_tx),
        };
        self.tx
            .try_send(request)
            .map_err(|_| IntercomError::TtsUnavailable("queue full".to_string()))?;
        Ok(done_rx)
    }
}

async fn run_worker(
    piper_host: String,
    piper_port: u16,
    arbiter: Arc<ChannelArbiter>,
    router: Arc<SessionRouter>,
    mut rx: mpsc::Receiver<TtsRequest>,
    cancel: CancellationToken,
) {
    loop {
        let mut request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let result = handle_request(&piper_host, piper_port, &arbiter, &router, &request, &cancel)
            .await;
        if let Err(ref e) = result {
            log::warn!("[TTS] Request failed: {}", e);
        }
        if let Some(done) = request.done.take() {
            let _ = done.send(result);
        }
    }
}

async fn handle_request(
    piper_host: &str,
    piper_port: u16,
    arbiter: &ChannelArbiter,
    router: &SessionRouter,
    request: &TtsRequest,
    cancel: &CancellationToken,
) -> IntercomResult<()> {
    // Wait for a free channel; Emergency jumps straight to preemption.
    if request.priority != Priority::Emergency {
        let waited_since = Instant::now();
        while router.is_channel_busy() {
            if waited_since.elapsed() > CHANNEL_WAIT_TIMEOUT {
                return Err(IntercomError::TtsUnavailable(
                    "channel busy past wait timeout".to_string(),
                ));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(IntercomError::TtsUnavailable("shutting down".to_string()));
                }
                _ = tokio::time::sleep(CHANNEL_POLL) => {}
            }
        }
    }

    // Synthesize BEFORE admission so a Piper failure never holds the channel.
    let pcm = synthesize(piper_host, piper_port, &request.message).await?;
    let frames = encode_frames(&pcm)?;
    if frames.is_empty() {
        return Err(IntercomError::TtsUnavailable("empty synthesis".to_string()));
    }
    log::info!(
        "[TTS] Speaking {} frames to {} ({})",
        frames.len(),
        request.target,
        request.priority.name()
    );

    arbiter.try_admit(
        Origin::Tts {
            device: HUB_TTS_DEVICE,
        },
        request.priority,
        request.target.clone(),
        Instant::now(),
    )?;
    router
        .play_frames(HUB_TTS_DEVICE, request.priority, &frames)
        .await;
    arbiter.end(HUB_TTS_DEVICE);
    Ok(())
}

/// Speaks to Piper: one JSON line out, raw PCM back until EOF.
async fn synthesize(host: &str, port: u16, message: &str) -> IntercomResult<Vec<i16>> {
    let addr = format!("{}:{}", host, port);
    let fut = async {
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| IntercomError::TtsUnavailable(format!("connect {}: {}", addr, e)))?;
        let request = serde_json::json!({ "text": message }).to_string();
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| IntercomError::TtsUnavailable(format!("send: {}", e)))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|e| IntercomError::TtsUnavailable(format!("send: {}", e)))?;
        stream
            .shutdown()
            .await
            .map_err(|e| IntercomError::TtsUnavailable(format!("shutdown: {}", e)))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(|e| IntercomError::TtsUnavailable(format!("recv: {}", e)))?;
        Ok(pcm_from_le_bytes(&raw))
    };
    tokio::time::timeout(SYNTH_TIMEOUT, fut)
        .await
        .map_err(|_| IntercomError::TtsUnavailable("synthesis timed out".to_string()))?
}

/// Chunks PCM into 20 ms frames (last frame zero-padded) and encodes.
fn encode_frames(pcm: &[i16]) -> IntercomResult<Vec<Bytes>> {
    let mut encoder = AudioEncoder::new()?;
    let mut frames = Vec::with_capacity(pcm.len().div_ceil(FRAME_SAMPLES));
    for chunk in pcm.chunks(FRAME_SAMPLES) {
        let payload = if chunk.len() == FRAME_SAMPLES {
            encoder.encode(chunk)?
        } else {
            let mut padded = chunk.to_vec();
            padded.resize(FRAME_SAMPLES, 0);
            encoder.encode(&padded)?
        };
        frames.push(Bytes::from(payload));
    }
    Ok(frames)
}
