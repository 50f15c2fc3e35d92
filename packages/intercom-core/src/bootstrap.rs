//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where
//! every subsystem is instantiated and wired together, in dependency
//! order: transport sockets (fatal on bind failure), shared state,
//! arbiter, router, TTS bridge, control plane. Shutdown runs in reverse:
//! cancel fan-out, release the channel with trail-out, retire the MQTT
//! presence.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::arbiter::ChannelArbiter;
use crate::capture::AudioCaptureBuffer;
use crate::chime::ChimeStore;
use crate::clients::WebClientRegistry;
use crate::error::{IntercomError, IntercomResult};
use crate::mqtt::messages::MqttPublish;
use crate::mqtt::{ControlPlane, HubControls};
use crate::protocol::RECLAIM_TICK_MS;
use crate::router::{tx_queue, SessionRouter, TxItem};
use crate::state::{Config, NodeRegistry};
use crate::stats::SequenceTracker;
use crate::transport::{resolve_interface, MulticastReceiver, MulticastSender};
use crate::tts::TtsBridge;

/// Receive-loop backoff bounds for sustained socket errors.
const RX_BACKOFF_MIN: Duration = Duration::from_millis(50);
const RX_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Container for all bootstrapped services.
pub struct BootstrappedServices {
    pub arbiter: Arc<ChannelArbiter>,
    pub router: Arc<SessionRouter>,
    pub chimes: Arc<ChimeStore>,
    pub capture: Arc<AudioCaptureBuffer>,
    pub stats: Arc<SequenceTracker>,
    pub nodes: Arc<NodeRegistry>,
    pub clients: Arc<WebClientRegistry>,
    pub controls: Arc<HubControls>,
    pub tts: TtsBridge,
    pub cancel_token: CancellationToken,
    /// Taken by `start_background_tasks`.
    sockets: Mutex<Option<(MulticastSender, MulticastReceiver)>>,
    tx_rx: Mutex<Option<mpsc::Receiver<TxItem>>>,
    publish_rx: Mutex<Option<mpsc::Receiver<MqttPublish>>>,
}

/// Bootstraps all subsystems with their dependencies.
///
/// Socket binds and codec/chime initialization happen here so every
/// fatal-at-startup error kind surfaces before any task runs.
pub fn bootstrap_services(config: &Config, data_dir: &Path) -> IntercomResult<BootstrappedServices> {
    config
        .validate()
        .map_err(IntercomError::Configuration)?;

    let iface = resolve_interface(config.multicast_interface)?;
    let sender = MulticastSender::new(config.multicast_group, config.multicast_port, iface)?;
    let receiver = MulticastReceiver::new(config.multicast_group, config.multicast_port, iface)?;

    let arbiter = Arc::new(ChannelArbiter::new());
    let nodes = Arc::new(NodeRegistry::new());
    let clients = Arc::new(WebClientRegistry::new());
    let capture = Arc::new(AudioCaptureBuffer::default());
    let stats = Arc::new(SequenceTracker::new());
    let chimes = Arc::new(ChimeStore::open(data_dir)?);
    let controls = Arc::new(HubControls::default());

    let (tx, tx_rx) = tx_queue();
    let (publish_tx, publish_rx) = mpsc::channel(64);

    let router = Arc::new(SessionRouter::new(
        Arc::clone(&arbiter),
        Arc::clone(&nodes),
        Arc::clone(&clients),
        Arc::clone(&capture),
        Arc::clone(&stats),
        tx,
        publish_tx,
        config.mobile_devices.clone(),
        config.multicast_port,
    )?);

    let cancel_token = CancellationToken::new();
    let tts = TtsBridge::start(
        config.piper_host.clone(),
        config.piper_port,
        Arc::clone(&arbiter),
        Arc::clone(&router),
        cancel_token.child_token(),
    );

    Ok(BootstrappedServices {
        arbiter,
        router,
        chimes,
        capture,
        stats,
        nodes,
        clients,
        controls,
        tts,
        cancel_token,
        sockets: Mutex::new(Some((sender, receiver))),
        tx_rx: Mutex::new(Some(tx_rx)),
        publish_rx: Mutex::new(Some(publish_rx)),
    })
}

impl BootstrappedServices {
    /// Spawns the long-running tasks: TX scheduler, multicast RX loop,
    /// arbiter reclaim ticker, router event loop, MQTT control plane.
    pub fn start_background_tasks(&self, config: &Config) {
        let (sender, receiver) = self
            .sockets
            .lock()
            .take()
            .expect("background tasks started twice");
        let tx_rx = self.tx_rx.lock().take().expect("tx queue already taken");
        let publish_rx = self
            .publish_rx
            .lock()
            .take()
            .expect("publish queue already taken");

        tokio::spawn(run_tx_task(
            sender,
            tx_rx,
            Arc::clone(&self.stats),
            self.cancel_token.child_token(),
        ));
        tokio::spawn(run_rx_task(
            receiver,
            Arc::clone(&self.router),
            self.cancel_token.child_token(),
        ));
        tokio::spawn(run_reclaim_task(
            Arc::clone(&self.arbiter),
            self.cancel_token.child_token(),
        ));
        tokio::spawn(
            Arc::clone(&self.router).run_event_loop(self.cancel_token.child_token()),
        );

        ControlPlane {
            arbiter: Arc::clone(&self.arbiter),
            router: Arc::clone(&self.router),
            nodes: Arc::clone(&self.nodes),
            chimes: Arc::clone(&self.chimes),
            controls: Arc::clone(&self.controls),
            tts: self.tts.clone(),
        }
        .spawn(config, publish_rx, self.cancel_token.child_token());

        log::info!("[Bootstrap] Background tasks started");
    }

    /// Builds the API layer state over these services.
    pub fn app_state(&self, config: Arc<Config>) -> AppState {
        AppState {
            arbiter: Arc::clone(&self.arbiter),
            router: Arc::clone(&self.router),
            chimes: Arc::clone(&self.chimes),
            capture: Arc::clone(&self.capture),
            stats: Arc::clone(&self.stats),
            nodes: Arc::clone(&self.nodes),
            clients: Arc::clone(&self.clients),
            tts: self.tts.clone(),
            config,
            started_at: Instant::now(),
        }
    }

    /// Initiates graceful shutdown of all services.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        // Release any active speaker first so the trail-out still has a
        // live router event loop to flow through.
        self.arbiter.release_for_shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.cancel_token.cancel();
        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// The multicast TX scheduler: single owner of the TX socket.
async fn run_tx_task(
    sender: MulticastSender,
    mut rx: mpsc::Receiver<TxItem>,
    stats: Arc<SequenceTracker>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let result = match item {
            TxItem::Multicast(packet) => sender.send_raw_multicast(&packet).await,
            TxItem::Unicast(packet, addr) => sender.send_unicast(&packet, addr).await,
        };
        if let Err(e) = result {
            stats.record_tx_error();
            log::debug!("[Transport] {}", e);
        }
    }
}

/// The multicast RX loop: parse, account, admit, route. Receive errors
/// are soft - log, back off exponentially while they persist.
async fn run_rx_task(
    receiver: MulticastReceiver,
    router: Arc<SessionRouter>,
    cancel: CancellationToken,
) {
    let mut backoff = RX_BACKOFF_MIN;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = receiver.recv() => match result {
                Ok((packet, _from)) => {
                    backoff = RX_BACKOFF_MIN;
                    router.handle_rx_packet(&packet);
                }
                Err(e) => {
                    log::warn!("[Transport] {} (backing off {:?})", e, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RX_BACKOFF_MAX);
                }
            },
        }
    }
}

/// Reclaims the channel after 500 ms without a frame.
async fn run_reclaim_task(arbiter: Arc<ChannelArbiter>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_millis(RECLAIM_TICK_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Some(speaker) = arbiter.reclaim_idle(Instant::now()) {
                    log::info!("[Arbiter] Reclaimed channel from {} after silence", speaker.origin);
                }
            }
        }
    }
}
