//! Session router: maps the admitted speaker onto its sink set.
//!
//! Sinks are computed once at admission (the arbiter consults the latest
//! node snapshot at that moment) and cached for the life of the stream:
//!
//! - room target: unicast UDP to each online node in the room, plus web
//!   clients whose target matches
//! - "all" target: one multicast emission reaches every node (skipped
//!   when the source is itself a node - its own multicast already did),
//!   plus every web client, plus mobile push on call notifications
//!
//! Node traffic is re-emitted byte-identical (same device id, same
//! sequence); web egress decodes once per frame and fans out PCM. A frame
//! from any device other than the active speaker is dropped here, which
//! is what makes a preempted source go silent downstream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::arbiter::{ArbiterEvent, ChannelArbiter, Origin, RoomTarget, Speaker};
use crate::capture::{AudioCaptureBuffer, Direction};
use crate::chime::Chime;
use crate::clients::{WebClientRegistry, WsOutbound};
use crate::codec::{pcm_to_le_bytes, AudioDecoder};
use crate::error::IntercomResult;
use crate::mqtt::messages::{CallNotification, MqttPublish};
use crate::packet::{AudioFrame, DeviceId, Priority};
use crate::protocol::TOPIC_CALL;
use crate::schedule::FramePacer;
use crate::state::{MobileDevice, NodeRegistry};
use crate::stats::{SeqOutcome, SequenceTracker};

/// Device id the hub streams chimes under. Nodes key their chime
/// detection on this sender restarting its sequence.
pub const HUB_CHIME_DEVICE: DeviceId = DeviceId([0xf0, 0x48, 0, 0, 0, 0, 0, 0x01]);

/// Device id synthesized speech streams under.
pub const HUB_TTS_DEVICE: DeviceId = DeviceId([0xf0, 0x48, 0, 0, 0, 0, 0, 0x02]);

/// Depth of the TX queue toward the socket task.
const TX_QUEUE_DEPTH: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// TX Queue
// ─────────────────────────────────────────────────────────────────────────────

/// A packet queued toward the multicast TX task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxItem {
    Multicast(Bytes),
    Unicast(Bytes, SocketAddr),
}

/// Creates the bounded queue between sinks and the TX socket task.
pub fn tx_queue() -> (mpsc::Sender<TxItem>, mpsc::Receiver<TxItem>) {
    mpsc::channel(TX_QUEUE_DEPTH)
}

// ─────────────────────────────────────────────────────────────────────────────
// Sinks
// ─────────────────────────────────────────────────────────────────────────────

/// Out-of-band update delivered alongside the audio path.
#[derive(Debug, Clone)]
pub enum StateUpdate {
    /// A call notification (ring + chime about to stream).
    Call(CallNotification),
}

/// Current stream's sink set, keyed by the speaker's device.
#[derive(Default)]
struct SinkCache {
    device: Option<DeviceId>,
    sinks: Vec<Arc<dyn Sink>>,
}

/// A frame ready for fan-out: original wire bytes for node sinks,
/// decoded PCM for web sinks.
pub struct RoutedFrame {
    pub frame: AudioFrame,
    pub wire: Bytes,
    pub pcm: Bytes,
}

/// Anything the router may emit a frame to.
pub trait Sink: Send + Sync {
    fn accept_frame(&self, routed: &RoutedFrame);
    fn accept_state(&self, update: &StateUpdate);
    fn close(&self) {}
}

/// Unicast UDP to one node.
struct NodeSink {
    device: DeviceId,
    addr: SocketAddr,
    tx: mpsc::Sender<TxItem>,
    stats: Arc<SequenceTracker>,
}

impl Sink for NodeSink {
    fn accept_frame(&self, routed: &RoutedFrame) {
        // Never loop a node's own frames back at it.
        if routed.frame.device == self.device {
            return;
        }
        match self.tx.try_send(TxItem::Unicast(routed.wire.clone(), self.addr)) {
            Ok(()) => self.stats.record_tx(),
            Err(_) => self.stats.record_tx_error(),
        }
    }

    fn accept_state(&self, _update: &StateUpdate) {
        // Nodes learn call state over MQTT, not the audio path.
    }
}

/// One multicast emission reaching every node.
struct MulticastSink {
    tx: mpsc::Sender<TxItem>,
    stats: Arc<SequenceTracker>,
}

impl Sink for MulticastSink {
    fn accept_frame(&self, routed: &RoutedFrame) {
        match self.tx.try_send(TxItem::Multicast(routed.wire.clone())) {
            Ok(()) => self.stats.record_tx(),
            Err(_) => self.stats.record_tx_error(),
        }
    }

    fn accept_state(&self, _update: &StateUpdate) {}
}

/// PCM fan-out to matching web clients.
struct WebSink {
    clients: Arc<WebClientRegistry>,
    target: RoomTarget,
}

impl Sink for WebSink {
    fn accept_frame(&self, routed: &RoutedFrame) {
        let priority = routed.frame.priority;
        self.clients.for_each(|client| {
            // The transmitting client never hears itself back.
            if client.device == routed.frame.device {
                return;
            }
            // Room streams only reach clients listening to that room.
            if let RoomTarget::Room(room) = &self.target {
                match client.target() {
                    RoomTarget::All => {}
                    RoomTarget::Room(r) if &r == room => {}
                    RoomTarget::Room(_) => return,
                }
            }
            // Mute and per-client DND yield to Emergency.
            if (client.mute() || client.dnd()) && priority != Priority::Emergency {
                return;
            }
            client.send(WsOutbound::Pcm(routed.pcm.clone()));
        });
    }

    fn accept_state(&self, update: &StateUpdate) {
        let StateUpdate::Call(call) = update;
        let json = serde_json::json!({
            "type": "call",
            "from": call.from,
            "target": call.to_room,
            "priority": call.priority,
            "chime": call.chime,
        })
        .to_string();
        self.clients.for_each(|client| client.send(WsOutbound::Json(json.clone())));
    }
}

/// Mobile push relay for All-Rooms call notifications.
struct MobileSink {
    devices: Vec<MobileDevice>,
    publish: mpsc::Sender<MqttPublish>,
}

impl Sink for MobileSink {
    fn accept_frame(&self, _routed: &RoutedFrame) {
        // Mobile devices get notifications, never the audio stream.
    }

    fn accept_state(&self, update: &StateUpdate) {
        let StateUpdate::Call(call) = update;
        for device in &self.devices {
            let publish = MqttPublish::new(
                format!("intercom/notify/{}", device.notify_service),
                serde_json::json!({
                    "title": "Intercom",
                    "message": format!("Call from {} to {}", call.from, call.to_room),
                    "priority": call.priority,
                })
                .to_string(),
            );
            if self.publish.try_send(publish).is_err() {
                log::warn!("[Router] Notify queue full, dropping push for {}", device.name);
            }
        }
    }
}

/// Capture-buffer tap on the TX path (chime playout included).
struct ChimeTapSink {
    capture: Arc<AudioCaptureBuffer>,
}

impl Sink for ChimeTapSink {
    fn accept_frame(&self, routed: &RoutedFrame) {
        self.capture.record(
            Direction::Tx,
            routed.frame.device,
            routed.frame.seq,
            routed.frame.payload.clone(),
        );
    }

    fn accept_state(&self, _update: &StateUpdate) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Routes the admitted speaker's frames to every sink family.
pub struct SessionRouter {
    arbiter: Arc<ChannelArbiter>,
    nodes: Arc<NodeRegistry>,
    clients: Arc<WebClientRegistry>,
    capture: Arc<AudioCaptureBuffer>,
    stats: Arc<SequenceTracker>,
    tx: mpsc::Sender<TxItem>,
    publish: mpsc::Sender<MqttPublish>,
    mobile: Vec<MobileDevice>,
    /// Web-egress decoder, allocated once and reused.
    decoder: Mutex<AudioDecoder>,
    /// Sinks of the current stream, installed on its first routed frame
    /// and keyed by the speaker's device so a new admission swaps them
    /// without waiting on any other task.
    sinks: Mutex<SinkCache>,
    /// Last forwarded sequence per sender, for trail-out numbering.
    last_seq: DashMap<DeviceId, u32>,
    /// Room target learned from a node's call notification, consulted
    /// when its first audio frame requests admission.
    pending_targets: DashMap<DeviceId, RoomTarget>,
    audio_port: u16,
}

impl SessionRouter {
    pub fn new(
        arbiter: Arc<ChannelArbiter>,
        nodes: Arc<NodeRegistry>,
        clients: Arc<WebClientRegistry>,
        capture: Arc<AudioCaptureBuffer>,
        stats: Arc<SequenceTracker>,
        tx: mpsc::Sender<TxItem>,
        publish: mpsc::Sender<MqttPublish>,
        mobile: Vec<MobileDevice>,
        audio_port: u16,
    ) -> IntercomResult<Self> {
        Ok(Self {
            arbiter,
            nodes,
            clients,
            capture,
            stats,
            tx,
            publish,
            mobile,
            decoder: Mutex::new(AudioDecoder::new()?),
            sinks: Mutex::new(SinkCache::default()),
            last_seq: DashMap::new(),
            pending_targets: DashMap::new(),
            audio_port,
        })
    }

    /// The "someone is talking" predicate: arbiter Busy OR any web client
    /// transmitting/receiving. Snapshot read, no locks.
    pub fn is_channel_busy(&self) -> bool {
        self.arbiter.channel_busy() || self.clients.any_active()
    }

    /// Remembers where a node's next stream is headed, from its call
    /// notification. Consulted at admission; defaults to "all".
    pub fn note_call_target(&self, device: DeviceId, target: RoomTarget) {
        self.pending_targets.insert(device, target);
    }

    /// Ingests one datagram from the multicast receiver: parse, account,
    /// capture, admit if needed, route.
    pub fn handle_rx_packet(&self, buf: &[u8]) {
        let parsed = match AudioFrame::parse(buf) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("[Router] Dropping packet: {}", e);
                self.stats.record_malformed();
                return;
            }
        };
        if parsed.priority_clamped {
            self.stats.record_priority_clamped();
        }
        let frame = parsed.frame;

        // Self-reception guard on top of IP_MULTICAST_LOOP=0: anything the
        // hub itself emits never re-enters the routing core.
        if self.is_hub_device(frame.device) {
            return;
        }

        let outcome = self.stats.record(frame.device, frame.seq);
        self.capture
            .record(Direction::Rx, frame.device, frame.seq, frame.payload.clone());
        let fec_hint = matches!(outcome, SeqOutcome::Gap(_));

        let now = Instant::now();
        if !self.arbiter.heartbeat(frame.device, now) {
            let target = self
                .pending_targets
                .get(&frame.device)
                .map(|t| t.clone())
                .unwrap_or(RoomTarget::All);
            let origin = Origin::EmbeddedNode(frame.device);
            if let Err(e) = self.arbiter.try_admit(origin, frame.priority, target, now) {
                log::debug!("[Router] Frame from {} not admitted: {}", frame.device, e);
                return;
            }
        }

        self.route_frame(frame, fec_hint);
    }

    /// Forwards one frame from the active speaker to its sinks. Frames
    /// from any other device are dropped.
    pub fn route_frame(&self, frame: AudioFrame, fec_hint: bool) {
        let Some((origin, _, target)) = self.arbiter.active() else {
            return;
        };
        if origin.device() != frame.device {
            return;
        }
        let sinks = {
            let mut cache = self.sinks.lock();
            if cache.device != Some(frame.device) {
                cache.device = Some(frame.device);
                cache.sinks = self.compute_sinks(&origin, &target);
            }
            cache.sinks.clone()
        };
        self.last_seq.insert(frame.device, frame.seq);
        self.fan_out(frame, fec_hint, &sinks);
    }

    fn fan_out(&self, frame: AudioFrame, fec_hint: bool, sinks: &[Arc<dyn Sink>]) {
        let pcm = {
            let mut decoder = self.decoder.lock();
            let (pcm, errored) = decoder.decode_or_silence(&frame.payload, fec_hint);
            if errored {
                self.stats.record_decode_error();
            }
            Bytes::from(pcm_to_le_bytes(&pcm))
        };
        let routed = RoutedFrame {
            wire: frame.serialize(),
            pcm,
            frame,
        };
        for sink in sinks {
            sink.accept_frame(&routed);
        }
    }

    /// Builds the sink set for a fresh admission.
    fn compute_sinks(&self, origin: &Origin, target: &RoomTarget) -> Vec<Arc<dyn Sink>> {
        let mut sinks: Vec<Arc<dyn Sink>> = vec![
            Arc::new(ChimeTapSink {
                capture: Arc::clone(&self.capture),
            }),
            Arc::new(WebSink {
                clients: Arc::clone(&self.clients),
                target: target.clone(),
            }),
        ];
        match target {
            RoomTarget::All => {
                // A node's own multicast already reached the fleet; the
                // hub only re-emits streams that never touched the group.
                if !matches!(origin, Origin::EmbeddedNode(_)) {
                    sinks.push(Arc::new(MulticastSink {
                        tx: self.tx.clone(),
                        stats: Arc::clone(&self.stats),
                    }));
                }
            }
            RoomTarget::Room(room) => {
                for node in self.nodes.in_room(room) {
                    if node.device_id == origin.device() {
                        continue;
                    }
                    sinks.push(Arc::new(NodeSink {
                        device: node.device_id,
                        addr: SocketAddr::new(node.ip, self.audio_port),
                        tx: self.tx.clone(),
                        stats: Arc::clone(&self.stats),
                    }));
                }
            }
        }
        sinks
    }

    /// Release path: emit one trail-out silence frame at the outgoing
    /// speaker's priority through its sinks, then retire them.
    fn on_released(&self, speaker: Speaker) {
        let device = speaker.origin.device();
        let retired = {
            let mut cache = self.sinks.lock();
            if cache.device == Some(device) {
                cache.device = None;
                std::mem::take(&mut cache.sinks)
            } else {
                // A preempting speaker may have swapped the cache already;
                // the outgoing stream still gets its trail-out.
                self.compute_sinks(&speaker.origin, &speaker.target)
            }
        };
        let seq = self
            .last_seq
            .get(&device)
            .map(|s| s.wrapping_add(1))
            .unwrap_or(0);
        let frame = AudioFrame::silence(device, seq, speaker.priority);
        self.fan_out(frame, false, &retired);
        for sink in &retired {
            sink.close();
        }
    }

    /// Drives admission/release events into the sink cache. Spawned by
    /// bootstrap; runs until the channel closes or cancellation.
    pub async fn run_event_loop(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut events = self.arbiter.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(ArbiterEvent::Admitted { .. }) => {}
                    Ok(ArbiterEvent::Released { origin, priority, target, .. }) => {
                        self.on_released(Speaker {
                            origin,
                            priority,
                            target,
                            started_at: Instant::now(),
                            last_frame_at: Instant::now(),
                        });
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[Router] Event stream lagged by {}", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Streams pre-encoded frames under `device` with wall-clock pacing,
    /// heartbeating the arbiter as it goes. The sequence restarts at 0 -
    /// for chimes that restart is the node-side detection signal.
    pub async fn play_frames(&self, device: DeviceId, priority: Priority, frames: &[Bytes]) {
        let mut pacer = FramePacer::new();
        for (i, payload) in frames.iter().enumerate() {
            pacer.tick().await;
            self.arbiter.heartbeat(device, Instant::now());
            let frame = AudioFrame::new(device, i as u32, priority, payload.clone());
            self.route_frame(frame, false);
        }
    }

    /// Plays a chime through the channel: admit, paced playout, release.
    pub async fn play_chime(
        &self,
        chime: &Chime,
        priority: Priority,
        target: RoomTarget,
    ) -> IntercomResult<()> {
        let origin = Origin::Chime {
            device: HUB_CHIME_DEVICE,
        };
        self.arbiter
            .try_admit(origin, priority, target, Instant::now())?;
        log::info!(
            "[Router] Chime '{}' ({} frames) streaming",
            chime.name,
            chime.frames.len()
        );
        self.play_frames(HUB_CHIME_DEVICE, priority, &chime.frames).await;
        self.arbiter.end(HUB_CHIME_DEVICE);
        Ok(())
    }

    /// Publishes a hub-originated call notification (tagged
    /// `"source":"hub"` so our own receive path drops the echo), then
    /// rings it out.
    pub async fn announce_call(
        &self,
        from: String,
        target: RoomTarget,
        priority: Priority,
        chime: &Chime,
    ) {
        let call = CallNotification {
            from,
            to_room: target.to_string(),
            priority,
            chime: chime.name.clone(),
            source: "hub".to_string(),
        };
        match serde_json::to_string(&call) {
            Ok(payload) => {
                if self
                    .publish
                    .try_send(MqttPublish::new(TOPIC_CALL, payload))
                    .is_err()
                {
                    log::warn!("[Router] Publish queue full, call notification dropped");
                }
            }
            Err(e) => log::warn!("[Router] Could not serialize call: {}", e),
        }
        self.ring(&call, chime).await;
    }

    /// Delivers a call notification to the web and mobile sinks and
    /// streams the chime prelude. Used for both hub-originated calls and
    /// calls received from nodes over MQTT.
    pub async fn ring(&self, call: &CallNotification, chime: &Chime) {
        let target = RoomTarget::parse(&call.to_room);
        if let Some(device) = DeviceId::parse_hex(&call.from) {
            self.note_call_target(device, target.clone());
        }

        let update = StateUpdate::Call(call.clone());
        WebSink {
            clients: Arc::clone(&self.clients),
            target: target.clone(),
        }
        .accept_state(&update);
        if target == RoomTarget::All && !self.mobile.is_empty() {
            MobileSink {
                devices: self.mobile.clone(),
                publish: self.publish.clone(),
            }
            .accept_state(&update);
        }

        if let Err(e) = self.play_chime(chime, call.priority, target).await {
            log::info!("[Router] Chime skipped: {}", e);
        }
    }

    fn is_hub_device(&self, device: DeviceId) -> bool {
        device == HUB_CHIME_DEVICE
            || device == HUB_TTS_DEVICE
            || self.clients.by_device(device).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AudioEncoder;
    use crate::protocol::DEFAULT_MULTICAST_PORT;
    use crate::state::Node;
    use std::net::{IpAddr, Ipv4Addr};

    struct Harness {
        router: Arc<SessionRouter>,
        arbiter: Arc<ChannelArbiter>,
        nodes: Arc<NodeRegistry>,
        clients: Arc<WebClientRegistry>,
        capture: Arc<AudioCaptureBuffer>,
        stats: Arc<SequenceTracker>,
        tx_rx: mpsc::Receiver<TxItem>,
        publish_rx: mpsc::Receiver<MqttPublish>,
    }

    fn harness() -> Harness {
        let arbiter = Arc::new(ChannelArbiter::new());
        let nodes = Arc::new(NodeRegistry::new());
        let clients = Arc::new(WebClientRegistry::new());
        let capture = Arc::new(AudioCaptureBuffer::new(100));
        let stats = Arc::new(SequenceTracker::new());
        let (tx, tx_rx) = tx_queue();
        let (publish, publish_rx) = mpsc::channel(16);
        let router = Arc::new(
            SessionRouter::new(
                Arc::clone(&arbiter),
                Arc::clone(&nodes),
                Arc::clone(&clients),
                Arc::clone(&capture),
                Arc::clone(&stats),
                tx,
                publish,
                vec![MobileDevice {
                    name: "pixel".into(),
                    notify_service: "mobile_app_pixel".into(),
                }],
                DEFAULT_MULTICAST_PORT,
            )
            .unwrap(),
        );
        Harness {
            router,
            arbiter,
            nodes,
            clients,
            capture,
            stats,
            tx_rx,
            publish_rx,
        }
    }

    fn dev(n: u8) -> DeviceId {
        DeviceId([n, 0, 0, 0, 0, 0, 0, 0])
    }

    fn node(n: u8, room: &str) -> Node {
        Node {
            device_id: dev(n),
            room: room.to_string(),
            ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, n)),
            online: true,
            capabilities: vec![],
        }
    }

    fn opus_frame() -> Bytes {
        let mut enc = AudioEncoder::new().unwrap();
        Bytes::from(enc.encode(&[0i16; 320]).unwrap())
    }

    /// Admits a speaker; sinks install on its first routed frame.
    fn admit(h: &Harness, origin: Origin, priority: Priority, target: RoomTarget) {
        h.arbiter
            .try_admit(origin, priority, target, Instant::now())
            .unwrap();
    }

    #[test]
    fn room_target_unicasts_to_room_nodes_only() {
        let mut h = harness();
        h.nodes.upsert(node(1, "kitchen"));
        h.nodes.upsert(node(2, "kitchen"));
        h.nodes.upsert(node(3, "garage"));

        admit(
            &h,
            Origin::EmbeddedNode(dev(1)),
            Priority::Normal,
            RoomTarget::Room("kitchen".into()),
        );
        h.router
            .route_frame(AudioFrame::new(dev(1), 0, Priority::Normal, opus_frame()), false);

        // Node 2 gets unicast; node 1 (origin) and node 3 (other room) do not.
        let item = h.tx_rx.try_recv().unwrap();
        match item {
            TxItem::Unicast(_, addr) => {
                assert_eq!(addr, SocketAddr::new(node(2, "kitchen").ip, 5005));
            }
            other => panic!("expected unicast, got {:?}", other),
        }
        assert!(h.tx_rx.try_recv().is_err());
    }

    #[test]
    fn all_target_multicasts_for_hub_origins_only() {
        let mut h = harness();
        let (web, _rx) = h.clients.register("alice", "phone");

        admit(
            &h,
            Origin::WebClient {
                client_id: "alice".into(),
                device: web.device,
            },
            Priority::Normal,
            RoomTarget::All,
        );
        h.router
            .route_frame(AudioFrame::new(web.device, 0, Priority::Normal, opus_frame()), false);
        assert!(matches!(h.tx_rx.try_recv().unwrap(), TxItem::Multicast(_)));

        // A node-origin stream already reached the group by itself.
        h.arbiter.end(web.device);
        admit(
            &h,
            Origin::EmbeddedNode(dev(1)),
            Priority::Normal,
            RoomTarget::All,
        );
        h.router
            .route_frame(AudioFrame::new(dev(1), 0, Priority::Normal, opus_frame()), false);
        assert!(h.tx_rx.try_recv().is_err());
    }

    #[test]
    fn web_clients_receive_pcm_with_mute_and_dnd_rules() {
        let h = harness();
        let (listener, mut listener_rx) = h.clients.register("bob", "laptop");
        let (muted, mut muted_rx) = h.clients.register("carol", "tablet");
        muted.set_mute(true);

        admit(
            &h,
            Origin::EmbeddedNode(dev(1)),
            Priority::Normal,
            RoomTarget::All,
        );
        h.router
            .route_frame(AudioFrame::new(dev(1), 0, Priority::Normal, opus_frame()), false);

        assert!(matches!(listener_rx.try_recv().unwrap(), WsOutbound::Pcm(_)));
        assert!(muted_rx.try_recv().is_err());
        let _ = listener;

        // Emergency overrides mute.
        h.arbiter.end(dev(1));
        admit(
            &h,
            Origin::EmbeddedNode(dev(2)),
            Priority::Emergency,
            RoomTarget::All,
        );
        h.router.route_frame(
            AudioFrame::new(dev(2), 0, Priority::Emergency, opus_frame()),
            false,
        );
        assert!(matches!(muted_rx.try_recv().unwrap(), WsOutbound::Pcm(_)));
    }

    #[test]
    fn room_streams_skip_clients_listening_elsewhere() {
        let h = harness();
        let (kitchen, mut kitchen_rx) = h.clients.register("kit", "phone");
        kitchen.set_target(RoomTarget::Room("kitchen".into()));
        let (garage, mut garage_rx) = h.clients.register("gar", "phone");
        garage.set_target(RoomTarget::Room("garage".into()));

        admit(
            &h,
            Origin::EmbeddedNode(dev(1)),
            Priority::Normal,
            RoomTarget::Room("kitchen".into()),
        );
        h.router
            .route_frame(AudioFrame::new(dev(1), 0, Priority::Normal, opus_frame()), false);
        assert!(matches!(kitchen_rx.try_recv().unwrap(), WsOutbound::Pcm(_)));
        assert!(garage_rx.try_recv().is_err());
    }

    #[test]
    fn frames_from_non_active_devices_are_dropped() {
        let mut h = harness();
        let (web, _rx) = h.clients.register("alice", "phone");
        admit(
            &h,
            Origin::WebClient {
                client_id: "alice".into(),
                device: web.device,
            },
            Priority::High,
            RoomTarget::All,
        );

        // Another device's frames never reach a sink.
        h.router
            .route_frame(AudioFrame::new(dev(9), 0, Priority::Normal, opus_frame()), false);
        assert!(h.tx_rx.try_recv().is_err());
    }

    #[test]
    fn release_emits_trail_out_at_stream_priority() {
        let mut h = harness();
        let (web, _rx) = h.clients.register("alice", "phone");
        h.capture.start();
        let origin = Origin::WebClient {
            client_id: "alice".into(),
            device: web.device,
        };
        admit(&h, origin, Priority::High, RoomTarget::All);
        h.router
            .route_frame(AudioFrame::new(web.device, 41, Priority::High, opus_frame()), false);
        let _ = h.tx_rx.try_recv();

        let speaker = h.arbiter.end(web.device).unwrap();
        h.router.on_released(speaker);

        // Trail-out is an empty payload at the outgoing priority, seq+1.
        match h.tx_rx.try_recv().unwrap() {
            TxItem::Multicast(wire) => {
                let parsed = AudioFrame::parse(&wire).unwrap().frame;
                assert_eq!(parsed.priority, Priority::High);
                assert_eq!(parsed.seq, 42);
                assert!(parsed.payload.is_empty());
            }
            other => panic!("expected multicast, got {:?}", other),
        }

        // And the sink cache is gone: further frames go nowhere.
        h.router
            .route_frame(AudioFrame::new(web.device, 43, Priority::High, opus_frame()), false);
        assert!(h.tx_rx.try_recv().is_err());
    }

    #[test]
    fn rx_packets_admit_heartbeat_and_route() {
        let h = harness();
        let (_listener, mut listener_rx) = h.clients.register("bob", "laptop");

        // First frame from an idle channel admits the node.
        let frame = AudioFrame::new(dev(1), 0, Priority::Normal, opus_frame());
        h.router.handle_rx_packet(&frame.serialize());
        assert!(h.arbiter.channel_busy());
        assert!(matches!(listener_rx.try_recv().unwrap(), WsOutbound::Pcm(_)));

        // A competing same-priority node is rejected and silent.
        let intruder = AudioFrame::new(dev(2), 0, Priority::Normal, opus_frame());
        h.router.handle_rx_packet(&intruder.serialize());
        assert!(listener_rx.try_recv().is_err());
        assert_eq!(h.arbiter.active().unwrap().0.device(), dev(1));
    }

    #[test]
    fn rx_uses_the_pending_call_target() {
        let h = harness();
        h.nodes.upsert(node(2, "kitchen"));
        h.router
            .note_call_target(dev(1), RoomTarget::Room("kitchen".into()));

        let frame = AudioFrame::new(dev(1), 0, Priority::Normal, opus_frame());
        h.router.handle_rx_packet(&frame.serialize());
        let (_, _, target) = h.arbiter.active().unwrap();
        assert_eq!(target, RoomTarget::Room("kitchen".into()));
    }

    #[test]
    fn rx_drops_hub_originated_devices() {
        let h = harness();
        let frame = AudioFrame::new(HUB_CHIME_DEVICE, 0, Priority::Normal, opus_frame());
        h.router.handle_rx_packet(&frame.serialize());
        assert!(!h.arbiter.channel_busy());
        assert!(h.stats.snapshot().is_empty());
    }

    #[test]
    fn malformed_packets_are_counted_and_dropped() {
        let h = harness();
        h.router.handle_rx_packet(&[0u8; 5]);
        assert_eq!(h.stats.tx_snapshot().malformed, 1);
        assert!(!h.arbiter.channel_busy());
    }

    #[test]
    fn a_hundred_frame_stream_sees_one_admit_end_pair_with_clean_stats() {
        let h = harness();
        let mut events = h.arbiter.subscribe();
        let mut enc = AudioEncoder::new().unwrap();

        for seq in 0..100u32 {
            let payload = Bytes::from(enc.encode(&[0i16; 320]).unwrap());
            let frame = AudioFrame::new(dev(1), seq, Priority::Normal, payload);
            h.router.handle_rx_packet(&frame.serialize());
        }

        // 500 ms of silence reclaims the channel.
        let reclaimed = h
            .arbiter
            .reclaim_idle(Instant::now() + std::time::Duration::from_millis(500));
        assert!(reclaimed.is_some());

        let mut admits = 0;
        let mut releases = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ArbiterEvent::Admitted { .. } => admits += 1,
                ArbiterEvent::Released { .. } => releases += 1,
            }
        }
        assert_eq!((admits, releases), (1, 1));

        let snap = h.stats.snapshot();
        let (_, stats) = snap.iter().find(|(id, _)| id == &dev(1).to_string()).unwrap();
        assert_eq!(stats.packet_count, 100);
        assert_eq!(stats.gaps, 0);
        assert_eq!(stats.duplicates, 0);
    }

    #[test]
    fn capture_tap_records_tx_frames() {
        let h = harness();
        h.capture.start();
        admit(
            &h,
            Origin::EmbeddedNode(dev(1)),
            Priority::Normal,
            RoomTarget::All,
        );
        h.router
            .route_frame(AudioFrame::new(dev(1), 7, Priority::Normal, opus_frame()), false);
        let captured = h.capture.fetch(&Default::default());
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].sequence, 7);
        assert!(matches!(captured[0].direction, Direction::Tx));
    }

    #[tokio::test(start_paused = true)]
    async fn chime_playout_is_wall_clock_paced() {
        let mut h = harness();
        let frames: Vec<Bytes> = (0..5).map(|_| opus_frame()).collect();
        let chime = Chime {
            name: "doorbell".into(),
            duration_ms: 100,
            frames,
        };

        let start = tokio::time::Instant::now();
        h.router
            .play_chime(&chime, Priority::Normal, RoomTarget::All)
            .await
            .unwrap();
        // 5 frames at 20 ms: last frame due at t=80ms.
        assert_eq!((tokio::time::Instant::now() - start).as_millis(), 80);

        let mut multicast = 0;
        while let Ok(item) = h.tx_rx.try_recv() {
            if matches!(item, TxItem::Multicast(_)) {
                multicast += 1;
            }
        }
        assert_eq!(multicast, 5);
        assert!(!h.arbiter.channel_busy());
    }

    #[tokio::test]
    async fn announce_call_publishes_with_hub_source_and_notifies_mobile() {
        let mut h = harness();
        let chime = Chime {
            name: "doorbell".into(),
            duration_ms: 20,
            frames: vec![opus_frame()],
        };
        h.router
            .announce_call("hub".into(), RoomTarget::All, Priority::Normal, &chime)
            .await;

        let call_publish = h.publish_rx.try_recv().unwrap();
        assert_eq!(call_publish.topic, TOPIC_CALL);
        let call: CallNotification = serde_json::from_str(&call_publish.payload).unwrap();
        assert!(call.is_hub_echo());
        assert_eq!(call.chime, "doorbell");

        let push = h.publish_rx.try_recv().unwrap();
        assert_eq!(push.topic, "intercom/notify/mobile_app_pixel");
    }
}
