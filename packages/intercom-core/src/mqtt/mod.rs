//! MQTT control plane.
//!
//! One task owns the broker connection: it drives the rumqttc event loop,
//! applies incoming discovery/availability/call messages to the shared
//! state, drains the outbound publish queue, and mirrors arbiter
//! transitions into the state sensor. Reconnects back off exponentially;
//! the hub's own availability topic is retained `online` with an
//! `offline` LWT.
//!
//! The control plane is eventually consistent: the node set may lag the
//! fleet by seconds, and the arbiter always consults the latest snapshot
//! at admission time.

pub mod messages;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::arbiter::{ArbiterEvent, ChannelArbiter, RoomTarget};
use crate::chime::ChimeStore;
use crate::packet::Priority;
use crate::protocol::{
    HA_DISCOVERY_PREFIX, TOPIC_AVAILABILITY, TOPIC_CALL, TOPIC_DISCOVERY,
};
use crate::router::SessionRouter;
use crate::state::{Config, NodeRegistry};
use crate::tts::TtsBridge;

use messages::{ControlMessage, MqttPublish};

/// Topic root for the hub's own HA-facing entities.
const HUB_TOPIC: &str = "intercom/hub";

/// Reconnect backoff bounds.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────────────────
// Hub-level controls (the HA entity backing state)
// ─────────────────────────────────────────────────────────────────────────────

/// Defaults applied to hub-originated calls and exposed as HA entities.
pub struct HubControls {
    pub volume: AtomicU8,
    pub mute: AtomicBool,
    pub agc: AtomicBool,
    priority: AtomicU8,
    target: Mutex<RoomTarget>,
}

impl Default for HubControls {
    fn default() -> Self {
        Self {
            volume: AtomicU8::new(70),
            mute: AtomicBool::new(false),
            agc: AtomicBool::new(true),
            priority: AtomicU8::new(Priority::Normal as u8),
            target: Mutex::new(RoomTarget::All),
        }
    }
}

impl HubControls {
    pub fn priority(&self) -> Priority {
        Priority::from_wire(self.priority.load(Ordering::Relaxed)).0
    }

    pub fn set_priority(&self, priority: Priority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    pub fn target(&self) -> RoomTarget {
        self.target.lock().clone()
    }

    pub fn set_target(&self, target: RoomTarget) {
        *self.target.lock() = target;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control Plane
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the MQTT task needs, wired once at bootstrap.
pub struct ControlPlane {
    pub arbiter: Arc<ChannelArbiter>,
    pub router: Arc<SessionRouter>,
    pub nodes: Arc<NodeRegistry>,
    pub chimes: Arc<ChimeStore>,
    pub controls: Arc<HubControls>,
    pub tts: TtsBridge,
}

impl ControlPlane {
    /// Spawns the MQTT task. `publish_rx` is the queue other subsystems
    /// publish through.
    pub fn spawn(
        self,
        config: &Config,
        publish_rx: mpsc::Receiver<MqttPublish>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut options = MqttOptions::new(
            config.device_name.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_credentials(config.mqtt_user.clone(), config.mqtt_password.clone());
        options.set_keep_alive(Duration::from_secs(30));
        options.set_last_will(LastWill::new(
            hub_availability_topic(),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));
        let device_name = config.device_name.clone();
        tokio::spawn(self.run(options, device_name, publish_rx, cancel))
    }

    async fn run(
        self,
        options: MqttOptions,
        device_name: String,
        mut publish_rx: mpsc::Receiver<MqttPublish>,
        cancel: CancellationToken,
    ) {
        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let mut arbiter_events = self.arbiter.subscribe();
        let mut backoff = BACKOFF_MIN;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = client
                        .publish(hub_availability_topic(), QoS::AtLeastOnce, true, "offline")
                        .await;
                    break;
                }

                Some(publish) = publish_rx.recv() => {
                    if let Err(e) = client
                        .publish(
                            publish.topic.as_str(),
                            QoS::AtLeastOnce,
                            publish.retain,
                            publish.payload,
                        )
                        .await
                    {
                        log::warn!("[Control] Publish to {} failed: {}", publish.topic, e);
                    }
                }

                event = arbiter_events.recv() => {
                    if let Ok(event) = event {
                        let state = match &event {
                            ArbiterEvent::Admitted { origin, .. } => format!("busy:{}", origin),
                            ArbiterEvent::Released { .. } => "idle".to_string(),
                        };
                        let _ = client
                            .publish(format!("{}/state", HUB_TOPIC), QoS::AtLeastOnce, false, state)
                            .await;
                    }
                }

                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff = BACKOFF_MIN;
                        log::info!("[Control] Connected to broker");
                        self.on_connected(&client, &device_name).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.on_publish(&publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!(
                            "[Control] Connection error: {} (retrying in {:?})",
                            e,
                            backoff
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                },
            }
        }
        log::info!("[Control] MQTT task stopped");
    }

    /// Subscribes and (re-)publishes retained presence + HA discovery.
    async fn on_connected(&self, client: &AsyncClient, device_name: &str) {
        let subscriptions = [
            format!("{}/+", TOPIC_DISCOVERY),
            format!("{}/+", TOPIC_AVAILABILITY),
            TOPIC_CALL.to_string(),
            format!("{}/+/set", HUB_TOPIC),
        ];
        for topic in subscriptions {
            if let Err(e) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                log::warn!("[Control] Subscribe {} failed: {}", topic, e);
            }
        }

        let _ = client
            .publish(hub_availability_topic(), QoS::AtLeastOnce, true, "online")
            .await;

        let chime_names: Vec<String> =
            self.chimes.list().into_iter().map(|c| c.name).collect();
        for publish in ha_discovery_configs(device_name, &chime_names) {
            if let Err(e) = client
                .publish(
                    publish.topic.as_str(),
                    QoS::AtLeastOnce,
                    publish.retain,
                    publish.payload,
                )
                .await
            {
                log::warn!("[Control] HA discovery publish failed: {}", e);
            }
        }
    }

    /// Applies one incoming control message.
    async fn on_publish(&self, topic: &str, payload: &[u8]) {
        // Hub entity command topics first.
        if let Some(entity) = topic
            .strip_prefix(HUB_TOPIC)
            .and_then(|s| s.strip_prefix('/'))
            .and_then(|s| s.strip_suffix("/set"))
        {
            self.on_command(entity, payload).await;
            return;
        }

        match ControlMessage::parse(topic, payload) {
            Some(ControlMessage::Discovery(node)) => self.nodes.upsert(node),
            Some(ControlMessage::Availability { device_id, online }) => {
                self.nodes.set_online(device_id, online)
            }
            Some(ControlMessage::Call(call)) => {
                if call.is_hub_echo() {
                    return;
                }
                log::info!(
                    "[Control] Call from {} to {} ({})",
                    call.from,
                    call.to_room,
                    call.priority.name()
                );
                let chime = self
                    .chimes
                    .get(&call.chime)
                    .unwrap_or_else(|| self.chimes.active_chime());
                self.router.ring(&call, &chime).await;
            }
            None => {
                log::debug!("[Control] Ignored message on {}", topic);
            }
        }
    }

    /// Applies a Home Assistant entity command.
    async fn on_command(&self, entity: &str, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        match entity {
            "dnd" => self.arbiter.set_dnd(text == "ON"),
            "mute" => self.controls.mute.store(text == "ON", Ordering::Relaxed),
            "agc" => self.controls.agc.store(text == "ON", Ordering::Relaxed),
            "volume" => {
                if let Ok(volume) = text.trim().parse::<u8>() {
                    self.controls.volume.store(volume.min(100), Ordering::Relaxed);
                }
            }
            "target" => self.controls.set_target(RoomTarget::parse(&text)),
            "priority" => {
                if let Some(priority) = Priority::parse_name(text.trim()) {
                    self.controls.set_priority(priority);
                }
            }
            "chime" => {
                if let Err(e) = self.chimes.set_active(text.trim()) {
                    log::warn!("[Control] Chime select failed: {}", e);
                }
            }
            "call" => {
                let chime = self.chimes.active_chime();
                self.router
                    .announce_call(
                        "hub".to_string(),
                        self.controls.target(),
                        self.controls.priority(),
                        &chime,
                    )
                    .await;
            }
            "notify" => {
                // HA notify: speak the payload as synthesized speech.
                let message = text.trim().to_string();
                if message.is_empty() {
                    return;
                }
                match self
                    .tts
                    .speak(message, self.controls.target(), self.controls.priority())
                {
                    Ok(_done) => {}
                    Err(e) => log::warn!("[Control] TTS notify rejected: {}", e),
                }
            }
            other => log::debug!("[Control] Unknown entity command '{}'", other),
        }
    }
}

fn hub_availability_topic() -> String {
    format!("{}/hub", TOPIC_AVAILABILITY)
}

// ─────────────────────────────────────────────────────────────────────────────
// Home Assistant Discovery
// ─────────────────────────────────────────────────────────────────────────────

/// Builds the retained HA auto-discovery configs for every advertised
/// entity: notify, state sensor, volume number, mute switch, target
/// select, AGC switch, priority select, DND switch, call button, chime
/// select.
pub fn ha_discovery_configs(device_name: &str, chime_names: &[String]) -> Vec<MqttPublish> {
    let device = serde_json::json!({
        "identifiers": ["intercom_hub"],
        "name": device_name,
        "manufacturer": "intercom",
    });
    let availability = serde_json::json!([{ "topic": hub_availability_topic() }]);

    let mut configs = Vec::new();
    let mut entity = |component: &str, object: &str, extra: serde_json::Value| {
        let mut payload = serde_json::json!({
            "name": object,
            "unique_id": format!("intercom_hub_{}", object),
            "device": device.clone(),
            "availability": availability.clone(),
        });
        if let (Some(map), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra) {
            map.extend(extra);
        }
        configs.push(MqttPublish::retained(
            format!("{}/{}/intercom_hub_{}/config", HA_DISCOVERY_PREFIX, component, object),
            payload.to_string(),
        ));
    };

    let set = |name: &str| format!("{}/{}/set", HUB_TOPIC, name);

    entity(
        "notify",
        "notify",
        serde_json::json!({ "command_topic": set("notify") }),
    );
    entity(
        "sensor",
        "state",
        serde_json::json!({ "state_topic": format!("{}/state", HUB_TOPIC) }),
    );
    entity(
        "number",
        "volume",
        serde_json::json!({
            "command_topic": set("volume"),
            "min": 0, "max": 100, "step": 1,
        }),
    );
    entity(
        "switch",
        "mute",
        serde_json::json!({ "command_topic": set("mute") }),
    );
    entity(
        "select",
        "target",
        serde_json::json!({
            "command_topic": set("target"),
            "options": ["all"],
        }),
    );
    entity(
        "switch",
        "agc",
        serde_json::json!({ "command_topic": set("agc") }),
    );
    entity(
        "select",
        "priority",
        serde_json::json!({
            "command_topic": set("priority"),
            "options": ["normal", "high", "emergency"],
        }),
    );
    entity(
        "switch",
        "dnd",
        serde_json::json!({ "command_topic": set("dnd") }),
    );
    entity(
        "button",
        "call",
        serde_json::json!({ "command_topic": set("call") }),
    );
    entity(
        "select",
        "chime",
        serde_json::json!({
            "command_topic": set("chime"),
            "options": chime_names,
        }),
    );

    configs
}
