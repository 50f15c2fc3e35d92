//! Web PTT client arena.
//!
//! Clients are indexed by `client_id`; the hub holds handles, never
//! back-pointers into connection tasks. Each handle owns a bounded
//! outbound queue drained by its socket task - a slow browser drops
//! frames here and can never back-pressure the router or the arbiter.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::arbiter::RoomTarget;
use crate::packet::{DeviceId, Priority};
use crate::protocol::WS_CLIENT_QUEUE;

/// Per-client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WsClientState {
    Idle,
    Transmitting,
    Receiving,
}

impl WsClientState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Transmitting => "transmitting",
            Self::Receiving => "receiving",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Transmitting,
            2 => Self::Receiving,
            _ => Self::Idle,
        }
    }
}

/// Message queued toward a browser client.
#[derive(Debug, Clone)]
pub enum WsOutbound {
    /// Decoded 16-bit LE PCM, sent as a binary WebSocket message.
    Pcm(Bytes),
    /// Serialized JSON control message.
    Json(String),
}

/// One connected browser client.
pub struct WebClientHandle {
    pub client_id: String,
    pub device_name: String,
    /// Hub-owned device id this client's frames carry on the wire.
    pub device: DeviceId,
    state: AtomicU8,
    target: Mutex<RoomTarget>,
    volume: AtomicU8,
    mute: AtomicBool,
    dnd: AtomicBool,
    agc: AtomicBool,
    priority: AtomicU8,
    /// Wire sequence, monotonic for the life of the connection so a
    /// pause/resume in the browser never resets or offsets it.
    seq: AtomicU32,
    tx: mpsc::Sender<WsOutbound>,
    dropped: AtomicU64,
}

impl WebClientHandle {
    pub fn state(&self) -> WsClientState {
        WsClientState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn target(&self) -> RoomTarget {
        self.target.lock().clone()
    }

    pub fn set_target(&self, target: RoomTarget) {
        *self.target.lock() = target;
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn set_volume(&self, volume: u8) {
        self.volume.store(volume.min(100), Ordering::Relaxed);
    }

    pub fn mute(&self) -> bool {
        self.mute.load(Ordering::Relaxed)
    }

    pub fn set_mute(&self, on: bool) {
        self.mute.store(on, Ordering::Relaxed);
    }

    pub fn dnd(&self) -> bool {
        self.dnd.load(Ordering::Relaxed)
    }

    pub fn set_dnd(&self, on: bool) {
        self.dnd.store(on, Ordering::Relaxed);
    }

    pub fn agc(&self) -> bool {
        self.agc.load(Ordering::Relaxed)
    }

    pub fn set_agc(&self, on: bool) {
        self.agc.store(on, Ordering::Relaxed);
    }

    pub fn priority(&self) -> Priority {
        Priority::from_wire(self.priority.load(Ordering::Relaxed)).0
    }

    pub fn set_priority(&self, priority: Priority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    /// Claims the next wire sequence number.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Queues a message; drops it (and counts) when the client is slow.
    pub fn send(&self, msg: WsOutbound) {
        if self.tx.try_send(msg).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Arena of connected web clients plus the activity counter backing the
/// lock-free half of `is_channel_busy()`.
#[derive(Default)]
pub struct WebClientRegistry {
    clients: DashMap<String, Arc<WebClientHandle>>,
    /// Clients currently transmitting or receiving.
    active: AtomicUsize,
    minted: AtomicU32,
}

impl WebClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client and returns its handle plus the receiving end
    /// of its outbound queue. An existing client with the same id is
    /// replaced (its socket task sees a closed queue and exits).
    pub fn register(
        &self,
        client_id: &str,
        device_name: &str,
    ) -> (Arc<WebClientHandle>, mpsc::Receiver<WsOutbound>) {
        let (tx, rx) = mpsc::channel(WS_CLIENT_QUEUE);
        let handle = Arc::new(WebClientHandle {
            client_id: client_id.to_string(),
            device_name: device_name.to_string(),
            device: self.mint_device(),
            state: AtomicU8::new(0),
            target: Mutex::new(RoomTarget::All),
            volume: AtomicU8::new(70),
            mute: AtomicBool::new(false),
            dnd: AtomicBool::new(false),
            agc: AtomicBool::new(true),
            priority: AtomicU8::new(Priority::Normal as u8),
            seq: AtomicU32::new(0),
            tx,
            dropped: AtomicU64::new(0),
        });
        if let Some(old) = self.clients.insert(client_id.to_string(), Arc::clone(&handle)) {
            log::info!("[Web] Replacing existing client '{}'", old.client_id);
            self.note_state_change(old.state(), WsClientState::Idle);
        }
        (handle, rx)
    }

    /// Removes a client on socket close.
    pub fn remove(&self, client_id: &str) {
        if let Some((_, handle)) = self.clients.remove(client_id) {
            self.note_state_change(handle.state(), WsClientState::Idle);
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<WebClientHandle>> {
        self.clients.get(client_id).map(|h| Arc::clone(&h))
    }

    /// Looks a client up by its hub-owned device id.
    pub fn by_device(&self, device: DeviceId) -> Option<Arc<WebClientHandle>> {
        self.clients
            .iter()
            .find(|c| c.device == device)
            .map(|c| Arc::clone(&c))
    }

    /// Transitions a client's state, keeping the activity counter honest.
    pub fn set_state(&self, handle: &WebClientHandle, state: WsClientState) {
        let prev = WsClientState::from_u8(
            handle.state.swap(
                match state {
                    WsClientState::Idle => 0,
                    WsClientState::Transmitting => 1,
                    WsClientState::Receiving => 2,
                },
                Ordering::Relaxed,
            ),
        );
        self.note_state_change(prev, state);
    }

    fn note_state_change(&self, prev: WsClientState, next: WsClientState) {
        let was_active = prev != WsClientState::Idle;
        let is_active = next != WsClientState::Idle;
        if !was_active && is_active {
            self.active.fetch_add(1, Ordering::Relaxed);
        } else if was_active && !is_active {
            self.active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// True when any client is transmitting or receiving. Lock-free.
    pub fn any_active(&self) -> bool {
        self.active.load(Ordering::Relaxed) > 0
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Runs `f` for every connected client.
    pub fn for_each(&self, mut f: impl FnMut(&WebClientHandle)) {
        for entry in self.clients.iter() {
            f(&entry);
        }
    }

    /// Hub-owned device ids for web clients: `f0 77` prefix + counter.
    fn mint_device(&self) -> DeviceId {
        let n = self.minted.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let b = n.to_be_bytes();
        DeviceId([0xf0, 0x77, 0, 0, b[0], b[1], b[2], b[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_mints_unique_devices() {
        let registry = WebClientRegistry::new();
        let (a, _rx_a) = registry.register("alice", "phone");
        let (b, _rx_b) = registry.register("bob", "laptop");
        assert_ne!(a.device, b.device);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.by_device(a.device).unwrap().client_id, "alice");
    }

    #[test]
    fn activity_counter_follows_state_transitions() {
        let registry = WebClientRegistry::new();
        let (a, _rx) = registry.register("alice", "phone");
        assert!(!registry.any_active());

        registry.set_state(&a, WsClientState::Transmitting);
        assert!(registry.any_active());
        // Transmitting -> Receiving stays active, no double count.
        registry.set_state(&a, WsClientState::Receiving);
        assert!(registry.any_active());
        registry.set_state(&a, WsClientState::Idle);
        assert!(!registry.any_active());
    }

    #[test]
    fn removing_an_active_client_clears_activity() {
        let registry = WebClientRegistry::new();
        let (a, _rx) = registry.register("alice", "phone");
        registry.set_state(&a, WsClientState::Transmitting);
        registry.remove("alice");
        assert!(!registry.any_active());
        assert!(registry.get("alice").is_none());
    }

    #[test]
    fn slow_clients_drop_instead_of_blocking() {
        let registry = WebClientRegistry::new();
        let (a, _rx) = registry.register("alice", "phone");
        // Queue depth + a few extra; the extras must drop, not block.
        for _ in 0..WS_CLIENT_QUEUE + 5 {
            a.send(WsOutbound::Pcm(Bytes::from_static(&[0u8; 4])));
        }
        assert_eq!(a.dropped(), 5);
    }

    #[test]
    fn sequence_is_monotonic_across_bursts() {
        let registry = WebClientRegistry::new();
        let (a, _rx) = registry.register("alice", "phone");
        let first: Vec<u32> = (0..3).map(|_| a.next_seq()).collect();
        // A pause in the browser does not touch the counter.
        let second: Vec<u32> = (0..3).map(|_| a.next_seq()).collect();
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(second, vec![3, 4, 5]);
    }
}
