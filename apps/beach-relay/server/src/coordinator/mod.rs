//! Server side of the session: rooms, per-connection resource ownership and
//! request dispatch against the media engine.

use std::sync::Arc;

use beach_relay_core::{PeerId, RoomId};
use dashmap::DashMap;
use metrics::gauge;
use tokio::sync::mpsc;
use tracing::info;

use crate::engine::{ListenIp, MediaRouter, WebRtcTransportOptions};

mod error;
mod peer;
mod room;
mod transport;

pub use error::CoordinatorError;
pub use peer::{PeerSession, Reply};
pub use room::{ActiveProducer, Room, RoomEvent, RoomSnapshot};
pub use transport::TransportState;

/// Receiving half of a connection's room event queue.
pub type PeerEvents = mpsc::UnboundedReceiver<RoomEvent>;

/// How transports are created for every peer.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp {
                ip: std::net::IpAddr::from([127, 0, 0, 1]),
                announced_ip: None,
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: 1_500_000,
        }
    }
}

impl TransportSettings {
    pub(crate) fn options(&self, force_tcp: bool) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: self.listen_ips.clone(),
            enable_udp: self.enable_udp && !force_tcp,
            enable_tcp: self.enable_tcp || force_tcp,
            prefer_udp: self.prefer_udp && !force_tcp,
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    router: Arc<dyn MediaRouter>,
    rooms: DashMap<RoomId, Arc<Room>>,
    settings: TransportSettings,
}

impl Coordinator {
    pub fn new(router: Arc<dyn MediaRouter>, settings: TransportSettings) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                router,
                rooms: DashMap::new(),
                settings,
            }),
        }
    }

    /// Starts serving a new signaling connection bound to `room_id`. The peer
    /// only becomes a room member once it joins.
    pub fn connect(&self, room_id: RoomId) -> (PeerSession, PeerEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(self.clone(), PeerId::generate(), room_id, events_tx);
        (session, events_rx)
    }

    pub fn router(&self) -> &Arc<dyn MediaRouter> {
        &self.inner.router
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.inner.settings
    }

    pub fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.inner
            .rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        let rooms: Vec<Arc<Room>> = self
            .inner
            .rooms
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut snapshots: Vec<RoomSnapshot> = rooms.iter().map(|room| room.snapshot()).collect();
        snapshots.sort_by(|a, b| a.room_id.as_str().cmp(b.room_id.as_str()));
        snapshots
    }

    /// Registers a member while holding the room's map entry so a concurrent
    /// [`release_room`](Self::release_room) cannot drop the room underneath it.
    pub(crate) fn enter_room(
        &self,
        room_id: &RoomId,
        peer_id: PeerId,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> (Arc<Room>, Option<ActiveProducer>) {
        let entry = self
            .inner
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                info!(room_id = %room_id, "room created");
                Arc::new(Room::new(room_id.clone()))
            });
        let room = Arc::clone(entry.value());
        let active = room.add_member(peer_id, events);
        drop(entry);
        gauge!("beach_relay_rooms_active", self.inner.rooms.len() as f64);
        (room, active)
    }

    pub(crate) fn release_room(&self, room: &Arc<Room>) {
        let removed = self
            .inner
            .rooms
            .remove_if(room.id(), |_, current| {
                Arc::ptr_eq(current, room) && current.member_count() == 0
            })
            .is_some();
        if removed {
            info!(room_id = %room.id(), "room dropped");
        }
        gauge!("beach_relay_rooms_active", self.inner.rooms.len() as f64);
    }
}

#[cfg(test)]
mod tests;
