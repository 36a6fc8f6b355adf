use std::collections::HashMap;

use beach_relay_core::{MediaKind, PeerId, ProducerId, RoomId};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Cross-peer effect queued into a member's connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    NewProducer { producer_id: ProducerId, kind: MediaKind },
    ProducerClosed { producer_id: ProducerId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveProducer {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub owner: PeerId,
}

#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub members: usize,
    pub active_producer: Option<ActiveProducer>,
}

/// Room-level state shared by every member connection.
///
/// The lock is only taken inside these methods and never spans an await.
pub struct Room {
    id: RoomId,
    inner: Mutex<RoomInner>,
}

#[derive(Default)]
struct RoomInner {
    members: HashMap<PeerId, mpsc::UnboundedSender<RoomEvent>>,
    active_producer: Option<ActiveProducer>,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            inner: Mutex::new(RoomInner::default()),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Adds a member; returns the producer it should be told about, if any.
    pub fn add_member(
        &self,
        peer_id: PeerId,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Option<ActiveProducer> {
        let mut inner = self.inner.lock();
        inner.members.insert(peer_id, events);
        inner.active_producer.clone()
    }

    /// Removes a member; returns the number of members left.
    pub fn remove_member(&self, peer_id: &PeerId) -> usize {
        let mut inner = self.inner.lock();
        inner.members.remove(peer_id);
        inner.members.len()
    }

    pub fn member_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn active_producer(&self) -> Option<ActiveProducer> {
        self.inner.lock().active_producer.clone()
    }

    /// Installs `producer` as the room's active producer. A replaced producer
    /// is announced as closed to every member, its owner included so it can
    /// release it; the new one is announced to everyone except the publisher.
    pub fn publish(&self, producer: ActiveProducer) -> Option<ActiveProducer> {
        let mut inner = self.inner.lock();
        let previous = inner.active_producer.replace(producer.clone());
        if let Some(previous) = &previous {
            broadcast(
                &inner.members,
                None,
                RoomEvent::ProducerClosed {
                    producer_id: previous.id.clone(),
                },
            );
        }
        broadcast(
            &inner.members,
            Some(&producer.owner),
            RoomEvent::NewProducer {
                producer_id: producer.id,
                kind: producer.kind,
            },
        );
        previous
    }

    /// Clears the active producer if it is still `producer_id` and tells the
    /// other members it is gone.
    pub fn unpublish(&self, producer_id: &ProducerId) -> bool {
        let mut inner = self.inner.lock();
        let owner = match &inner.active_producer {
            Some(active) if &active.id == producer_id => active.owner.clone(),
            _ => return false,
        };
        inner.active_producer = None;
        broadcast(
            &inner.members,
            Some(&owner),
            RoomEvent::ProducerClosed {
                producer_id: producer_id.clone(),
            },
        );
        true
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let inner = self.inner.lock();
        RoomSnapshot {
            room_id: self.id.clone(),
            members: inner.members.len(),
            active_producer: inner.active_producer.clone(),
        }
    }
}

fn broadcast(
    members: &HashMap<PeerId, mpsc::UnboundedSender<RoomEvent>>,
    skip: Option<&PeerId>,
    event: RoomEvent,
) {
    for (peer_id, events) in members {
        if skip == Some(peer_id) {
            continue;
        }
        // A closed queue means the member is mid-disconnect.
        let _ = events.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(room: &Room, name: &str) -> mpsc::UnboundedReceiver<RoomEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        room.add_member(PeerId::from(name), tx);
        rx
    }

    fn producer(id: &str, owner: &str) -> ActiveProducer {
        ActiveProducer {
            id: ProducerId::from(id),
            kind: MediaKind::Video,
            owner: PeerId::from(owner),
        }
    }

    #[test_timeout::timeout]
    fn publish_skips_the_publisher() {
        let room = Room::new(RoomId::default());
        let mut a = member(&room, "a");
        let mut b = member(&room, "b");

        assert!(room.publish(producer("p1", "a")).is_none());
        assert!(a.try_recv().is_err());
        assert_eq!(
            b.try_recv().unwrap(),
            RoomEvent::NewProducer {
                producer_id: ProducerId::from("p1"),
                kind: MediaKind::Video
            }
        );
        assert!(b.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn replacing_producer_announces_the_close_first() {
        let room = Room::new(RoomId::default());
        let mut a = member(&room, "a");
        let mut b = member(&room, "b");
        let mut c = member(&room, "c");

        room.publish(producer("p1", "a"));
        let _ = c.try_recv();
        let previous = room.publish(producer("p2", "b")).unwrap();
        assert_eq!(previous.id, ProducerId::from("p1"));

        assert_eq!(
            c.try_recv().unwrap(),
            RoomEvent::ProducerClosed {
                producer_id: ProducerId::from("p1")
            }
        );
        assert!(matches!(c.try_recv().unwrap(), RoomEvent::NewProducer { .. }));
        // The previous owner learns its producer was replaced.
        assert!(matches!(a.try_recv().unwrap(), RoomEvent::ProducerClosed { .. }));
        assert!(matches!(a.try_recv().unwrap(), RoomEvent::NewProducer { .. }));
        // The new publisher may be consuming p1, but hears nothing about p2.
        assert!(matches!(b.try_recv().unwrap(), RoomEvent::NewProducer { .. }));
        assert!(matches!(b.try_recv().unwrap(), RoomEvent::ProducerClosed { .. }));
        assert!(b.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn unpublish_ignores_stale_ids() {
        let room = Room::new(RoomId::default());
        room.publish(producer("p1", "a"));
        assert!(!room.unpublish(&ProducerId::from("old")));
        assert!(room.unpublish(&ProducerId::from("p1")));
        assert!(room.active_producer().is_none());
    }
}
