//! Per-room registry of live connections and the fan-out bus over it.
//!
//! Gateways never hold references to each other; everything goes through
//! [`RoomRegistry::publish`], addressed by room id. The optional exclusion
//! implements sender-echo suppression: the author of an action receives a
//! direct acknowledgement frame instead of its own broadcast copy.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use shared::{domain::RoomId, protocol::ServerFrame};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

pub type ConnectionId = u64;

type FrameSender = mpsc::UnboundedSender<ServerFrame>;

#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<RoomId, HashMap<ConnectionId, FrameSender>>>>,
    next_id: Arc<AtomicU64>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection in the room's fan-out group. The returned
    /// sender is the connection's direct channel (acks, pongs, errors); the
    /// receiver is drained by the connection's writer task.
    pub async fn register(
        &self,
        room_id: RoomId,
    ) -> (
        ConnectionId,
        FrameSender,
        mpsc::UnboundedReceiver<ServerFrame>,
    ) {
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id)
            .or_default()
            .insert(connection_id, tx.clone());
        (connection_id, tx, rx)
    }

    pub async fn deregister(&self, room_id: RoomId, connection_id: ConnectionId) {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get_mut(&room_id) {
            group.remove(&connection_id);
            if group.is_empty() {
                rooms.remove(&room_id);
            }
        }
    }

    /// Delivers `frame` to every connection registered in the room, except
    /// the excluded one. Closed receivers are skipped; a failed delivery
    /// never surfaces to the caller, because the durable write (if any)
    /// already happened.
    pub async fn publish(
        &self,
        room_id: RoomId,
        frame: ServerFrame,
        exclude: Option<ConnectionId>,
    ) {
        let rooms = self.rooms.read().await;
        let Some(group) = rooms.get(&room_id) else {
            return;
        };
        for (&connection_id, sender) in group {
            if Some(connection_id) == exclude {
                continue;
            }
            if sender.send(frame.clone()).is_err() {
                debug!(room_id = room_id.0, connection_id, "dropping frame for closed connection");
            }
        }
    }

    #[cfg(test)]
    pub async fn connection_count(&self, room_id: RoomId) -> usize {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .map(|group| group.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::domain::UserId;

    fn ping_frame() -> ServerFrame {
        ServerFrame::PresenceUpdate {
            user_id: UserId(1),
            online: true,
            last_seen: None,
        }
    }

    #[tokio::test]
    async fn publish_excludes_the_originating_connection() {
        let registry = RoomRegistry::new();
        let room = RoomId(1);
        let (sender_conn, _tx1, mut rx1) = registry.register(room).await;
        let (_other_conn, _tx2, mut rx2) = registry.register(room).await;

        registry.publish(room, ping_frame(), Some(sender_conn)).await;

        assert!(rx1.try_recv().is_err(), "originator must not see its own broadcast");
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn publish_without_exclusion_reaches_everyone() {
        let registry = RoomRegistry::new();
        let room = RoomId(2);
        let (_c1, _tx1, mut rx1) = registry.register(room).await;
        let (_c2, _tx2, mut rx2) = registry.register(room).await;

        registry.publish(room, ping_frame(), None).await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn publish_is_scoped_to_the_room() {
        let registry = RoomRegistry::new();
        let (_c1, _tx1, mut rx1) = registry.register(RoomId(1)).await;
        let (_c2, _tx2, mut rx2) = registry.register(RoomId(2)).await;

        registry.publish(RoomId(1), ping_frame(), None).await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn deregister_prunes_empty_rooms() {
        let registry = RoomRegistry::new();
        let room = RoomId(3);
        let (conn, _tx, _rx) = registry.register(room).await;
        assert_eq!(registry.connection_count(room).await, 1);

        registry.deregister(room, conn).await;
        assert_eq!(registry.connection_count(room).await, 0);

        let frame = ServerFrame::Pong {
            server_time: Utc::now(),
        };
        // publishing into an empty room is a quiet no-op
        registry.publish(room, frame, None).await;
    }
}
