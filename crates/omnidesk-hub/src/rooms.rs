//! Room membership — conversation-scoped fan-out to operator sockets
//!
//! Each connected socket registers an unbounded sender here; room
//! membership decides which sockets see conversation-scoped events.
//! A disconnect purges the socket from every room immediately.

use crate::protocol::ServerEvent;
use std::collections::{HashMap, HashSet};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

pub struct RoomManager {
    clients: RwLock<HashMap<String, mpsc::UnboundedSender<ServerEvent>>>,
    rooms: RwLock<HashMap<String, HashSet<String>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, socket_id: &str, tx: mpsc::UnboundedSender<ServerEvent>) {
        self.clients.write().await.insert(socket_id.to_string(), tx);
        info!("Registered operator socket {}", socket_id);
    }

    pub async fn unregister(&self, socket_id: &str) {
        self.clients.write().await.remove(socket_id);
        let mut rooms = self.rooms.write().await;
        for members in rooms.values_mut() {
            members.remove(socket_id);
        }
        rooms.retain(|_, members| !members.is_empty());
        info!("Unregistered operator socket {}", socket_id);
    }

    pub async fn join(&self, conversation_id: &str, socket_id: &str) {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(conversation_id.to_string())
            .or_default()
            .insert(socket_id.to_string());
        debug!("Socket {} joined room {}", socket_id, conversation_id);
    }

    pub async fn leave(&self, conversation_id: &str, socket_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(conversation_id) {
            members.remove(socket_id);
            if members.is_empty() {
                rooms.remove(conversation_id);
            }
        }
        debug!("Socket {} left room {}", socket_id, conversation_id);
    }

    pub async fn is_member(&self, conversation_id: &str, socket_id: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(conversation_id)
            .is_some_and(|members| members.contains(socket_id))
    }

    /// Deliver an event to every member of a room. `exclude` skips the
    /// originating socket for peer-to-peer relays.
    pub async fn broadcast_room(
        &self,
        conversation_id: &str,
        event: ServerEvent,
        exclude: Option<&str>,
    ) {
        let members: Vec<String> = match self.rooms.read().await.get(conversation_id) {
            Some(members) => members
                .iter()
                .filter(|id| exclude != Some(id.as_str()))
                .cloned()
                .collect(),
            None => return,
        };
        let clients = self.clients.read().await;
        for socket_id in members {
            if let Some(tx) = clients.get(&socket_id) {
                // a closed socket is cleaned up by its own task
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Deliver an event to every connected socket regardless of rooms.
    pub async fn broadcast_all(&self, event: ServerEvent) {
        let clients = self.clients.read().await;
        for tx in clients.values() {
            let _ = tx.send(event.clone());
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn room_size(&self, conversation_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(conversation_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnidesk_core::types::ConnectionState;

    fn typing(conversation_id: &str) -> ServerEvent {
        ServerEvent::Typing {
            conversation_id: conversation_id.to_string(),
            agent_id: "agent".to_string(),
            is_typing: true,
        }
    }

    async fn client(mgr: &RoomManager, id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        mgr.register(id, tx).await;
        rx
    }

    #[tokio::test]
    async fn test_room_scoped_delivery() {
        let mgr = RoomManager::new();
        let mut in_room = client(&mgr, "s1").await;
        let mut outside = client(&mgr, "s2").await;

        mgr.join("c1", "s1").await;
        mgr.broadcast_room("c1", typing("c1"), None).await;

        assert!(in_room.recv().await.is_some());
        assert!(outside.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leave_before_delivery_means_zero_delivery() {
        let mgr = RoomManager::new();
        let mut rx = client(&mgr, "s1").await;

        mgr.join("c1", "s1").await;
        mgr.leave("c1", "s1").await;
        mgr.broadcast_room("c1", typing("c1"), None).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(mgr.room_size("c1").await, 0);
    }

    #[tokio::test]
    async fn test_exclude_originating_socket() {
        let mgr = RoomManager::new();
        let mut origin = client(&mgr, "s1").await;
        let mut peer = client(&mgr, "s2").await;
        mgr.join("c1", "s1").await;
        mgr.join("c1", "s2").await;

        mgr.broadcast_room("c1", typing("c1"), Some("s1")).await;

        assert!(peer.recv().await.is_some());
        assert!(origin.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_purges_all_memberships() {
        let mgr = RoomManager::new();
        let _rx = client(&mgr, "s1").await;
        mgr.join("c1", "s1").await;
        mgr.join("c2", "s1").await;

        mgr.unregister("s1").await;

        assert_eq!(mgr.client_count().await, 0);
        assert_eq!(mgr.room_size("c1").await, 0);
        assert_eq!(mgr.room_size("c2").await, 0);
        assert!(!mgr.is_member("c1", "s1").await);
    }

    #[tokio::test]
    async fn test_broadcast_all_ignores_rooms() {
        let mgr = RoomManager::new();
        let mut a = client(&mgr, "s1").await;
        let mut b = client(&mgr, "s2").await;
        mgr.join("c1", "s1").await;

        mgr.broadcast_all(ServerEvent::ChannelStatusChange {
            channel_id: "wa-1".to_string(),
            state: ConnectionState::Disconnected,
        })
        .await;

        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
    }
}
