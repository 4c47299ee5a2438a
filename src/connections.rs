use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::messages::ServerMessage;
use crate::room::ChatRoom;

/// Outbound channel per live connection. Each connection's writer task
/// drains its receiver onto the socket.
#[derive(Clone, Default)]
pub struct Connections {
    senders: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<ServerMessage>>>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection_id: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .write()
            .await
            .insert(connection_id.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, connection_id: &str) -> bool {
        self.senders.write().await.remove(connection_id).is_some()
    }

    /// Returns `false` when the connection is gone.
    pub async fn send(&self, connection_id: &str, message: ServerMessage) -> bool {
        let senders = self.senders.read().await;
        senders
            .get(connection_id)
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Deliver to every member of `room` except the session `except`.
    pub async fn send_to_room(&self, room: &ChatRoom, message: &ServerMessage, except: Option<&str>) {
        let senders = self.senders.read().await;
        for participant in &room.participants {
            if Some(participant.session_id.as_str()) == except {
                continue;
            }
            if let Some(tx) = senders.get(&participant.connection_id) {
                let _ = tx.send(message.clone());
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.senders.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{generate_room_id, Participant, RoomType};

    #[tokio::test]
    async fn room_delivery_skips_excluded_member() {
        let connections = Connections::new();
        let mut rx_a = connections.register("conn-a").await;
        let mut rx_b = connections.register("conn-b").await;

        let room = ChatRoom::new(
            generate_room_id(),
            RoomType::Proximity,
            vec![
                Participant {
                    session_id: "a".into(),
                    codename: "A".into(),
                    connection_id: "conn-a".into(),
                },
                Participant {
                    session_id: "b".into(),
                    codename: "B".into(),
                    connection_id: "conn-b".into(),
                },
            ],
        );
        connections
            .send_to_room(&room, &ServerMessage::error("hi"), Some("a"))
            .await;

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), ServerMessage::error("hi"));
    }

    #[tokio::test]
    async fn send_reports_missing_connection() {
        let connections = Connections::new();
        let _rx = connections.register("conn-a").await;
        assert!(connections.send("conn-a", ServerMessage::error("x")).await);
        assert!(connections.unregister("conn-a").await);
        assert!(!connections.send("conn-a", ServerMessage::error("x")).await);
        assert_eq!(connections.len().await, 0);
    }
}
