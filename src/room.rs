use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::Location;
use crate::session::Session;
use crate::store::now_millis;

pub const PUBLIC_ROOM_CAPACITY: usize = 10;

pub fn room_key(room_id: &str) -> String {
    format!("room:{room_id}")
}

pub fn generate_room_id() -> String {
    format!("room_{}", Uuid::new_v4())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    Proximity,
    Named,
    Public,
}

impl RoomType {
    /// Named and public rooms outlive individual departures.
    pub fn is_multi_party(self) -> bool {
        !matches!(self, RoomType::Proximity)
    }

    /// Value stored in a member session's `connected_with`.
    pub fn session_tag(self) -> &'static str {
        match self {
            RoomType::Proximity => "matched",
            RoomType::Named => "named_room",
            RoomType::Public => "public_room",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub session_id: String,
    pub codename: String,
    pub connection_id: String,
}

impl From<&Session> for Participant {
    fn from(session: &Session) -> Self {
        Participant {
            session_id: session.session_id.clone(),
            codename: session.codename.clone(),
            connection_id: session.connection_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoom {
    pub room_id: String,
    pub room_type: RoomType,
    pub room_name: Option<String>,
    pub creator_session_id: Option<String>,
    pub location: Option<Location>,
    /// In join order.
    pub participants: Vec<Participant>,
    pub is_active: bool,
    pub created_at: i64,
    pub last_activity: i64,
}

impl ChatRoom {
    pub fn new(room_id: String, room_type: RoomType, participants: Vec<Participant>) -> Self {
        let now = now_millis();
        ChatRoom {
            room_id,
            room_type,
            room_name: None,
            creator_session_id: None,
            location: None,
            participants,
            is_active: true,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn has_participant(&self, session_id: &str) -> bool {
        self.participants.iter().any(|p| p.session_id == session_id)
    }

    /// Appends unless the session is already a member.
    pub fn add_participant(&mut self, participant: Participant) -> bool {
        if self.has_participant(&participant.session_id) {
            return false;
        }
        self.participants.push(participant);
        true
    }

    pub fn remove_participant(&mut self, session_id: &str) -> Option<Participant> {
        let index = self
            .participants
            .iter()
            .position(|p| p.session_id == session_id)?;
        Some(self.participants.remove(index))
    }

    pub fn is_full(&self) -> bool {
        self.room_type == RoomType::Public && self.participant_count() >= PUBLIC_ROOM_CAPACITY
    }

    pub fn touch(&mut self) {
        self.last_activity = now_millis();
    }

    /// Time since creation, for chat statistics.
    pub fn age(&self) -> std::time::Duration {
        let ms = u64::try_from(now_millis() - self.created_at).unwrap_or(0);
        std::time::Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> Participant {
        Participant {
            session_id: id.into(),
            codename: format!("Ghost{id}"),
            connection_id: format!("conn-{id}"),
        }
    }

    #[test]
    fn participants_keep_join_order_and_reject_duplicates() {
        let mut room = ChatRoom::new(generate_room_id(), RoomType::Named, vec![member("a")]);
        assert!(room.add_participant(member("b")));
        assert!(!room.add_participant(member("a")));
        assert!(room.add_participant(member("c")));
        let order: Vec<_> = room.participants.iter().map(|p| p.session_id.as_str()).collect();
        assert_eq!(order, ["a", "b", "c"]);

        assert_eq!(room.remove_participant("b").map(|p| p.codename), Some("Ghostb".into()));
        assert_eq!(room.remove_participant("b"), None);
        assert_eq!(room.participant_count(), 2);
    }

    #[test]
    fn only_public_rooms_fill_up() {
        let members: Vec<_> = (0..PUBLIC_ROOM_CAPACITY)
            .map(|i| member(&i.to_string()))
            .collect();
        let public = ChatRoom::new(generate_room_id(), RoomType::Public, members.clone());
        let named = ChatRoom::new(generate_room_id(), RoomType::Named, members);
        assert!(public.is_full());
        assert!(!named.is_full());
    }

    #[test]
    fn room_ids_are_prefixed() {
        let id = generate_room_id();
        assert!(id.starts_with("room_"));
        assert_eq!(room_key(&id), format!("room:{id}"));
        assert!(RoomType::Public.is_multi_party());
        assert!(!RoomType::Proximity.is_multi_party());
    }
}
