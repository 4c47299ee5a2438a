use serde::{Deserialize, Serialize};

use crate::geo::Location;
use crate::room::RoomType;
use crate::session::SearchMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicRoomAction {
    /// Join an existing room or open a new one.
    #[default]
    Find,
    /// Only join an existing room.
    Join,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "join_grid", rename_all = "camelCase")]
    JoinGrid {
        latitude: Option<f64>,
        longitude: Option<f64>,
        radius: Option<u32>,
        search_mode: Option<SearchMode>,
    },
    #[serde(rename = "send_message")]
    SendMessage { message: String },
    #[serde(rename = "typing_start")]
    TypingStart,
    #[serde(rename = "typing_stop")]
    TypingStop,
    #[serde(rename = "update_radius")]
    UpdateRadius { radius: u32 },
    #[serde(rename = "create_named_room", rename_all = "camelCase")]
    CreateNamedRoom { room_name: String },
    #[serde(rename = "join_named_room", rename_all = "camelCase")]
    JoinNamedRoom { room_id: String },
    #[serde(rename = "join_public_room")]
    JoinPublicRoom {
        location: Option<Location>,
        radius: Option<u32>,
        action: Option<PublicRoomAction>,
    },
    #[serde(rename = "leave_room")]
    LeaveRoom,
    #[serde(rename = "leave_grid")]
    LeaveGrid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session_created", rename_all = "camelCase")]
    SessionCreated {
        session_id: String,
        codename: String,
        status: String,
    },
    #[serde(rename = "connection_established", rename_all = "camelCase")]
    ConnectionEstablished {
        room_id: String,
        status: String,
        partner_codename: Option<String>,
    },
    #[serde(rename = "message_received", rename_all = "camelCase")]
    MessageReceived {
        message: String,
        from: String,
        timestamp: String,
        sender_id: String,
    },
    #[serde(rename = "message_blocked")]
    MessageBlocked {
        /// Sent as `blockType`; `type` is the event tag.
        #[serde(rename = "blockType")]
        kind: String,
        title: String,
        message: String,
        action: String,
        reason: String,
        severity: String,
    },
    #[serde(rename = "temporarily_muted")]
    TemporarilyMuted {
        duration: u64,
        reason: String,
        message: String,
    },
    #[serde(rename = "partner_disconnected")]
    PartnerDisconnected { message: String },
    #[serde(rename = "partner_typing", rename_all = "camelCase")]
    PartnerTyping { codename: String, is_typing: bool },
    #[serde(rename = "user_joined_room", rename_all = "camelCase")]
    UserJoinedRoom {
        codename: String,
        participant_count: usize,
    },
    #[serde(rename = "user_left_room", rename_all = "camelCase")]
    UserLeftRoom {
        codename: String,
        participant_count: usize,
    },
    #[serde(rename = "room_updated", rename_all = "camelCase")]
    RoomUpdated {
        room_name: Option<String>,
        participant_count: usize,
    },
    #[serde(rename = "chat_timeout")]
    ChatTimeout { message: String },
    #[serde(rename = "named_room_created", rename_all = "camelCase")]
    NamedRoomCreated {
        room_id: String,
        room_name: String,
        shareable_link: String,
    },
    #[serde(rename = "named_room_joined", rename_all = "camelCase")]
    NamedRoomJoined {
        room_id: String,
        room_name: Option<String>,
        participant_count: usize,
        room_type: RoomType,
    },
    #[serde(rename = "room_left", rename_all = "camelCase")]
    RoomLeft { room_id: String },
    #[serde(rename = "radius_updated")]
    RadiusUpdated { radius: u32 },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}
