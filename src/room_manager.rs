use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::connections::Connections;
use crate::error::{ChatError, ChatResult};
use crate::geo::Location;
use crate::matchmaking::{ChatOutcome, EndReason, MatchmakingEngine};
use crate::messages::{PublicRoomAction, ServerMessage};
use crate::room::{generate_room_id, room_key, ChatRoom, Participant, RoomType};
use crate::session::{Session, SessionRegistry};
use crate::store::{now_millis, Store, StoreResult};

pub const ROOM_TTL: Duration = Duration::from_secs(3600);
pub const PUBLIC_ROOM_LOCATIONS: &str = "geo:public_rooms";

const PARTNER_LEFT: &str = "Your chat partner has disconnected";
const TIMED_OUT: &str = "Chat ended due to inactivity";

/// Reply gaps in one room: how long each member took to answer someone else.
#[derive(Debug, Default)]
struct ReplyClock {
    last: Option<(String, i64)>,
    gaps: HashMap<String, (u64, u64)>,
}

impl ReplyClock {
    fn record(&mut self, sender: &str, at: i64) {
        if let Some((previous, sent_at)) = &self.last {
            if previous != sender {
                let gap = u64::try_from(at - sent_at).unwrap_or(0);
                let (total, count) = self.gaps.entry(sender.to_string()).or_default();
                *total += gap;
                *count += 1;
            }
        }
        self.last = Some((sender.to_string(), at));
    }

    /// Mean reply gap of `member`, removing their samples.
    fn take_mean(&mut self, member: &str) -> Option<u64> {
        let (total, count) = self.gaps.remove(member)?;
        (count > 0).then(|| total / count)
    }
}

/// Owns room records and their inactivity timers.
///
/// Room records live in the store under `room:{id}`. Every read-modify-write
/// of a record happens under `mutation`, so joins, departures and timeouts on
/// the same room never interleave.
pub struct RoomManager {
    store: Arc<Store>,
    sessions: Arc<SessionRegistry>,
    matchmaking: Arc<MatchmakingEngine>,
    connections: Connections,
    chat_timeout: Duration,
    frontend_url: String,
    mutation: Mutex<()>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    replies: Mutex<HashMap<String, ReplyClock>>,
}

impl RoomManager {
    pub fn new(
        store: Arc<Store>,
        sessions: Arc<SessionRegistry>,
        matchmaking: Arc<MatchmakingEngine>,
        connections: Connections,
        chat_timeout: Duration,
        frontend_url: &str,
    ) -> Self {
        RoomManager {
            store,
            sessions,
            matchmaking,
            connections,
            chat_timeout,
            frontend_url: frontend_url.trim_end_matches('/').to_string(),
            mutation: Mutex::new(()),
            timers: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
        }
    }

    pub fn shareable_link(&self, room_id: &str) -> String {
        format!("{}/room/{room_id}", self.frontend_url)
    }

    pub async fn get(&self, room_id: &str) -> ChatResult<Option<ChatRoom>> {
        Ok(self.store.get_json(&room_key(room_id)).await?)
    }

    /// Number of open rooms. Timed-out records linger until their TTL and
    /// are not counted.
    pub async fn count(&self) -> ChatResult<usize> {
        let records = self.store.values_with_prefix("room:").await?;
        Ok(records
            .iter()
            .filter_map(|json| serde_json::from_str::<ChatRoom>(json).ok())
            .filter(|room| room.is_active)
            .count())
    }

    async fn save(&self, room: &ChatRoom) -> StoreResult<()> {
        self.store
            .put_json(&room_key(&room.room_id), room, Some(ROOM_TTL))
            .await
    }

    async fn open_room(&self, room_id: &str) -> ChatResult<ChatRoom> {
        match self.get(room_id).await? {
            Some(room) if room.is_active => Ok(room),
            _ => Err(ChatError::not_found("Room not found or expired")),
        }
    }

    /// Persist a freshly built room, index public rooms by location and
    /// start the inactivity timer for multi-party rooms. Member sessions
    /// must already be bound to the room id.
    pub async fn create(self: &Arc<Self>, room: ChatRoom) -> ChatResult<ChatRoom> {
        self.save(&room).await?;
        if room.room_type == RoomType::Public {
            if let Some(location) = room.location {
                self.store
                    .geo_index(PUBLIC_ROOM_LOCATIONS, &room.room_id, location)
                    .await?;
            }
        }
        self.arm_timer(&room).await;
        info!(
            "Opened {:?} room {} with {} participant(s)",
            room.room_type,
            room.room_id,
            room.participant_count()
        );
        Ok(room)
    }

    /// Bind `creator` to `room` and open it, undoing the binding on failure.
    async fn create_with_creator(
        self: &Arc<Self>,
        creator: &Session,
        mut room: ChatRoom,
    ) -> ChatResult<ChatRoom> {
        let room_id = room.room_id.clone();
        let tag = room.room_type.session_tag();
        if !self
            .sessions
            .try_claim(&creator.session_id, &room_id, tag)
            .await
        {
            return Err(ChatError::validation("Already in a room"));
        }
        room.creator_session_id = Some(creator.session_id.clone());
        room.add_participant(Participant::from(creator));
        let created = self.create(room).await;
        if created.is_err() {
            self.sessions
                .release(&creator.session_id, &room_id, true)
                .await;
        }
        created
    }

    /// Open a two-party proximity room for a fresh match.
    ///
    /// Returns `Ok(None)` when either session stopped being free before the
    /// room could be committed; both sessions are then left as they were.
    pub async fn pair(self: &Arc<Self>, a: &str, b: &str) -> ChatResult<Option<ChatRoom>> {
        let room_id = generate_room_id();
        if !self.sessions.try_claim_pair(a, b, &room_id).await {
            debug!("Pairing aborted, a session was no longer free");
            return Ok(None);
        }
        let (Some(first), Some(second)) = (self.sessions.get(a).await, self.sessions.get(b).await)
        else {
            self.unpair(a, b, &room_id).await;
            return Ok(None);
        };

        let room = ChatRoom::new(
            room_id,
            RoomType::Proximity,
            vec![Participant::from(&first), Participant::from(&second)],
        );
        if let Err(e) = self.create(room.clone()).await {
            self.unpair(a, b, &room.room_id).await;
            return Err(e);
        }

        // a disconnect may have landed while the record was being written
        if !self.sessions.contains(a).await || !self.sessions.contains(b).await {
            if let Err(e) = self.store.delete(&room_key(&room.room_id)).await {
                warn!("Could not delete abandoned room {}: {e}", room.room_id);
            }
            self.unpair(a, b, &room.room_id).await;
            return Ok(None);
        }

        for (me, partner) in [(&first, &second), (&second, &first)] {
            self.connections
                .send(
                    &me.connection_id,
                    ServerMessage::ConnectionEstablished {
                        room_id: room.room_id.clone(),
                        status: "connected".to_string(),
                        partner_codename: Some(partner.codename.clone()),
                    },
                )
                .await;
        }
        info!(
            "Matched {} with {} in {}",
            first.codename, second.codename, room.room_id
        );
        Ok(Some(room))
    }

    async fn unpair(&self, a: &str, b: &str, room_id: &str) {
        self.sessions.release(a, room_id, true).await;
        self.sessions.release(b, room_id, true).await;
    }

    pub async fn create_named(
        self: &Arc<Self>,
        creator: &Session,
        room_name: &str,
    ) -> ChatResult<ChatRoom> {
        let mut room = ChatRoom::new(generate_room_id(), RoomType::Named, Vec::new());
        room.room_name = Some(room_name.to_string());
        let room = self.create_with_creator(creator, room).await?;

        self.connections
            .send(
                &creator.connection_id,
                ServerMessage::NamedRoomCreated {
                    room_id: room.room_id.clone(),
                    room_name: room_name.to_string(),
                    shareable_link: self.shareable_link(&room.room_id),
                },
            )
            .await;
        Ok(room)
    }

    /// Join a named room by id. Joining a room the session is already in is
    /// a no-op.
    pub async fn join_named(self: &Arc<Self>, session: &Session, room_id: &str) -> ChatResult<ChatRoom> {
        let room = self
            .get(room_id)
            .await?
            .filter(|room| room.is_active && room.room_type == RoomType::Named)
            .ok_or_else(|| ChatError::not_found("Room not found or expired"))?;
        if room.has_participant(&session.session_id) {
            debug!("{} is already in {room_id}", session.codename);
            return Ok(room);
        }
        self.join(room_id, session).await
    }

    /// Add `session` to an open room and tell the existing members.
    pub async fn join(self: &Arc<Self>, room_id: &str, session: &Session) -> ChatResult<ChatRoom> {
        let room = {
            let _guard = self.mutation.lock().await;
            let mut room = self.open_room(room_id).await?;
            if room.has_participant(&session.session_id) {
                return Err(ChatError::validation("Already in this room"));
            }
            if room.is_full() {
                return Err(ChatError::validation("Room is full"));
            }
            let tag = room.room_type.session_tag();
            if !self
                .sessions
                .try_claim(&session.session_id, room_id, tag)
                .await
            {
                return Err(ChatError::validation("Already in a room"));
            }
            room.add_participant(Participant::from(session));
            room.touch();
            if let Err(e) = self.save(&room).await {
                self.sessions
                    .release(&session.session_id, room_id, true)
                    .await;
                return Err(e.into());
            }
            room
        };

        self.arm_timer(&room).await;
        self.connections
            .send_to_room(
                &room,
                &ServerMessage::UserJoinedRoom {
                    codename: session.codename.clone(),
                    participant_count: room.participant_count(),
                },
                Some(&session.session_id),
            )
            .await;
        self.connections
            .send(
                &session.connection_id,
                ServerMessage::NamedRoomJoined {
                    room_id: room.room_id.clone(),
                    room_name: room.room_name.clone(),
                    participant_count: room.participant_count(),
                    room_type: room.room_type,
                },
            )
            .await;
        info!(
            "{} joined {} ({} participants)",
            session.codename,
            room.room_id,
            room.participant_count()
        );
        Ok(room)
    }

    /// Join the nearest open public room with space within `radius` meters,
    /// or open a new one at `location` unless the caller asked to join only.
    pub async fn find_or_create_public(
        self: &Arc<Self>,
        session: &Session,
        location: Location,
        radius: u32,
        action: PublicRoomAction,
    ) -> ChatResult<ChatRoom> {
        if !session.is_free() {
            return Err(ChatError::validation("Already in a room"));
        }

        let nearby = self
            .store
            .geo_query(PUBLIC_ROOM_LOCATIONS, location, f64::from(radius))
            .await?;
        for (room_id, distance) in nearby {
            match self.get(&room_id).await? {
                Some(room) if room.is_active => {
                    if room.is_full() {
                        continue;
                    }
                    match self.join(&room_id, session).await {
                        Ok(room) => {
                            debug!("Public room {room_id} found {distance:.0}m away");
                            return Ok(room);
                        }
                        // filled up or closed since the query
                        Err(ChatError::Validation(_) | ChatError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                _ => {
                    debug!("Pruning stale public room anchor {room_id}");
                    self.store
                        .geo_remove(PUBLIC_ROOM_LOCATIONS, &room_id)
                        .await?;
                }
            }
        }

        if action == PublicRoomAction::Join {
            return Err(ChatError::not_found("No rooms nearby"));
        }

        let mut room = ChatRoom::new(generate_room_id(), RoomType::Public, Vec::new());
        room.location = Some(location);
        let room = self.create_with_creator(session, room).await?;
        self.connections
            .send(
                &session.connection_id,
                ServerMessage::NamedRoomJoined {
                    room_id: room.room_id.clone(),
                    room_name: None,
                    participant_count: room.participant_count(),
                    room_type: RoomType::Public,
                },
            )
            .await;
        Ok(room)
    }

    /// Take `session_id` out of `room_id`.
    ///
    /// Proximity rooms, and multi-party rooms left empty, close at once and
    /// any remaining member is told their partner left. Otherwise the room
    /// stays open for the others.
    pub async fn leave(self: &Arc<Self>, session_id: &str, room_id: &str) -> ChatResult<()> {
        self.sessions.release(session_id, room_id, false).await;

        let (room, departed, closing) = {
            let _guard = self.mutation.lock().await;
            let Some(mut room) = self.get(room_id).await? else {
                return Ok(());
            };
            let departed = room.remove_participant(session_id);
            let closing = !room.room_type.is_multi_party() || room.participants.is_empty();
            if closing {
                self.close(&room).await;
            } else {
                room.touch();
                if let Err(e) = self.save(&room).await {
                    warn!("Could not update room {room_id}: {e}");
                }
            }
            (room, departed, closing)
        };

        if departed.is_some() {
            self.record_outcome(session_id, &room, EndReason::Left).await;
        }

        if closing {
            for peer in &room.participants {
                self.connections
                    .send(
                        &peer.connection_id,
                        ServerMessage::PartnerDisconnected {
                            message: PARTNER_LEFT.to_string(),
                        },
                    )
                    .await;
                self.sessions.release(&peer.session_id, room_id, false).await;
                self.record_outcome(&peer.session_id, &room, EndReason::Left)
                    .await;
            }
            self.replies.lock().await.remove(room_id);
            info!("Closed room {room_id}");
            return Ok(());
        }

        self.arm_timer(&room).await;
        let codename = departed.map(|p| p.codename).unwrap_or_default();
        let count = room.participant_count();
        self.connections
            .send_to_room(
                &room,
                &ServerMessage::UserLeftRoom {
                    codename,
                    participant_count: count,
                },
                None,
            )
            .await;
        self.connections
            .send_to_room(
                &room,
                &ServerMessage::RoomUpdated {
                    room_name: room.room_name.clone(),
                    participant_count: count,
                },
                None,
            )
            .await;
        Ok(())
    }

    /// Deliver a chat line. A shadow-banned sender only sees their own message.
    pub async fn send(
        self: &Arc<Self>,
        sender: &Session,
        message: &str,
        shadow: bool,
    ) -> ChatResult<()> {
        let room = self.touch_as_member(sender).await?;
        let delivery = ServerMessage::MessageReceived {
            message: message.to_string(),
            from: sender.codename.clone(),
            timestamp: Utc::now().to_rfc3339(),
            sender_id: sender.connection_id.clone(),
        };
        if shadow {
            self.connections.send(&sender.connection_id, delivery).await;
        } else {
            self.replies
                .lock()
                .await
                .entry(room.room_id.clone())
                .or_default()
                .record(&sender.session_id, now_millis());
            self.connections.send_to_room(&room, &delivery, None).await;
        }
        Ok(())
    }

    pub async fn typing(self: &Arc<Self>, sender: &Session, is_typing: bool) -> ChatResult<()> {
        let room = self.touch_as_member(sender).await?;
        self.connections
            .send_to_room(
                &room,
                &ServerMessage::PartnerTyping {
                    codename: sender.codename.clone(),
                    is_typing,
                },
                Some(&sender.session_id),
            )
            .await;
        Ok(())
    }

    /// Record activity from a member and restart the room's timer.
    async fn touch_as_member(self: &Arc<Self>, sender: &Session) -> ChatResult<ChatRoom> {
        let room_id = sender
            .chat_room_id
            .as_deref()
            .ok_or_else(|| ChatError::validation("Not in an active chat"))?;
        let room = {
            let _guard = self.mutation.lock().await;
            let mut room = self.open_room(room_id).await?;
            if !room.has_participant(&sender.session_id) {
                return Err(ChatError::not_found("Not in an active chat"));
            }
            room.touch();
            self.save(&room).await?;
            room
        };
        self.arm_timer(&room).await;
        Ok(room)
    }

    /// Close a room whose inactivity timer fired. Returns whether it closed.
    pub async fn timeout(&self, room_id: &str) -> ChatResult<bool> {
        let room = {
            let _guard = self.mutation.lock().await;
            let Some(mut room) = self.get(room_id).await? else {
                return Ok(false);
            };
            let idle_ms = now_millis() - room.last_activity;
            if !room.is_active || idle_ms < duration_millis(self.chat_timeout) {
                return Ok(false);
            }
            room.is_active = false;
            self.save(&room).await?;
            room
        };

        // the running timer is this task, so it is dropped rather than aborted
        self.timers.lock().await.remove(room_id);
        if room.room_type == RoomType::Public {
            if let Err(e) = self.store.geo_remove(PUBLIC_ROOM_LOCATIONS, room_id).await {
                warn!("Could not unindex room {room_id}: {e}");
            }
        }

        self.connections
            .send_to_room(
                &room,
                &ServerMessage::ChatTimeout {
                    message: TIMED_OUT.to_string(),
                },
                None,
            )
            .await;
        for member in &room.participants {
            self.sessions
                .release(&member.session_id, room_id, false)
                .await;
            self.record_outcome(&member.session_id, &room, EndReason::Timeout)
                .await;
        }
        self.replies.lock().await.remove(room_id);
        info!("Room {room_id} timed out");
        Ok(true)
    }

    /// Delete a room record, its location entry and its timer. Best effort.
    async fn close(&self, room: &ChatRoom) {
        if let Err(e) = self.store.delete(&room_key(&room.room_id)).await {
            warn!("Could not delete room {}: {e}", room.room_id);
        }
        if room.room_type == RoomType::Public {
            if let Err(e) = self
                .store
                .geo_remove(PUBLIC_ROOM_LOCATIONS, &room.room_id)
                .await
            {
                warn!("Could not unindex room {}: {e}", room.room_id);
            }
        }
        self.cancel_timer(&room.room_id).await;
    }

    async fn record_outcome(&self, session_id: &str, room: &ChatRoom, reason: EndReason) {
        let response_time_ms = self
            .replies
            .lock()
            .await
            .get_mut(&room.room_id)
            .and_then(|clock| clock.take_mean(session_id));
        let outcome = ChatOutcome {
            chat_duration: room.age(),
            reason,
            response_time_ms,
        };
        if let Err(e) = self.matchmaking.update_statistics(session_id, &outcome).await {
            warn!("Could not record chat statistics: {e}");
        }
    }

    /// (Re)start the inactivity timer of an open multi-party room.
    async fn arm_timer(self: &Arc<Self>, room: &ChatRoom) {
        if !room.room_type.is_multi_party() || !room.is_active {
            return;
        }
        let manager = Arc::downgrade(self);
        let room_id = room.room_id.clone();
        let timeout = self.chat_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if let Err(e) = manager.timeout(&room_id).await {
                warn!("Timeout of room {room_id} failed: {e}");
            }
        });
        if let Some(previous) = self.timers.lock().await.insert(room.room_id.clone(), handle) {
            previous.abort();
        }
    }

    async fn cancel_timer(&self, room_id: &str) {
        if let Some(handle) = self.timers.lock().await.remove(room_id) {
            handle.abort();
        }
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
