use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::abuse::{AbuseDetector, AbuseVerdict, ConnectionEvent, MessageKind, PenaltyAction};
use crate::config::{ServerConfig, ALLOWED_RADII};
use crate::connections::Connections;
use crate::error::{ChatError, ChatResult};
use crate::geo::Location;
use crate::matchmaking::{proximity_fallback, MatchmakingEngine, QueueStatus};
use crate::messages::{ClientMessage, PublicRoomAction, ServerMessage};
use crate::room_manager::RoomManager;
use crate::session::{SearchMode, Session, SessionRegistry};
use crate::store::Store;

const MAX_ROOM_NAME_CHARS: usize = 50;

/// What the coordinator knows about a live connection.
#[derive(Debug, Clone, Default)]
struct Link {
    address: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub active_users: usize,
    pub active_chat_rooms: usize,
    pub queue: QueueStatus,
    pub timestamp: String,
}

/// Routes client events to sessions, matchmaking, rooms and the abuse gate,
/// and owns the per-session scan timers.
pub struct Coordinator {
    default_radius: u32,
    scan_interval: Duration,
    sessions: Arc<SessionRegistry>,
    matchmaking: Arc<MatchmakingEngine>,
    rooms: Arc<RoomManager>,
    abuse: Arc<AbuseDetector>,
    connections: Connections,
    links: RwLock<HashMap<String, Link>>,
    scans: Mutex<HashMap<String, CancellationToken>>,
}

impl Coordinator {
    pub fn new(config: &ServerConfig, store: Arc<Store>, abuse: Arc<AbuseDetector>) -> Arc<Self> {
        let connections = Connections::new();
        let sessions = Arc::new(SessionRegistry::new(store.clone()));
        let matchmaking = Arc::new(MatchmakingEngine::new(store.clone()));
        let rooms = Arc::new(RoomManager::new(
            store,
            sessions.clone(),
            matchmaking.clone(),
            connections.clone(),
            config.chat_timeout,
            &config.frontend_url,
        ));
        Arc::new(Coordinator {
            default_radius: config.location_radius,
            scan_interval: config.scan_interval,
            sessions,
            matchmaking,
            rooms,
            abuse,
            connections,
            links: RwLock::new(HashMap::new()),
            scans: Mutex::new(HashMap::new()),
        })
    }

    /// Register a new connection. `address` is the client IP, when known.
    pub async fn connect(
        &self,
        address: Option<String>,
    ) -> (String, mpsc::UnboundedReceiver<ServerMessage>) {
        let connection_id = Uuid::new_v4().to_string();
        let rx = self.connections.register(&connection_id).await;
        if let Some(address) = &address {
            if let Some(verdict) = self
                .abuse
                .track_connection(address, ConnectionEvent::Connect)
                .await
            {
                debug!("Reconnect churn penalized: {:?}", verdict.action);
            }
        }
        self.links.write().await.insert(
            connection_id.clone(),
            Link {
                address,
                session_id: None,
            },
        );
        debug!("Connection {connection_id} opened");
        (connection_id, rx)
    }

    pub async fn handle(self: &Arc<Self>, connection_id: &str, message: ClientMessage) {
        let result = match message {
            ClientMessage::JoinGrid {
                latitude,
                longitude,
                radius,
                search_mode,
            } => {
                self.join_grid(
                    connection_id,
                    latitude,
                    longitude,
                    radius,
                    search_mode.unwrap_or_default(),
                )
                .await
            }
            ClientMessage::SendMessage { message } => {
                self.send_message(connection_id, &message).await
            }
            ClientMessage::TypingStart => self.typing(connection_id, true).await,
            ClientMessage::TypingStop => self.typing(connection_id, false).await,
            ClientMessage::UpdateRadius { radius } => {
                self.update_radius(connection_id, radius).await
            }
            ClientMessage::CreateNamedRoom { room_name } => {
                self.create_named_room(connection_id, &room_name).await
            }
            ClientMessage::JoinNamedRoom { room_id } => {
                self.join_named_room(connection_id, &room_id).await
            }
            ClientMessage::JoinPublicRoom {
                location,
                radius,
                action,
            } => {
                self.join_public_room(connection_id, location, radius, action.unwrap_or_default())
                    .await
            }
            ClientMessage::LeaveRoom => self.leave_room(connection_id).await,
            ClientMessage::LeaveGrid => {
                self.leave_grid(connection_id).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            if e.is_infrastructure() {
                warn!("Request on {connection_id} failed: {e}");
            } else {
                debug!("Request on {connection_id} rejected: {e}");
            }
            self.connections
                .send(connection_id, ServerMessage::error(e.user_message()))
                .await;
        }
    }

    /// Send directly to a connection, outside any event handler.
    pub async fn notify(&self, connection_id: &str, message: ServerMessage) {
        self.connections.send(connection_id, message).await;
    }

    /// Tear down everything a closed connection owned.
    pub async fn disconnect(&self, connection_id: &str) {
        let link = self.links.write().await.remove(connection_id);
        if let Some(link) = link {
            if let Some(address) = &link.address {
                self.abuse
                    .track_connection(address, ConnectionEvent::Disconnect)
                    .await;
            }
            if let Some(session_id) = link.session_id {
                self.end_session(&session_id).await;
            }
        }
        self.connections.unregister(connection_id).await;
        debug!(
            "Connection {connection_id} closed, {} still open",
            self.connections.len().await
        );
    }

    pub async fn user_stats(&self) -> ChatResult<UserStats> {
        Ok(UserStats {
            active_users: self.sessions.count().await,
            active_chat_rooms: self.rooms.count().await?,
            queue: self.matchmaking.get_queue_status().await?,
            timestamp: Utc::now().to_rfc3339(),
        })
    }

    async fn join_grid(
        self: &Arc<Self>,
        connection_id: &str,
        latitude: Option<f64>,
        longitude: Option<f64>,
        radius: Option<u32>,
        mode: SearchMode,
    ) -> ChatResult<()> {
        let location = match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => {
                let location = Location::new(latitude, longitude);
                if !location.is_valid() {
                    return Err(ChatError::validation("Invalid location coordinates"));
                }
                Some(location)
            }
            _ if mode == SearchMode::Proximity => {
                return Err(ChatError::validation("Location coordinates required"));
            }
            _ => None,
        };
        let radius = self.checked_radius(radius)?;

        if let Some(previous) = self.take_session(connection_id).await {
            self.end_session(&previous).await;
        }
        let session = self
            .open_session(connection_id, location, radius, mode)
            .await;
        if session.is_scanning() {
            self.begin_scanning(&session).await;
        }
        Ok(())
    }

    async fn open_session(
        &self,
        connection_id: &str,
        location: Option<Location>,
        radius: u32,
        mode: SearchMode,
    ) -> Session {
        let session = Session::new(connection_id, location, radius, mode);
        let address = {
            let mut links = self.links.write().await;
            let link = links.entry(connection_id.to_string()).or_default();
            link.session_id = Some(session.session_id.clone());
            link.address.clone()
        };
        self.sessions.register(session.clone()).await;
        if let Some(address) = address {
            self.abuse
                .carry_connection_penalties(&address, &session.session_id)
                .await;
        }

        let status = if session.is_scanning() {
            "scanning"
        } else {
            "ready"
        };
        self.connections
            .send(
                connection_id,
                ServerMessage::SessionCreated {
                    session_id: session.session_id.clone(),
                    codename: session.codename.clone(),
                    status: status.to_string(),
                },
            )
            .await;
        info!("{} joined ({:?})", session.codename, mode);
        session
    }

    /// Queue a new proximity session, try to match it now, let everyone
    /// already waiting try against it, then keep scanning on a timer.
    async fn begin_scanning(self: &Arc<Self>, session: &Session) {
        if let Err(e) = self.matchmaking.enqueue(session).await {
            warn!("Could not queue {}: {e}", session.codename);
        }
        if self.scan(&session.session_id).await {
            return;
        }

        let others: Vec<String> = self
            .sessions
            .scanning_sessions()
            .await
            .into_iter()
            .map(|s| s.session_id)
            .filter(|id| *id != session.session_id)
            .collect();
        for other in others {
            self.scan(&other).await;
        }

        if self.is_scanning(&session.session_id).await {
            self.start_scan_timer(&session.session_id).await;
        }
    }

    async fn is_scanning(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .await
            .is_some_and(|s| s.is_scanning())
    }

    /// One matchmaking attempt. Returns whether the session ended up in a room.
    async fn scan(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions.get(session_id).await.filter(Session::is_scanning) else {
            return false;
        };
        // waiting can outlast the record's TTL
        self.sessions.refresh(session_id).await;

        let partner = match self.matchmaking.find_match(&session).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Matchmaking unavailable, using proximity fallback: {e}");
                let pool = self.sessions.scanning_sessions().await;
                let mut rng = rand::thread_rng();
                proximity_fallback(&session, &pool, &mut rng)
            }
        };
        let Some(partner) = partner else {
            return false;
        };

        match self.rooms.pair(session_id, &partner.session_id).await {
            Ok(Some(_)) => {
                self.stop_scanning(session_id).await;
                self.stop_scanning(&partner.session_id).await;
                true
            }
            Ok(None) => {
                self.requeue(&[session_id, &partner.session_id]).await;
                false
            }
            Err(e) => {
                warn!("Could not open room for {}: {e}", session.codename);
                self.requeue(&[session_id, &partner.session_id]).await;
                false
            }
        }
    }

    /// Put back in the queue whichever of `ids` is still scanning.
    async fn requeue(&self, ids: &[&str]) {
        for id in ids {
            if let Some(session) = self.sessions.get(id).await.filter(Session::is_scanning) {
                if let Err(e) = self.matchmaking.enqueue(&session).await {
                    warn!("Could not requeue {}: {e}", session.codename);
                }
            }
        }
    }

    async fn start_scan_timer(self: &Arc<Self>, session_id: &str) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .scans
            .lock()
            .await
            .insert(session_id.to_string(), token.clone())
        {
            previous.cancel();
        }

        let coordinator = Arc::downgrade(self);
        let session_id = session_id.to_string();
        let every = self.scan_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(coordinator) = coordinator.upgrade() else {
                            break;
                        };
                        if coordinator.scan(&session_id).await {
                            break;
                        }
                        if !coordinator.is_scanning(&session_id).await {
                            coordinator.stop_scanning(&session_id).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn stop_scanning(&self, session_id: &str) {
        if let Some(token) = self.scans.lock().await.remove(session_id) {
            token.cancel();
        }
    }

    async fn send_message(self: &Arc<Self>, connection_id: &str, message: &str) -> ChatResult<()> {
        let text = message.trim();
        if text.is_empty() {
            return Ok(());
        }
        let session = self
            .current_session(connection_id)
            .await
            .filter(|s| s.chat_room_id.is_some())
            .ok_or_else(|| ChatError::validation("Not in an active chat"))?;

        let verdict = self
            .abuse
            .evaluate(&session.session_id, text, connection_id, MessageKind::Chat)
            .await;
        if let Some(notice) = abuse_notice(&verdict) {
            self.connections.send(connection_id, notice).await;
            return Ok(());
        }
        self.rooms.send(&session, text, verdict.shadow_banned).await
    }

    async fn typing(self: &Arc<Self>, connection_id: &str, is_typing: bool) -> ChatResult<()> {
        match self.current_session(connection_id).await {
            Some(session) if session.chat_room_id.is_some() => {
                self.rooms.typing(&session, is_typing).await
            }
            _ => Ok(()),
        }
    }

    async fn update_radius(&self, connection_id: &str, radius: u32) -> ChatResult<()> {
        let radius = self.checked_radius(Some(radius))?;
        let session_id = self
            .session_id(connection_id)
            .await
            .ok_or_else(|| ChatError::not_found("No active session"))?;
        let session = self
            .sessions
            .update(&session_id, |s| s.search_radius = radius)
            .await
            .ok_or_else(|| ChatError::not_found("No active session"))?;

        self.connections
            .send(connection_id, ServerMessage::RadiusUpdated { radius })
            .await;
        if session.is_scanning() {
            self.scan(&session_id).await;
        }
        Ok(())
    }

    async fn create_named_room(self: &Arc<Self>, connection_id: &str, room_name: &str) -> ChatResult<()> {
        let room_name = room_name.trim();
        if room_name.is_empty() {
            return Err(ChatError::validation("Room name required"));
        }
        if room_name.chars().count() > MAX_ROOM_NAME_CHARS {
            return Err(ChatError::validation("Room name too long"));
        }
        let session = self
            .session_for_room(connection_id, SearchMode::Private, None)
            .await?;
        self.rooms.create_named(&session, room_name).await?;
        Ok(())
    }

    async fn join_named_room(self: &Arc<Self>, connection_id: &str, room_id: &str) -> ChatResult<()> {
        let session = self
            .session_for_room(connection_id, SearchMode::Private, None)
            .await?;
        self.rooms.join_named(&session, room_id).await?;
        Ok(())
    }

    async fn join_public_room(
        self: &Arc<Self>,
        connection_id: &str,
        location: Option<Location>,
        radius: Option<u32>,
        action: PublicRoomAction,
    ) -> ChatResult<()> {
        let location = location
            .filter(Location::is_valid)
            .ok_or_else(|| ChatError::validation("Location coordinates required"))?;
        let radius = self.checked_radius(radius)?;
        let session = self
            .session_for_room(connection_id, SearchMode::Public, Some(location))
            .await?;
        self.rooms
            .find_or_create_public(&session, location, radius, action)
            .await?;
        Ok(())
    }

    /// The connection's session, ready to enter a room. Scanning stops and
    /// an idle session is woken up; a connection without one gets a new one.
    async fn session_for_room(
        &self,
        connection_id: &str,
        mode: SearchMode,
        location: Option<Location>,
    ) -> ChatResult<Session> {
        let Some(session) = self.current_session(connection_id).await else {
            return Ok(self
                .open_session(connection_id, location, self.default_radius, mode)
                .await);
        };
        if session.chat_room_id.is_some() {
            return Err(ChatError::validation("Leave your current room first"));
        }

        self.stop_scanning(&session.session_id).await;
        if let Err(e) = self.matchmaking.remove_from_queue(&session.session_id).await {
            warn!("Could not dequeue {}: {e}", session.codename);
        }
        self.sessions
            .update(&session.session_id, |s| s.is_active = true)
            .await
            .ok_or_else(|| ChatError::not_found("No active session"))
    }

    async fn leave_room(self: &Arc<Self>, connection_id: &str) -> ChatResult<()> {
        let (session_id, room_id) = self
            .current_session(connection_id)
            .await
            .and_then(|s| s.chat_room_id.map(|room| (s.session_id, room)))
            .ok_or_else(|| ChatError::validation("Not in a room"))?;
        self.rooms.leave(&session_id, &room_id).await?;
        self.connections
            .send(connection_id, ServerMessage::RoomLeft { room_id })
            .await;
        Ok(())
    }

    /// Drop the session but keep the connection open.
    async fn leave_grid(self: &Arc<Self>, connection_id: &str) {
        if let Some(session_id) = self.take_session(connection_id).await {
            self.end_session(&session_id).await;
        }
    }

    /// Full teardown of a session. Each step runs even if an earlier one
    /// failed.
    async fn end_session(&self, session_id: &str) {
        self.stop_scanning(session_id).await;
        // removing first means no new pairing can claim it
        let snapshot = self.sessions.remove(session_id).await;

        if let Some(room_id) = snapshot.as_ref().and_then(|s| s.chat_room_id.clone()) {
            if let Err(e) = self.rooms.leave(session_id, &room_id).await {
                warn!("Leaving room {room_id} during teardown failed: {e}");
            }
        }
        if let Err(e) = self.matchmaking.cleanup_user(session_id).await {
            warn!("Matchmaking cleanup failed: {e}");
        }
        if let Err(e) = self.sessions.purge(session_id).await {
            warn!("Session record cleanup failed: {e}");
        }
        if let Err(e) = self.abuse.cleanup_user(session_id).await {
            warn!("Abuse tracking cleanup failed: {e}");
        }
        if let Some(session) = snapshot {
            info!("{} left", session.codename);
        }
    }

    async fn session_id(&self, connection_id: &str) -> Option<String> {
        self.links
            .read()
            .await
            .get(connection_id)
            .and_then(|link| link.session_id.clone())
    }

    async fn take_session(&self, connection_id: &str) -> Option<String> {
        self.links
            .write()
            .await
            .get_mut(connection_id)
            .and_then(|link| link.session_id.take())
    }

    async fn current_session(&self, connection_id: &str) -> Option<Session> {
        let session_id = self.session_id(connection_id).await?;
        self.sessions.get(&session_id).await
    }

    fn checked_radius(&self, radius: Option<u32>) -> ChatResult<u32> {
        match radius {
            None => Ok(self.default_radius),
            Some(r) if ALLOWED_RADII.contains(&r) => Ok(r),
            Some(_) => Err(ChatError::validation("Invalid search radius")),
        }
    }
}

/// Client-facing notice for a withheld message, or `None` if it may go out.
fn abuse_notice(verdict: &AbuseVerdict) -> Option<ServerMessage> {
    let reason = verdict.reason.unwrap_or("policy_violation").to_string();
    if verdict.muted {
        return Some(ServerMessage::TemporarilyMuted {
            duration: verdict.duration_secs,
            reason,
            message: format!(
                "You are muted for {} seconds. Please slow down.",
                verdict.duration_secs
            ),
        });
    }
    if !verdict.blocked {
        return None;
    }

    let action = verdict.action.unwrap_or(PenaltyAction::Block);
    let (kind, title, message) = match action {
        PenaltyAction::ContentWarning => (
            "content_warning",
            "Message not sent",
            "Your message may violate community guidelines.".to_string(),
        ),
        _ => (
            "blocked",
            "Temporarily blocked",
            format!(
                "You are blocked from chatting for {} minutes.",
                verdict.duration_secs.div_ceil(60)
            ),
        ),
    };
    Some(ServerMessage::MessageBlocked {
        kind: kind.to_string(),
        title: title.to_string(),
        message,
        action: action.as_str().to_string(),
        reason,
        severity: verdict.severity.as_str().to_string(),
    })
}
