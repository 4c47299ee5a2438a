use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::geo::Location;
use crate::store::{now_millis, Store, StoreResult};

pub const SESSION_TTL: Duration = Duration::from_secs(3600);
pub const SESSION_LOCATIONS: &str = "geo:sessions";

const ADJECTIVES: [&str; 30] = [
    "Cipher", "Echo", "Pulse", "Void", "Flux", "Ghost", "Neon", "Pixel", "Quantum", "Shadow",
    "Vector", "Binary", "Digital", "Neural", "Crypto", "Matrix", "Zero", "Alpha", "Beta", "Delta",
    "Gamma", "Omega", "Phoenix", "Raven", "Storm", "Thunder", "Lightning", "Frost", "Fire",
    "Steel",
];

const NOUNS: [&str; 30] = [
    "Node", "Grid", "Core", "Link", "Port", "Gate", "Hub", "Cell", "Beam", "Wave", "Signal",
    "Code", "Key", "Lock", "Shard", "Fragment", "Trace", "Path", "Route", "Bridge", "Tower",
    "Spike", "Blade", "Shield", "Arrow", "Bolt", "Star", "Moon", "Sun", "Comet",
];

pub fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

pub fn generate_codename() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Ghost");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("Node");
    let number: u8 = rng.gen_range(1..=99);
    format!("{adjective}{noun}_{number}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Proximity,
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub codename: String,
    pub connection_id: String,
    pub location: Option<Location>,
    pub search_radius: u32,
    pub search_mode: SearchMode,
    pub is_active: bool,
    pub chat_room_id: Option<String>,
    pub connected_with: Option<String>,
    pub created_at: i64,
}

impl Session {
    pub fn new(
        connection_id: &str,
        location: Option<Location>,
        search_radius: u32,
        search_mode: SearchMode,
    ) -> Self {
        Session {
            session_id: Uuid::new_v4().to_string(),
            codename: generate_codename(),
            connection_id: connection_id.to_string(),
            location,
            search_radius,
            search_mode,
            is_active: true,
            chat_room_id: None,
            connected_with: None,
            created_at: now_millis(),
        }
    }

    /// Active, located, proximity-mode and not in a room.
    pub fn is_scanning(&self) -> bool {
        self.is_active
            && self.chat_room_id.is_none()
            && self.location.is_some()
            && self.search_mode == SearchMode::Proximity
    }

    pub fn is_free(&self) -> bool {
        self.is_active && self.chat_room_id.is_none()
    }
}

/// Authoritative session map.
///
/// Every change goes through the map's write lock first and is then mirrored
/// into the store, so the store's `session:{id}` records trail the map but
/// never lead it.
pub struct SessionRegistry {
    store: Arc<Store>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        SessionRegistry {
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Add a session to the map. The store copy is best effort: a session
    /// whose record could not be written still works from the map.
    pub async fn register(&self, session: Session) {
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session.session_id.clone(), session.clone());
        }
        self.persist_quietly(&session).await;
        if let Some(location) = session.location {
            if let Err(e) = self
                .store
                .geo_index(SESSION_LOCATIONS, &session.session_id, location)
                .await
            {
                warn!("Could not index session {}: {e}", session.codename);
            }
        }
    }

    async fn persist(&self, session: &Session) -> StoreResult<()> {
        self.store
            .put_json(&session_key(&session.session_id), session, Some(SESSION_TTL))
            .await
    }

    async fn persist_quietly(&self, session: &Session) {
        if let Err(e) = self.persist(session).await {
            warn!("Could not persist session {}: {e}", session.codename);
        }
    }

    /// Push back the expiry of a live session's store record, rewriting the
    /// record if it has already lapsed.
    pub async fn refresh(&self, session_id: &str) {
        let Some(session) = self.get(session_id).await else {
            return;
        };
        match self.store.expire(&session_key(session_id), SESSION_TTL).await {
            Ok(true) => {}
            Ok(false) => self.persist_quietly(&session).await,
            Err(e) => warn!("Could not refresh session {}: {e}", session.codename),
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Apply `change` to a registered session and mirror it to the store.
    pub async fn update<F>(&self, session_id: &str, change: F) -> Option<Session>
    where
        F: FnOnce(&mut Session),
    {
        let updated = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(session_id)?;
            change(session);
            session.clone()
        };
        self.persist_quietly(&updated).await;
        Some(updated)
    }

    /// Bind both sessions to `room_id` if, at this instant, both are still
    /// registered, active and roomless. Either both are claimed or neither is.
    pub async fn try_claim_pair(&self, a: &str, b: &str, room_id: &str) -> bool {
        if a == b {
            return false;
        }
        let claimed = {
            let mut sessions = self.sessions.write().await;
            let free = |id: &str| sessions.get(id).is_some_and(Session::is_free);
            if !free(a) || !free(b) {
                return false;
            }
            let mut claimed = Vec::with_capacity(2);
            for id in [a, b] {
                if let Some(session) = sessions.get_mut(id) {
                    session.chat_room_id = Some(room_id.to_string());
                    session.connected_with = Some("matched".to_string());
                    claimed.push(session.clone());
                }
            }
            claimed
        };
        for session in &claimed {
            self.persist_quietly(session).await;
        }
        true
    }

    /// Bind one free session to a multi-party room.
    pub async fn try_claim(&self, session_id: &str, room_id: &str, tag: &str) -> bool {
        let claimed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(session_id) {
                Some(session) if session.is_free() => {
                    session.chat_room_id = Some(room_id.to_string());
                    session.connected_with = Some(tag.to_string());
                    session.clone()
                }
                _ => return false,
            }
        };
        self.persist_quietly(&claimed).await;
        true
    }

    /// Clear the room binding, but only if it still points at `room_id`.
    /// A session that is not kept active goes idle until it joins again.
    pub async fn release(
        &self,
        session_id: &str,
        room_id: &str,
        keep_active: bool,
    ) -> Option<Session> {
        let released = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(session_id)?;
            if session.chat_room_id.as_deref() != Some(room_id) {
                return None;
            }
            session.chat_room_id = None;
            session.connected_with = None;
            session.is_active = keep_active;
            session.clone()
        };
        self.persist_quietly(&released).await;
        Some(released)
    }

    pub async fn scanning_sessions(&self) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_scanning())
            .cloned()
            .collect()
    }

    /// Drop a session from the map. Store cleanup is [`SessionRegistry::purge`].
    pub async fn remove(&self, session_id: &str) -> Option<Session> {
        self.sessions.write().await.remove(session_id)
    }

    /// Delete a session's store record and location entry.
    pub async fn purge(&self, session_id: &str) -> StoreResult<()> {
        self.store.geo_remove(SESSION_LOCATIONS, session_id).await?;
        self.store.delete(&session_key(session_id)).await?;
        Ok(())
    }
}
