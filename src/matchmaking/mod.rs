//! Matchmaking engine.
//!
//! Scanning sessions wait in a sorted set scored by enqueue time. A scan
//! scores every other waiting session against the requester and takes the
//! best one that is inside the requester's radius and clears the minimum
//! score. Pair history drives the freshness score so the same two sessions
//! are not paired again right away.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;

use crate::geo::Location;
use crate::session::{session_key, Session};
use crate::store::{now_millis, Store, StoreResult};

pub mod scoring;

use scoring::{
    compatibility_score, distance_score, freshness_score, wait_time_score, ScoreBreakdown,
    SessionStats,
};

const WAIT_QUEUE: &str = "matchmaking:wait_queue";
const MATCH_HISTORY: &str = "matchmaking:history";
const STATS_PREFIX: &str = "matchmaking:stats:";

const QUEUE_TTL: Duration = Duration::from_secs(2 * 3600);
const STATS_TTL: Duration = Duration::from_secs(2 * 3600);
const HISTORY_RETENTION_MS: i64 = 30 * 24 * 3600 * 1000;
const MIN_SCORE: f64 = 0.3;
const DEFAULT_RADIUS: u32 = 1000;

fn stats_key(session_id: &str) -> String {
    format!("{STATS_PREFIX}{session_id}")
}

fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Left,
    Timeout,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Left => "left",
            EndReason::Timeout => "timeout",
        }
    }
}

/// How a session's time in a room went.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub chat_duration: Duration,
    pub reason: EndReason,
    pub response_time_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_size: usize,
    pub oldest_wait_seconds: i64,
    pub total_historical_matches: usize,
}

#[derive(Debug, Clone)]
struct Candidate {
    session: Session,
    distance: f64,
    scores: ScoreBreakdown,
}

pub struct MatchmakingEngine {
    store: Arc<Store>,
}

impl MatchmakingEngine {
    pub fn new(store: Arc<Store>) -> Self {
        MatchmakingEngine { store }
    }

    /// Put a session in the wait queue, stamped now. Re-enqueueing restamps it.
    #[allow(clippy::cast_precision_loss)]
    pub async fn enqueue(&self, session: &Session) -> StoreResult<()> {
        let now = now_millis();
        self.store
            .add_to_sorted_set(WAIT_QUEUE, &session.session_id, now as f64)
            .await?;
        self.store.expire(WAIT_QUEUE, QUEUE_TTL).await?;

        let key = stats_key(&session.session_id);
        if self.store.get(&key).await?.is_none() {
            let stats = SessionStats::fresh(session.search_radius, now);
            self.store.put_json(&key, &stats, Some(STATS_TTL)).await?;
        }
        debug!("{} queued for matchmaking", session.codename);
        Ok(())
    }

    pub async fn stats(&self, session_id: &str) -> StoreResult<Option<SessionStats>> {
        self.store.get_json(&stats_key(session_id)).await
    }

    /// Best waiting partner for `requester`, or `None`. On a match both
    /// sessions leave the queue and the pairing is recorded.
    pub async fn find_match(&self, requester: &Session) -> StoreResult<Option<Session>> {
        let Some(origin) = requester.location else {
            return Ok(None);
        };
        let radius = f64::from(requester.search_radius);
        let now = now_millis();
        let queue = self.store.sorted_set_range(WAIT_QUEUE).await?;
        let own_stats = self.stats(&requester.session_id).await?;

        let mut candidates = Vec::new();
        for (candidate_id, joined) in queue {
            if candidate_id == requester.session_id {
                continue;
            }
            let scored = self
                .score_candidate(
                    requester,
                    origin,
                    radius,
                    own_stats.as_ref(),
                    &candidate_id,
                    joined,
                    now,
                )
                .await;
            match scored {
                Ok(Some(candidate)) => candidates.push(candidate),
                Ok(None) => {}
                Err(e) => warn!("Skipping a matchmaking candidate: {e}"),
            }
        }

        candidates.sort_by(|a, b| b.scores.total().total_cmp(&a.scores.total()));

        let Some(best) = candidates
            .into_iter()
            .find(|c| c.distance <= radius && c.scores.total() > MIN_SCORE)
        else {
            return Ok(None);
        };

        self.finalize(&requester.session_id, &best.session.session_id)
            .await?;
        info!(
            "Matched {} with {} at {:.0}m (score {:.2})",
            requester.codename,
            best.session.codename,
            best.distance,
            best.scores.total()
        );
        Ok(Some(best.session))
    }

    #[allow(clippy::too_many_arguments, clippy::cast_possible_truncation)]
    async fn score_candidate(
        &self,
        requester: &Session,
        origin: Location,
        radius: f64,
        own_stats: Option<&SessionStats>,
        candidate_id: &str,
        joined: f64,
        now: i64,
    ) -> StoreResult<Option<Candidate>> {
        let Some(session) = self
            .store
            .get_json::<Session>(&session_key(candidate_id))
            .await?
        else {
            // session record is gone, so the queue entry is stale
            self.store
                .remove_from_sorted_set(WAIT_QUEUE, candidate_id)
                .await?;
            return Ok(None);
        };
        if !session.is_scanning() {
            return Ok(None);
        }
        let Some(location) = session.location else {
            return Ok(None);
        };

        let distance = origin.distance_to(&location);
        let their_stats = self.stats(candidate_id).await?;
        let last_match = self
            .store
            .sorted_set_score(MATCH_HISTORY, &pair_key(&requester.session_id, candidate_id))
            .await?
            .map(|at| at as i64);

        let scores = ScoreBreakdown {
            distance: distance_score(distance, radius),
            wait_time: wait_time_score(now - joined as i64),
            compatibility: compatibility_score(own_stats, their_stats.as_ref()),
            freshness: freshness_score(last_match, now),
        };
        Ok(Some(Candidate {
            session,
            distance,
            scores,
        }))
    }

    #[allow(clippy::cast_precision_loss)]
    async fn finalize(&self, a: &str, b: &str) -> StoreResult<()> {
        let now = now_millis();
        self.store.remove_from_sorted_set(WAIT_QUEUE, a).await?;
        self.store.remove_from_sorted_set(WAIT_QUEUE, b).await?;
        self.store
            .add_to_sorted_set(MATCH_HISTORY, &pair_key(a, b), now as f64)
            .await?;
        self.store
            .remove_score_range(
                MATCH_HISTORY,
                f64::NEG_INFINITY,
                (now - HISTORY_RETENTION_MS) as f64,
            )
            .await?;
        Ok(())
    }

    pub async fn remove_from_queue(&self, session_id: &str) -> StoreResult<bool> {
        self.store
            .remove_from_sorted_set(WAIT_QUEUE, session_id)
            .await
    }

    pub async fn is_queued(&self, session_id: &str) -> StoreResult<bool> {
        Ok(self
            .store
            .sorted_set_score(WAIT_QUEUE, session_id)
            .await?
            .is_some())
    }

    /// Fold a finished chat into the session's statistics.
    pub async fn update_statistics(
        &self,
        session_id: &str,
        outcome: &ChatOutcome,
    ) -> StoreResult<()> {
        let key = stats_key(session_id);
        let mut stats = self
            .store
            .get_json::<SessionStats>(&key)
            .await?
            .unwrap_or_else(|| SessionStats {
                total_sessions: 0,
                ..SessionStats::fresh(DEFAULT_RADIUS, now_millis())
            });

        stats.total_sessions += 1;
        stats.total_chat_time += outcome.chat_duration.as_secs();
        if let Some(sample) = outcome.response_time_ms {
            stats.response_time = sample;
        }
        self.store.put_json(&key, &stats, Some(STATS_TTL)).await?;
        debug!(
            "Recorded {}s of chat ({})",
            outcome.chat_duration.as_secs(),
            outcome.reason.as_str()
        );
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    pub async fn get_queue_status(&self) -> StoreResult<QueueStatus> {
        let queue = self.store.sorted_set_range(WAIT_QUEUE).await?;
        let oldest_wait_seconds = queue
            .first()
            .map_or(0, |(_, joined)| (now_millis() - *joined as i64).max(0) / 1000);
        Ok(QueueStatus {
            queue_size: queue.len(),
            oldest_wait_seconds,
            total_historical_matches: self.store.sorted_set_range(MATCH_HISTORY).await?.len(),
        })
    }

    /// Forget everything the engine holds for a departing session.
    pub async fn cleanup_user(&self, session_id: &str) -> StoreResult<()> {
        self.store
            .remove_from_sorted_set(WAIT_QUEUE, session_id)
            .await?;
        self.store.delete(&stats_key(session_id)).await?;
        Ok(())
    }
}

/// Pick uniformly at random among free sessions within the requester's
/// radius. Used when the scored path is unavailable.
pub fn proximity_fallback<R: Rng + ?Sized>(
    requester: &Session,
    pool: &[Session],
    rng: &mut R,
) -> Option<Session> {
    let origin = requester.location?;
    let radius = f64::from(requester.search_radius);
    let eligible: Vec<&Session> = pool
        .iter()
        .filter(|s| s.session_id != requester.session_id && s.is_scanning())
        .filter(|s| {
            s.location
                .is_some_and(|location| origin.distance_to(&location) <= radius)
        })
        .collect();
    if eligible.is_empty() {
        return None;
    }
    let index = rng.gen_range(0..eligible.len());
    Some(eligible[index].clone())
}
