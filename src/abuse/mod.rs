//! Abuse detection gate.
//!
//! Every tracked identity is a salted SHA-256 of the session id (or client
//! address for connection abuse); raw identities never reach the store or the
//! logs. Counters live in the [`Store`] under `abuse:*` keys with TTLs, so an
//! idle user's tracking data disappears on its own.
//!
//! [`AbuseDetector::evaluate`] never fails: any store or classifier error is
//! logged and the message is let through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::{now_millis, Store, StoreError, StoreResult};

pub mod classifier;
pub mod patterns;

pub use classifier::{ClassifierVerdict, ContentClassifier, GeminiClassifier};
pub use patterns::PatternScreen;

const RATE_WINDOW: Duration = Duration::from_secs(60);
const MESSAGES_PER_MINUTE: i64 = 20;

const BURST_WINDOW_MS: i64 = 2_000;
const BURST_RETENTION: Duration = Duration::from_secs(10);
const BURST_LIMIT: usize = 5;

const DUPLICATE_WINDOW: Duration = Duration::from_secs(300);
const DUPLICATE_LIMIT: i64 = 3;

const ACTIVITY_WINDOW: Duration = Duration::from_secs(3600);

const CONNECTION_WINDOW: Duration = Duration::from_secs(60);
const CONNECTS_PER_MINUTE: i64 = 10;
const DISCONNECTS_PER_MINUTE: i64 = 15;

const SOFT_MUTE_SECS: u64 = 30;
const SHADOW_BAN_SECS: u64 = 300;
const TEMP_BLOCK_SECS: u64 = 900;

const HISTORY_LEN: usize = 10;
const HISTORY_TTL: Duration = Duration::from_secs(24 * 3600);

const CLASSIFIER_MIN_CHARS: usize = 3;

const PENALTY: &str = "abuse:penalty:";
const SHADOW: &str = "abuse:shadow:";
const HISTORY: &str = "abuse:history:";
const RATE: &str = "abuse:rate:";
const BURST: &str = "abuse:burst:";
const DUPLICATE: &str = "abuse:dup:";
const ACTIVITY: &str = "abuse:activity:";
const CONNECTS: &str = "abuse:connect:";
const DISCONNECTS: &str = "abuse:disconnect:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Mild,
    Moderate,
    Severe,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Mild => "mild",
            Severity::Moderate => "moderate",
            Severity::Severe => "severe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyAction {
    SoftMute,
    ShadowBan,
    TempBlock,
    ContentWarning,
    /// Reported while an earlier temp block is still running.
    Block,
}

impl PenaltyAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PenaltyAction::SoftMute => "soft_mute",
            PenaltyAction::ShadowBan => "shadow_ban",
            PenaltyAction::TempBlock => "temp_block",
            PenaltyAction::ContentWarning => "content_warning",
            PenaltyAction::Block => "block",
        }
    }
}

/// Violation class. Escalation keys on this, verdicts report the finer reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    #[serde(rename = "rate_limit")]
    RateLimit,
    #[serde(rename = "burst_messaging")]
    Burst,
    #[serde(rename = "content_abuse")]
    Content,
    #[serde(rename = "spam")]
    Spam,
    #[serde(rename = "connection_abuse_connect")]
    ConnectionConnect,
    #[serde(rename = "connection_abuse_disconnect")]
    ConnectionDisconnect,
}

impl ViolationKind {
    pub fn tag(self) -> &'static str {
        match self {
            ViolationKind::RateLimit => "rate_limit",
            ViolationKind::Burst => "burst_messaging",
            ViolationKind::Content => "content_abuse",
            ViolationKind::Spam => "spam",
            ViolationKind::ConnectionConnect => "connection_abuse_connect",
            ViolationKind::ConnectionDisconnect => "connection_abuse_disconnect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub reason: &'static str,
    pub severity: Severity,
}

impl Violation {
    fn moderate(kind: ViolationKind, reason: &'static str) -> Self {
        Violation {
            kind,
            reason,
            severity: Severity::Moderate,
        }
    }
}

/// What the message being evaluated is. Only chat text gets content analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Chat,
    Typing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseVerdict {
    pub blocked: bool,
    pub muted: bool,
    pub shadow_banned: bool,
    pub action: Option<PenaltyAction>,
    pub reason: Option<&'static str>,
    pub severity: Severity,
    pub duration_secs: u64,
}

impl AbuseVerdict {
    /// Whether the message may be delivered at all. Shadow-banned messages
    /// are delivered back to their author only.
    pub fn allowed(&self) -> bool {
        !self.blocked && !self.muted
    }

    fn for_penalty(action: PenaltyAction, violation: Violation, duration_secs: u64) -> Self {
        AbuseVerdict {
            blocked: matches!(
                action,
                PenaltyAction::TempBlock | PenaltyAction::ContentWarning | PenaltyAction::Block
            ),
            muted: action == PenaltyAction::SoftMute,
            shadow_banned: action == PenaltyAction::ShadowBan,
            action: Some(action),
            reason: Some(violation.reason),
            severity: violation.severity,
            duration_secs,
        }
    }
}

/// One line of violation history. Newest first in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationEntry {
    pub timestamp: i64,
    pub severity: Severity,
    pub kind: ViolationKind,
    pub action: PenaltyAction,
    pub duration_secs: u64,
}

/// Stored under the penalty or shadow-ban key while the penalty runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActivePenalty {
    action: PenaltyAction,
    kind: ViolationKind,
    severity: Severity,
    duration_secs: u64,
    expires_at: i64,
}

impl ActivePenalty {
    fn remaining(&self, now: i64) -> Option<Duration> {
        u64::try_from(self.expires_at - now)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    fn verdict(&self) -> AbuseVerdict {
        let action = match self.action {
            PenaltyAction::SoftMute => PenaltyAction::SoftMute,
            _ => PenaltyAction::Block,
        };
        AbuseVerdict::for_penalty(
            action,
            Violation {
                kind: self.kind,
                reason: self.kind.tag(),
                severity: self.severity,
            },
            self.duration_secs,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseStats {
    pub active_penalties: usize,
    pub active_shadow_bans: usize,
    pub classifier_enabled: bool,
    pub store_backend: &'static str,
}

/// Number of moderate or severe violations that still count toward escalation.
///
/// `entries` is newest first. Anything at or before the most recent temp block
/// that has already run its course is ignored, so a served block resets the
/// ladder.
pub fn escalation_count(entries: &[ViolationEntry], now: i64) -> usize {
    let served = entries.iter().position(|e| {
        let length = i64::try_from(e.duration_secs).unwrap_or(i64::MAX / 1000) * 1000;
        e.action == PenaltyAction::TempBlock && e.timestamp.saturating_add(length) <= now
    });
    let counted = match served {
        Some(index) => &entries[..index],
        None => entries,
    };
    counted
        .iter()
        .filter(|e| matches!(e.severity, Severity::Moderate | Severity::Severe))
        .count()
}

fn decide(violation: Violation, prior: usize) -> (PenaltyAction, u64) {
    match violation.severity {
        Severity::None | Severity::Mild => (PenaltyAction::SoftMute, SOFT_MUTE_SECS),
        Severity::Moderate if violation.kind == ViolationKind::Content => match prior {
            0 => (PenaltyAction::ContentWarning, 0),
            1 => (PenaltyAction::ShadowBan, SHADOW_BAN_SECS),
            _ => (PenaltyAction::TempBlock, TEMP_BLOCK_SECS),
        },
        Severity::Moderate => (PenaltyAction::ShadowBan, SHADOW_BAN_SECS),
        Severity::Severe => (PenaltyAction::TempBlock, TEMP_BLOCK_SECS),
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(8)]
}

fn message_hash(message: &str) -> String {
    let digest = Sha256::digest(message.trim().to_lowercase().as_bytes());
    format!("{digest:x}")[..16].to_string()
}

pub struct AbuseDetector {
    store: Arc<Store>,
    classifier: Option<Arc<dyn ContentClassifier>>,
    patterns: PatternScreen,
    salt: String,
    burst_seq: AtomicU64,
}

impl AbuseDetector {
    pub fn new(
        store: Arc<Store>,
        classifier: Option<Arc<dyn ContentClassifier>>,
        salt: impl Into<String>,
    ) -> Self {
        if classifier.is_none() {
            warn!("No content classifier configured; only pattern moderation is active");
        }
        AbuseDetector {
            store,
            classifier,
            patterns: PatternScreen::new(),
            salt: salt.into(),
            burst_seq: AtomicU64::new(0),
        }
    }

    /// Salted one-way hash used as the tracking key.
    pub fn anonymize(&self, identity: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        hasher.update(self.salt.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn evaluate(
        &self,
        session_id: &str,
        message: &str,
        connection_id: &str,
        kind: MessageKind,
    ) -> AbuseVerdict {
        let user = self.anonymize(session_id);
        let mut shadow_banned = false;
        match self.screen(&user, message, kind, &mut shadow_banned).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(
                    "Abuse check for {} on {connection_id} failed, letting message through: {e}",
                    short(&user)
                );
                AbuseVerdict {
                    shadow_banned,
                    ..AbuseVerdict::default()
                }
            }
        }
    }

    async fn screen(
        &self,
        user: &str,
        message: &str,
        kind: MessageKind,
        shadow_banned: &mut bool,
    ) -> StoreResult<AbuseVerdict> {
        if let Some(penalty) = self
            .store
            .get_json::<ActivePenalty>(&format!("{PENALTY}{user}"))
            .await?
        {
            debug!("{} is under an active {}", short(user), penalty.action.as_str());
            return Ok(penalty.verdict());
        }
        *shadow_banned = self.store.get(&format!("{SHADOW}{user}")).await?.is_some();

        match self.detect(user, message, kind).await? {
            Some(violation) => {
                let mut verdict = self.apply_penalty(user, violation).await?;
                verdict.shadow_banned |= *shadow_banned;
                Ok(verdict)
            }
            None => {
                let activity = format!("{ACTIVITY}{user}");
                self.store.increment(&activity, ACTIVITY_WINDOW).await?;
                self.store.expire(&activity, ACTIVITY_WINDOW).await?;
                Ok(AbuseVerdict {
                    shadow_banned: *shadow_banned,
                    ..AbuseVerdict::default()
                })
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    async fn detect(
        &self,
        user: &str,
        message: &str,
        kind: MessageKind,
    ) -> StoreResult<Option<Violation>> {
        let sent = self
            .store
            .increment(&format!("{RATE}{user}"), RATE_WINDOW)
            .await?;
        if sent > MESSAGES_PER_MINUTE {
            return Ok(Some(Violation::moderate(
                ViolationKind::RateLimit,
                "rate_limit_exceeded",
            )));
        }

        let now = now_millis();
        let burst = format!("{BURST}{user}");
        let seq = self.burst_seq.fetch_add(1, Ordering::Relaxed);
        self.store
            .add_to_sorted_set(&burst, &format!("{now}:{seq}"), now as f64)
            .await?;
        self.store.expire(&burst, BURST_RETENTION).await?;
        self.store
            .remove_score_range(&burst, f64::NEG_INFINITY, (now - 10_000) as f64)
            .await?;
        let recent = self
            .store
            .count_in_score_range(&burst, (now - BURST_WINDOW_MS) as f64, f64::INFINITY)
            .await?;
        if recent > BURST_LIMIT {
            return Ok(Some(Violation::moderate(
                ViolationKind::Burst,
                "burst_messaging",
            )));
        }

        if kind != MessageKind::Chat || message.trim().is_empty() {
            return Ok(None);
        }

        if let Some(violation) = self.analyze_content(message).await {
            return Ok(Some(violation));
        }

        let duplicate = format!("{DUPLICATE}{user}:{}", message_hash(message));
        let repeats = self.store.increment(&duplicate, DUPLICATE_WINDOW).await?;
        self.store.expire(&duplicate, DUPLICATE_WINDOW).await?;
        if repeats > DUPLICATE_LIMIT {
            return Ok(Some(Violation::moderate(ViolationKind::Spam, "duplicate_spam")));
        }

        Ok(None)
    }

    async fn analyze_content(&self, message: &str) -> Option<Violation> {
        if let Some(hit) = self.patterns.check(message) {
            return Some(Violation {
                kind: ViolationKind::Content,
                reason: hit.reason,
                severity: hit.severity,
            });
        }

        let classifier = self.classifier.as_ref()?;
        if message.chars().count() <= CLASSIFIER_MIN_CHARS {
            return None;
        }
        match classifier.classify(message).await {
            Ok(ClassifierVerdict::Safe) => None,
            Ok(ClassifierVerdict::Block) => Some(Violation::moderate(
                ViolationKind::Content,
                "inappropriate_content",
            )),
            Ok(ClassifierVerdict::Unrecognized) => Some(Violation::moderate(
                ViolationKind::Content,
                "content_flagged",
            )),
            Err(e) => {
                warn!("Content classifier unavailable, skipping it: {e}");
                None
            }
        }
    }

    async fn history(&self, user: &str) -> StoreResult<Vec<ViolationEntry>> {
        let raw = self.store.list(&format!("{HISTORY}{user}")).await?;
        Ok(raw
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Pick, persist and record the penalty for `violation` by the tracked
    /// identity `user` (already anonymized).
    pub async fn apply_penalty(
        &self,
        user: &str,
        violation: Violation,
    ) -> StoreResult<AbuseVerdict> {
        let now = now_millis();
        let prior = escalation_count(&self.history(user).await?, now);
        let (action, duration_secs) = decide(violation, prior);

        let ttl = Duration::from_secs(duration_secs);
        let active = ActivePenalty {
            action,
            kind: violation.kind,
            severity: violation.severity,
            duration_secs,
            expires_at: now + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2),
        };
        match action {
            PenaltyAction::ContentWarning => {}
            PenaltyAction::ShadowBan => {
                self.store
                    .put_json(&format!("{SHADOW}{user}"), &active, Some(ttl))
                    .await?;
            }
            _ => {
                self.store
                    .put_json(&format!("{PENALTY}{user}"), &active, Some(ttl))
                    .await?;
            }
        }

        let entry = ViolationEntry {
            timestamp: now,
            severity: violation.severity,
            kind: violation.kind,
            action,
            duration_secs,
        };
        let line = serde_json::to_string(&entry)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store
            .push_capped(&format!("{HISTORY}{user}"), &line, HISTORY_LEN, HISTORY_TTL)
            .await?;

        info!(
            "Applied {} to {} for {} ({duration_secs}s)",
            action.as_str(),
            short(user),
            violation.reason
        );
        Ok(AbuseVerdict::for_penalty(action, violation, duration_secs))
    }

    /// Count a connect or disconnect from `address`, penalizing the address
    /// when it churns too fast. Returns the penalty if one was applied.
    pub async fn track_connection(
        &self,
        address: &str,
        event: ConnectionEvent,
    ) -> Option<AbuseVerdict> {
        match self.count_connection(address, event).await {
            Ok(penalty) => penalty,
            Err(e) => {
                warn!("Connection tracking failed: {e}");
                None
            }
        }
    }

    async fn count_connection(
        &self,
        address: &str,
        event: ConnectionEvent,
    ) -> StoreResult<Option<AbuseVerdict>> {
        let tracked = self.anonymize(address);
        let (prefix, limit, kind) = match event {
            ConnectionEvent::Connect => {
                (CONNECTS, CONNECTS_PER_MINUTE, ViolationKind::ConnectionConnect)
            }
            ConnectionEvent::Disconnect => (
                DISCONNECTS,
                DISCONNECTS_PER_MINUTE,
                ViolationKind::ConnectionDisconnect,
            ),
        };

        let count = self
            .store
            .increment(&format!("{prefix}{tracked}"), CONNECTION_WINDOW)
            .await?;
        if count <= limit {
            return Ok(None);
        }
        info!("Connection churn from {}", short(&tracked));
        self.apply_penalty(&tracked, Violation::moderate(kind, kind.tag()))
            .await
            .map(Some)
    }

    /// Copy running penalties from a client address onto a fresh session.
    pub async fn carry_connection_penalties(&self, address: &str, session_id: &str) {
        let from = self.anonymize(address);
        let to = self.anonymize(session_id);
        for prefix in [PENALTY, SHADOW] {
            if let Err(e) = self.copy_penalty(prefix, &from, &to).await {
                warn!("Could not carry penalty to {}: {e}", short(&to));
            }
        }
    }

    async fn copy_penalty(&self, prefix: &str, from: &str, to: &str) -> StoreResult<()> {
        let Some(active) = self
            .store
            .get_json::<ActivePenalty>(&format!("{prefix}{from}"))
            .await?
        else {
            return Ok(());
        };
        if let Some(remaining) = active.remaining(now_millis()) {
            self.store
                .put_json(&format!("{prefix}{to}"), &active, Some(remaining))
                .await?;
            debug!("Carried {} over to {}", active.action.as_str(), short(to));
        }
        Ok(())
    }

    /// Drop a session's counters. Penalties and history run out on their own.
    pub async fn cleanup_user(&self, session_id: &str) -> StoreResult<()> {
        let user = self.anonymize(session_id);
        for prefix in [RATE, BURST, ACTIVITY] {
            self.store.delete(&format!("{prefix}{user}")).await?;
        }
        self.store
            .delete_prefix(&format!("{DUPLICATE}{user}:"))
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> StoreResult<AbuseStats> {
        Ok(AbuseStats {
            active_penalties: self.store.count_prefix(PENALTY).await?,
            active_shadow_bans: self.store.count_prefix(SHADOW).await?,
            classifier_enabled: self.classifier.is_some(),
            store_backend: self.store.backend_name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::classifier::ClassifierError;
    use crate::store::testing::unreachable_store;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    enum FakeClassifier {
        Answer(ClassifierVerdict),
        Down,
    }

    struct CountingClassifier {
        inner: FakeClassifier,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentClassifier for CountingClassifier {
        async fn classify(&self, _message: &str) -> Result<ClassifierVerdict, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.inner {
                FakeClassifier::Answer(verdict) => Ok(verdict),
                FakeClassifier::Down => Err(ClassifierError::EmptyResponse),
            }
        }
    }

    fn detector() -> AbuseDetector {
        AbuseDetector::new(Arc::new(Store::in_memory()), None, "test_salt")
    }

    fn with_classifier(inner: FakeClassifier) -> (AbuseDetector, Arc<CountingClassifier>) {
        let classifier = Arc::new(CountingClassifier {
            inner,
            calls: AtomicUsize::new(0),
        });
        let detector = AbuseDetector::new(
            Arc::new(Store::in_memory()),
            Some(classifier.clone() as Arc<dyn ContentClassifier>),
            "test_salt",
        );
        (detector, classifier)
    }

    async fn chat(detector: &AbuseDetector, session: &str, message: &str) -> AbuseVerdict {
        detector
            .evaluate(session, message, "conn-1", MessageKind::Chat)
            .await
    }

    #[test]
    fn anonymized_ids_are_salted_hex() {
        let a = AbuseDetector::new(Arc::new(Store::in_memory()), None, "one");
        let b = AbuseDetector::new(Arc::new(Store::in_memory()), None, "two");
        let hash = a.anonymize("session-1");
        assert_eq!(hash.len(), 64);
        assert!(!hash.contains("session"));
        assert_ne!(hash, b.anonymize("session-1"));
        assert_eq!(hash, a.anonymize("session-1"));
    }

    #[tokio::test]
    async fn clean_message_is_allowed() {
        let verdict = chat(&detector(), "s1", "hey, anyone around the park?").await;
        assert!(verdict.allowed());
        assert_eq!(verdict, AbuseVerdict::default());
    }

    #[tokio::test]
    async fn twenty_first_message_trips_rate_limit() {
        let detector = detector();
        let mut verdicts = Vec::new();
        for i in 1..=21 {
            verdicts.push(chat(&detector, "s1", &format!("message number {i}")).await);
        }

        assert!(verdicts[..5].iter().all(|v| *v == AbuseVerdict::default()));
        assert_eq!(verdicts[5].reason, Some("burst_messaging"));

        let last = &verdicts[20];
        assert_eq!(last.reason, Some("rate_limit_exceeded"));
        assert_eq!(last.severity, Severity::Moderate);
    }

    #[tokio::test]
    async fn fails_open_when_store_is_down() {
        let detector = AbuseDetector::new(Arc::new(unreachable_store()), None, "salt");
        for message in ["hello", "what the fuck", "HELLO EVERYBODY"] {
            let verdict = chat(&detector, "s1", message).await;
            assert!(verdict.allowed());
            assert!(!verdict.shadow_banned);
        }
        assert!(detector.stats().await.is_err());
        assert!(detector.cleanup_user("s1").await.is_err());
        assert_eq!(
            detector
                .track_connection("10.0.0.1", ConnectionEvent::Connect)
                .await,
            None
        );
    }

    #[tokio::test]
    async fn content_violations_escalate() {
        let detector = detector();

        let first = chat(&detector, "s1", "what the fuck").await;
        assert_eq!(first.action, Some(PenaltyAction::ContentWarning));
        assert_eq!(first.reason, Some("profanity_detected"));
        assert!(first.blocked);

        let second = chat(&detector, "s1", "what the fuck").await;
        assert_eq!(second.action, Some(PenaltyAction::ShadowBan));
        assert!(second.allowed());
        assert!(second.shadow_banned);

        let third = chat(&detector, "s1", "what the fuck").await;
        assert_eq!(third.action, Some(PenaltyAction::TempBlock));
        assert_eq!(third.duration_secs, TEMP_BLOCK_SECS);
        assert!(third.blocked);

        let after = chat(&detector, "s1", "sorry").await;
        assert_eq!(after.action, Some(PenaltyAction::Block));
        assert!(after.blocked);
    }

    #[tokio::test]
    async fn apply_penalty_follows_decision_table() {
        let detector = detector();
        let user = detector.anonymize("s1");
        let content = Violation::moderate(ViolationKind::Content, "profanity_detected");

        let mut actions = Vec::new();
        for _ in 0..3 {
            actions.push(detector.apply_penalty(&user, content).await.unwrap().action);
        }
        assert_eq!(
            actions,
            vec![
                Some(PenaltyAction::ContentWarning),
                Some(PenaltyAction::ShadowBan),
                Some(PenaltyAction::TempBlock)
            ]
        );

        let other = detector.anonymize("s2");
        let burst = detector
            .apply_penalty(&other, Violation::moderate(ViolationKind::Burst, "burst_messaging"))
            .await
            .unwrap();
        assert_eq!(burst.action, Some(PenaltyAction::ShadowBan));
        assert_eq!(burst.duration_secs, SHADOW_BAN_SECS);

        let severe = detector
            .apply_penalty(
                &other,
                Violation {
                    kind: ViolationKind::Spam,
                    reason: "duplicate_spam",
                    severity: Severity::Severe,
                },
            )
            .await
            .unwrap();
        assert_eq!(severe.action, Some(PenaltyAction::TempBlock));
    }

    fn entry(timestamp: i64, action: PenaltyAction, duration_secs: u64) -> ViolationEntry {
        ViolationEntry {
            timestamp,
            severity: Severity::Moderate,
            kind: ViolationKind::Content,
            action,
            duration_secs,
        }
    }

    #[test]
    fn served_block_resets_escalation() {
        let now = 10_000_000;
        let served = vec![
            entry(now - 2_000_000, PenaltyAction::TempBlock, TEMP_BLOCK_SECS),
            entry(now - 2_100_000, PenaltyAction::ShadowBan, SHADOW_BAN_SECS),
            entry(now - 2_200_000, PenaltyAction::ContentWarning, 0),
        ];
        assert_eq!(escalation_count(&served, now), 0);

        let running = vec![
            entry(now - 1_000, PenaltyAction::TempBlock, TEMP_BLOCK_SECS),
            entry(now - 2_000, PenaltyAction::ShadowBan, SHADOW_BAN_SECS),
        ];
        assert_eq!(escalation_count(&running, now), 2);

        let mut after_reset = vec![entry(now - 500, PenaltyAction::ContentWarning, 0)];
        after_reset.extend(served);
        assert_eq!(escalation_count(&after_reset, now), 1);
    }

    #[test]
    fn mild_entries_do_not_escalate() {
        let mut mild = entry(0, PenaltyAction::SoftMute, SOFT_MUTE_SECS);
        mild.severity = Severity::Mild;
        assert_eq!(escalation_count(&[mild.clone(), mild], 1_000), 0);
    }

    #[tokio::test]
    async fn shouting_soft_mutes() {
        let detector = detector();
        let verdict = chat(&detector, "s1", "HELLO EVERYBODY").await;
        assert!(verdict.muted);
        assert_eq!(verdict.action, Some(PenaltyAction::SoftMute));
        assert_eq!(verdict.duration_secs, SOFT_MUTE_SECS);

        let next = chat(&detector, "s1", "hi").await;
        assert!(next.muted);
        assert!(!next.blocked);
    }

    #[tokio::test]
    async fn repeated_message_is_spam() {
        let detector = detector();
        for _ in 0..3 {
            assert!(chat(&detector, "s1", "anyone here?").await.allowed());
        }
        let fourth = chat(&detector, "s1", "  Anyone here?").await;
        assert_eq!(fourth.reason, Some("duplicate_spam"));
        assert_eq!(fourth.action, Some(PenaltyAction::ShadowBan));
    }

    #[tokio::test]
    async fn classifier_verdicts_map_to_content_violations() {
        let (detector, _) = with_classifier(FakeClassifier::Answer(ClassifierVerdict::Block));
        let verdict = chat(&detector, "s1", "meet me behind the station").await;
        assert_eq!(verdict.reason, Some("inappropriate_content"));
        assert_eq!(verdict.action, Some(PenaltyAction::ContentWarning));

        let (detector, _) =
            with_classifier(FakeClassifier::Answer(ClassifierVerdict::Unrecognized));
        let verdict = chat(&detector, "s1", "meet me behind the station").await;
        assert_eq!(verdict.reason, Some("content_flagged"));
        assert!(verdict.blocked);
    }

    #[tokio::test]
    async fn classifier_is_skipped_for_short_or_pattern_hits() {
        let (detector, classifier) =
            with_classifier(FakeClassifier::Answer(ClassifierVerdict::Safe));
        chat(&detector, "s1", "hey").await;
        chat(&detector, "s2", "stfu").await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);

        chat(&detector, "s3", "how is everyone").await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn classifier_outage_fails_open() {
        let (detector, classifier) = with_classifier(FakeClassifier::Down);
        let verdict = chat(&detector, "s1", "how is everyone").await;
        assert!(verdict.allowed());
        assert_eq!(verdict.action, None);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn typing_skips_content_analysis() {
        let detector = detector();
        let verdict = detector
            .evaluate("s1", "what the fuck", "conn-1", MessageKind::Typing)
            .await;
        assert!(verdict.allowed());
    }

    #[tokio::test]
    async fn connection_churn_penalty_follows_new_sessions() {
        let detector = detector();
        for _ in 0..CONNECTS_PER_MINUTE {
            assert_eq!(
                detector
                    .track_connection("10.0.0.7", ConnectionEvent::Connect)
                    .await,
                None
            );
        }
        let penalty = detector
            .track_connection("10.0.0.7", ConnectionEvent::Connect)
            .await
            .unwrap();
        assert_eq!(penalty.action, Some(PenaltyAction::ShadowBan));
        assert_eq!(penalty.reason, Some("connection_abuse_connect"));

        detector
            .carry_connection_penalties("10.0.0.7", "fresh-session")
            .await;
        let verdict = chat(&detector, "fresh-session", "hello there").await;
        assert!(verdict.allowed());
        assert!(verdict.shadow_banned);

        detector
            .carry_connection_penalties("10.0.0.8", "other-session")
            .await;
        assert!(!chat(&detector, "other-session", "hello there").await.shadow_banned);
    }

    #[tokio::test]
    async fn cleanup_keeps_penalties() {
        let detector = detector();
        chat(&detector, "s1", "HELLO EVERYBODY").await;
        chat(&detector, "s2", "hello").await;
        detector.cleanup_user("s1").await.unwrap();

        let user = detector.anonymize("s1");
        let store = &detector.store;
        assert_eq!(store.get(&format!("{RATE}{user}")).await.unwrap(), None);
        assert_eq!(store.count_prefix(&format!("{DUPLICATE}{user}:")).await.unwrap(), 0);
        assert!(chat(&detector, "s1", "hi").await.muted);

        let other = detector.anonymize("s2");
        assert!(store.get(&format!("{RATE}{other}")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_count_active_penalties() {
        let detector = detector();
        chat(&detector, "s1", "HELLO EVERYBODY").await;
        let user = detector.anonymize("s2");
        detector
            .apply_penalty(&user, Violation::moderate(ViolationKind::Burst, "burst_messaging"))
            .await
            .unwrap();

        let stats = detector.stats().await.unwrap();
        assert_eq!(stats.active_penalties, 1);
        assert_eq!(stats.active_shadow_bans, 1);
        assert!(!stats.classifier_enabled);
        assert_eq!(stats.store_backend, "memory");
    }
}
