//! Geo/KV store adapter.
//!
//! [`Store`] is the only storage handle the rest of the server sees. It fronts
//! an optional durable primary backend and an in-memory fallback. Both
//! backends share one implementation of the operation semantics
//! ([`keyspace::apply`]), so switching between them changes durability, not
//! behavior. The first infrastructure error from the primary demotes the
//! adapter to the fallback for the rest of the process lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::geo::Location;

pub mod durable;
pub mod keyspace;
pub mod memory;

pub use durable::RedbBackend;
pub use memory::MemoryBackend;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("serialization failure: {0}")]
    Serialization(String),
    #[error("key {0:?} holds a value of another type")]
    WrongType(String),
    #[error("backend returned an unexpected reply for {0}")]
    UnexpectedReply(&'static str),
}

impl StoreError {
    /// Errors that say the backend itself is unhealthy.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, StoreError::Backend(_) | StoreError::Serialization(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One store operation. Backends execute these; [`Store`] builds them.
#[derive(Debug, Clone)]
pub enum StoreOp {
    Put { key: String, value: String, ttl: Option<Duration> },
    Get { key: String },
    Delete { key: String },
    DeletePrefix { prefix: String },
    CountPrefix { prefix: String },
    ValuesWithPrefix { prefix: String },
    Expire { key: String, ttl: Duration },
    Increment { key: String, ttl_on_create: Duration },
    AddToSortedSet { set: String, member: String, score: f64 },
    SortedSetScore { set: String, member: String },
    SortedSetRange { set: String },
    CountInScoreRange { set: String, lo: f64, hi: f64 },
    RemoveFromSortedSet { set: String, member: String },
    RemoveScoreRange { set: String, lo: f64, hi: f64 },
    PushCapped { key: String, value: String, max_len: usize, ttl: Duration },
    List { key: String },
    GeoIndex { set: String, member: String, location: Location },
    GeoQuery { set: String, center: Location, radius_m: f64 },
    GeoRemove { set: String, member: String },
    SweepExpired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Unit,
    Value(Option<String>),
    Flag(bool),
    Count(usize),
    Int(i64),
    Score(Option<f64>),
    Scored(Vec<(String, f64)>),
    Items(Vec<String>),
}

impl Reply {
    fn unit(self) -> StoreResult<()> {
        match self {
            Reply::Unit => Ok(()),
            _ => Err(StoreError::UnexpectedReply("unit")),
        }
    }

    fn value(self) -> StoreResult<Option<String>> {
        match self {
            Reply::Value(v) => Ok(v),
            _ => Err(StoreError::UnexpectedReply("value")),
        }
    }

    fn flag(self) -> StoreResult<bool> {
        match self {
            Reply::Flag(f) => Ok(f),
            _ => Err(StoreError::UnexpectedReply("flag")),
        }
    }

    fn count(self) -> StoreResult<usize> {
        match self {
            Reply::Count(n) => Ok(n),
            _ => Err(StoreError::UnexpectedReply("count")),
        }
    }

    fn int(self) -> StoreResult<i64> {
        match self {
            Reply::Int(n) => Ok(n),
            _ => Err(StoreError::UnexpectedReply("int")),
        }
    }

    fn score(self) -> StoreResult<Option<f64>> {
        match self {
            Reply::Score(s) => Ok(s),
            _ => Err(StoreError::UnexpectedReply("score")),
        }
    }

    fn scored(self) -> StoreResult<Vec<(String, f64)>> {
        match self {
            Reply::Scored(items) => Ok(items),
            _ => Err(StoreError::UnexpectedReply("scored")),
        }
    }

    fn items(self) -> StoreResult<Vec<String>> {
        match self {
            Reply::Items(items) => Ok(items),
            _ => Err(StoreError::UnexpectedReply("items")),
        }
    }
}

/// A storage engine able to execute every [`StoreOp`].
#[async_trait]
pub trait StoreBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, op: StoreOp) -> StoreResult<Reply>;
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct Store {
    primary: Option<Arc<dyn StoreBackend>>,
    fallback: Arc<dyn StoreBackend>,
    demoted: AtomicBool,
}

impl Store {
    pub fn in_memory() -> Self {
        Self::from_backends(None, Arc::new(MemoryBackend::new()))
    }

    pub fn with_primary(primary: Arc<dyn StoreBackend>) -> Self {
        Self::from_backends(Some(primary), Arc::new(MemoryBackend::new()))
    }

    pub fn from_backends(
        primary: Option<Arc<dyn StoreBackend>>,
        fallback: Arc<dyn StoreBackend>,
    ) -> Self {
        Store {
            primary,
            fallback,
            demoted: AtomicBool::new(false),
        }
    }

    pub fn is_demoted(&self) -> bool {
        self.primary.is_none() || self.demoted.load(Ordering::SeqCst)
    }

    /// Switch to the fallback for good. Returns `true` for the call that flipped it.
    pub fn demote(&self) -> bool {
        !self.demoted.swap(true, Ordering::SeqCst)
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.primary {
            Some(primary) if !self.is_demoted() => primary.name(),
            _ => self.fallback.name(),
        }
    }

    async fn run(&self, op: StoreOp) -> StoreResult<Reply> {
        if let Some(primary) = self.primary.as_ref().filter(|_| !self.is_demoted()) {
            match primary.execute(op.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_backend_failure() => {
                    if self.demote() {
                        warn!(
                            "{} store failed ({e}); using {} store for the rest of this process",
                            primary.name(),
                            self.fallback.name()
                        );
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.fallback.execute(op).await
    }

    pub async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.run(StoreOp::Put {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        })
        .await?
        .unit()
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.run(StoreOp::Get { key: key.to_string() }).await?.value()
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let json =
            serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.put(key, &json, ttl).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.get(key).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.run(StoreOp::Delete { key: key.to_string() }).await?.flag()
    }

    pub async fn delete_prefix(&self, prefix: &str) -> StoreResult<usize> {
        self.run(StoreOp::DeletePrefix {
            prefix: prefix.to_string(),
        })
        .await?
        .count()
    }

    pub async fn count_prefix(&self, prefix: &str) -> StoreResult<usize> {
        self.run(StoreOp::CountPrefix {
            prefix: prefix.to_string(),
        })
        .await?
        .count()
    }

    /// Text values of every live key under `prefix`, in no particular order.
    pub async fn values_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.run(StoreOp::ValuesWithPrefix {
            prefix: prefix.to_string(),
        })
        .await?
        .items()
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.run(StoreOp::Expire {
            key: key.to_string(),
            ttl,
        })
        .await?
        .flag()
    }

    /// Increment a counter. A fresh counter starts at 1 and expires after
    /// `ttl_on_create`; later increments keep the original deadline.
    pub async fn increment(&self, key: &str, ttl_on_create: Duration) -> StoreResult<i64> {
        self.run(StoreOp::Increment {
            key: key.to_string(),
            ttl_on_create,
        })
        .await?
        .int()
    }

    pub async fn add_to_sorted_set(&self, set: &str, member: &str, score: f64) -> StoreResult<()> {
        self.run(StoreOp::AddToSortedSet {
            set: set.to_string(),
            member: member.to_string(),
            score,
        })
        .await?
        .unit()
    }

    pub async fn sorted_set_score(&self, set: &str, member: &str) -> StoreResult<Option<f64>> {
        self.run(StoreOp::SortedSetScore {
            set: set.to_string(),
            member: member.to_string(),
        })
        .await?
        .score()
    }

    /// All members, ascending by score.
    pub async fn sorted_set_range(&self, set: &str) -> StoreResult<Vec<(String, f64)>> {
        self.run(StoreOp::SortedSetRange { set: set.to_string() })
            .await?
            .scored()
    }

    pub async fn count_in_score_range(&self, set: &str, lo: f64, hi: f64) -> StoreResult<usize> {
        self.run(StoreOp::CountInScoreRange {
            set: set.to_string(),
            lo,
            hi,
        })
        .await?
        .count()
    }

    pub async fn remove_from_sorted_set(&self, set: &str, member: &str) -> StoreResult<bool> {
        self.run(StoreOp::RemoveFromSortedSet {
            set: set.to_string(),
            member: member.to_string(),
        })
        .await?
        .flag()
    }

    pub async fn remove_score_range(&self, set: &str, lo: f64, hi: f64) -> StoreResult<usize> {
        self.run(StoreOp::RemoveScoreRange {
            set: set.to_string(),
            lo,
            hi,
        })
        .await?
        .count()
    }

    /// Prepend to a list, keep the newest `max_len` items and refresh its TTL.
    pub async fn push_capped(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.run(StoreOp::PushCapped {
            key: key.to_string(),
            value: value.to_string(),
            max_len,
            ttl,
        })
        .await?
        .unit()
    }

    pub async fn list(&self, key: &str) -> StoreResult<Vec<String>> {
        self.run(StoreOp::List { key: key.to_string() }).await?.items()
    }

    pub async fn geo_index(&self, set: &str, member: &str, location: Location) -> StoreResult<()> {
        self.run(StoreOp::GeoIndex {
            set: set.to_string(),
            member: member.to_string(),
            location,
        })
        .await?
        .unit()
    }

    /// Members within `radius_m` of `center`, nearest first, with distances in meters.
    pub async fn geo_query(
        &self,
        set: &str,
        center: Location,
        radius_m: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.run(StoreOp::GeoQuery {
            set: set.to_string(),
            center,
            radius_m,
        })
        .await?
        .scored()
    }

    pub async fn geo_remove(&self, set: &str, member: &str) -> StoreResult<bool> {
        self.run(StoreOp::GeoRemove {
            set: set.to_string(),
            member: member.to_string(),
        })
        .await?
        .flag()
    }

    pub async fn sweep_expired(&self) -> StoreResult<usize> {
        self.run(StoreOp::SweepExpired).await?.count()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                match store.sweep_expired().await {
                    Ok(0) => {}
                    Ok(n) => debug!("Swept {n} expired records"),
                    Err(e) => warn!("Expiry sweep failed: {e}"),
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Backend that fails every call.
    #[derive(Default)]
    pub struct FailingBackend {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl StoreBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn execute(&self, _op: StoreOp) -> StoreResult<Reply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Backend("connection refused".into()))
        }
    }

    /// A store where the primary and the fallback are both down.
    pub fn unreachable_store() -> Store {
        Store::from_backends(
            Some(Arc::new(FailingBackend::default())),
            Arc::new(FailingBackend::default()),
        )
    }

    /// Memory backend that fails every operation on keys under `prefix`.
    pub struct PartlyFailingBackend {
        prefix: &'static str,
        inner: MemoryBackend,
    }

    fn target(op: &StoreOp) -> Option<&str> {
        match op {
            StoreOp::Put { key, .. }
            | StoreOp::Get { key }
            | StoreOp::Delete { key }
            | StoreOp::Expire { key, .. }
            | StoreOp::Increment { key, .. }
            | StoreOp::PushCapped { key, .. }
            | StoreOp::List { key } => Some(key.as_str()),
            StoreOp::DeletePrefix { prefix }
            | StoreOp::CountPrefix { prefix }
            | StoreOp::ValuesWithPrefix { prefix } => Some(prefix.as_str()),
            StoreOp::AddToSortedSet { set, .. }
            | StoreOp::SortedSetScore { set, .. }
            | StoreOp::SortedSetRange { set }
            | StoreOp::CountInScoreRange { set, .. }
            | StoreOp::RemoveFromSortedSet { set, .. }
            | StoreOp::RemoveScoreRange { set, .. }
            | StoreOp::GeoIndex { set, .. }
            | StoreOp::GeoQuery { set, .. }
            | StoreOp::GeoRemove { set, .. } => Some(set.as_str()),
            StoreOp::SweepExpired => None,
        }
    }

    #[async_trait]
    impl StoreBackend for PartlyFailingBackend {
        fn name(&self) -> &'static str {
            "partly-failing"
        }

        async fn execute(&self, op: StoreOp) -> StoreResult<Reply> {
            if target(&op).is_some_and(|key| key.starts_with(self.prefix)) {
                return Err(StoreError::Backend("connection refused".into()));
            }
            self.inner.execute(op).await
        }
    }

    /// A memory-only store whose keys under `prefix` are unreachable.
    pub fn store_failing_under(prefix: &'static str) -> Store {
        Store::from_backends(
            None,
            Arc::new(PartlyFailingBackend {
                prefix,
                inner: MemoryBackend::new(),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FailingBackend;
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn demotes_once_and_never_retries_primary() {
        let primary = Arc::new(FailingBackend {
            calls: AtomicUsize::new(0),
        });
        let store = Store::with_primary(primary.clone());
        assert!(!store.is_demoted());
        assert_eq!(store.backend_name(), "failing");

        store.put("k", "v", None).await.unwrap();
        assert!(store.is_demoted());
        assert_eq!(store.backend_name(), "memory");
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store.increment("c", Duration::from_secs(60)).await.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memory_only_store_reports_demoted() {
        let store = Store::in_memory();
        assert!(store.is_demoted());
        assert_eq!(store.backend_name(), "memory");
    }

    #[tokio::test]
    async fn json_round_trip_through_adapter() {
        let store = Store::in_memory();
        store
            .put_json("loc", &Location::new(1.0, 2.0), None)
            .await
            .unwrap();
        let loc: Option<Location> = store.get_json("loc").await.unwrap();
        assert_eq!(loc, Some(Location::new(1.0, 2.0)));
    }

    #[tokio::test]
    async fn wrong_type_does_not_demote() {
        let store = Store::with_primary(Arc::new(MemoryBackend::new()));
        store.put("text", "x", None).await.unwrap();
        let err = store.increment("text", Duration::from_secs(1)).await;
        assert!(matches!(err, Err(StoreError::WrongType(_))));
        assert!(!store.is_demoted());
    }
}
