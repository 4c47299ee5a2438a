use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::keyspace::{self, Record};
use super::{now_millis, Reply, StoreBackend, StoreOp, StoreResult};

/// Process-local backend. Every operation runs under one lock, which makes
/// each call atomic with respect to every other call.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, Record>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn execute(&self, op: StoreOp) -> StoreResult<Reply> {
        let mut records = self.records.lock().await;
        keyspace::apply(&mut *records, op, now_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sweep_clears_expired_entries() {
        let backend = MemoryBackend::new();
        backend
            .execute(StoreOp::Put {
                key: "gone".into(),
                value: "1".into(),
                ttl: Some(Duration::from_millis(1)),
            })
            .await
            .unwrap();
        backend
            .execute(StoreOp::Put {
                key: "kept".into(),
                value: "1".into(),
                ttl: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let swept = backend.execute(StoreOp::SweepExpired).await.unwrap();
        assert_eq!(swept, Reply::Count(1));
        assert_eq!(backend.len().await, 1);
    }
}
