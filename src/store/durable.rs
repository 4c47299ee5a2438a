//! redb-backed durable store.
//!
//! Every record lives in one table keyed by its store key, holding the
//! JSON-encoded [`Record`]. Each operation runs inside a single write
//! transaction, so read-modify-write operations are atomic on disk.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, Table, TableDefinition};

use super::keyspace::{self, Record, RecordMap};
use super::{now_millis, Reply, StoreBackend, StoreError, StoreOp, StoreResult};

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = Database::create(path).map_err(backend_err)?;

        // Tables must exist before the first read.
        let txn = db.begin_write().map_err(backend_err)?;
        {
            txn.open_table(RECORDS).map_err(backend_err)?;
        }
        txn.commit().map_err(backend_err)?;

        Ok(Self { db: Arc::new(db) })
    }
}

struct TableRecords<'a, 'txn> {
    table: &'a mut Table<'txn, &'static str, &'static [u8]>,
}

impl RecordMap for TableRecords<'_, '_> {
    fn load(&mut self, key: &str) -> StoreResult<Option<Record>> {
        let Some(guard) = self.table.get(key).map_err(backend_err)? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(guard.value())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(record))
    }

    fn save(&mut self, key: &str, record: Record) -> StoreResult<()> {
        let bytes =
            serde_json::to_vec(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.table
            .insert(key, bytes.as_slice())
            .map_err(backend_err)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> StoreResult<bool> {
        let removed = self.table.remove(key).map_err(backend_err)?.is_some();
        Ok(removed)
    }

    fn keys_with_prefix(&mut self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in self.table.range(prefix..).map_err(backend_err)? {
            let (key, _) = entry.map_err(backend_err)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}

#[async_trait]
impl StoreBackend for RedbBackend {
    fn name(&self) -> &'static str {
        "redb"
    }

    async fn execute(&self, op: StoreOp) -> StoreResult<Reply> {
        let txn = self.db.begin_write().map_err(backend_err)?;
        let reply = {
            let mut table = txn.open_table(RECORDS).map_err(backend_err)?;
            let mut records = TableRecords { table: &mut table };
            keyspace::apply(&mut records, op, now_millis())?
        };
        txn.commit().map_err(backend_err)?;
        Ok(reply)
    }
}
