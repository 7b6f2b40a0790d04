//! In-memory [`Database`] backend.
//!
//! Backs the engine unit tests and doubles as a reference for the SQL
//! adapters' grouping and ranking semantics. Only the LSH operations and
//! the transaction state machine are implemented; everything else is
//! declined with `Unsupported`.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Result, StoreError};
use crate::minhash::BandKey;
use crate::models::{
    DatabaseSchema, LshMatch, SignatureRow, SqlOutcome, SqlValue, VectorFilter, VectorMatch,
};
use crate::store::Database;

#[derive(Debug, Clone)]
struct StoredRow {
    row: SignatureRow,
    created_at: i64,
}

/// In-memory LSH store. No real transactions; `begin`/`commit`/`rollback`
/// only enforce the state machine so engine tests can exercise error
/// paths.
#[derive(Default)]
pub struct MemoryBackend {
    rows: Mutex<Vec<StoredRow>>,
    clock: AtomicI64,
    in_transaction: Mutex<bool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored band rows; used by batching tests.
    pub fn row_count(&self) -> usize {
        match self.rows.lock() {
            Ok(rows) => rows.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[async_trait]
impl Database for MemoryBackend {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn execute_sql(&self, _query: &str, _params: &[SqlValue]) -> Result<SqlOutcome> {
        Err(StoreError::unsupported("memory", "execute_sql"))
    }

    async fn schema(&self) -> Result<DatabaseSchema> {
        Ok(DatabaseSchema::default())
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut in_tx = self
            .in_transaction
            .lock()
            .map_err(|e| StoreError::TransactionState(e.to_string()))?;
        if *in_tx {
            return Err(StoreError::TransactionState(
                "transaction already in progress".into(),
            ));
        }
        *in_tx = true;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut in_tx = self
            .in_transaction
            .lock()
            .map_err(|e| StoreError::TransactionState(e.to_string()))?;
        if !*in_tx {
            return Err(StoreError::TransactionState(
                "commit without an active transaction".into(),
            ));
        }
        *in_tx = false;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut in_tx = self
            .in_transaction
            .lock()
            .map_err(|e| StoreError::TransactionState(e.to_string()))?;
        if !*in_tx {
            return Err(StoreError::TransactionState(
                "rollback without an active transaction".into(),
            ));
        }
        *in_tx = false;
        Ok(())
    }

    async fn store_vector(
        &self,
        _embedding: &[f32],
        _metadata: serde_json::Value,
        _source_id: &str,
    ) -> Result<i64> {
        Err(StoreError::unsupported("memory", "store_vector"))
    }

    async fn query_vector(
        &self,
        _embedding: &[f32],
        _top_k: usize,
        _filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorMatch>> {
        Err(StoreError::unsupported("memory", "query_vector"))
    }

    async fn store_lsh_signatures(&self, batch: &[SignatureRow]) -> Result<()> {
        let now = self.clock.fetch_add(1, Ordering::SeqCst);
        let mut rows = self
            .rows
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;
        rows.extend(batch.iter().map(|row| StoredRow {
            row: row.clone(),
            created_at: now,
        }));
        Ok(())
    }

    async fn query_lsh(&self, bands: &[BandKey], top_n: usize) -> Result<Vec<LshMatch>> {
        if bands.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: HashSet<&str> = bands.iter().map(|b| b.band_hash.as_str()).collect();

        let rows = self
            .rows
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        // (data_reference, source_id) -> (distinct buckets, latest created_at)
        let mut grouped: BTreeMap<(String, String), (HashSet<u32>, i64)> = BTreeMap::new();
        for stored in rows.iter() {
            if !wanted.contains(stored.row.band_hash.as_str()) {
                continue;
            }
            let key = (
                stored.row.data_reference.clone(),
                stored.row.source_id.clone(),
            );
            let entry = grouped.entry(key).or_insert_with(|| (HashSet::new(), 0));
            entry.0.insert(stored.row.bucket_id);
            entry.1 = entry.1.max(stored.created_at);
        }

        let mut matches: Vec<LshMatch> = grouped
            .into_iter()
            .map(|((data_reference, source_id), (buckets, latest))| LshMatch {
                data_reference,
                source_id,
                match_count: buckets.len() as u32,
                last_created_at: latest,
            })
            .collect();

        matches.sort_by(|a, b| {
            b.match_count
                .cmp(&a.match_count)
                .then(b.last_created_at.cmp(&a.last_created_at))
        });
        matches.truncate(top_n);
        Ok(matches)
    }

    async fn clear_lsh_data(&self) -> Result<()> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;
        rows.clear();
        Ok(())
    }

    async fn clear_vector_data(&self) -> Result<()> {
        Err(StoreError::unsupported("memory", "clear_vector_data"))
    }
}
