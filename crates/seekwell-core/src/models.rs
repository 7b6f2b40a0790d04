//! Data models shared across backends and engines.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single SQL parameter or result cell.
///
/// Covers the value space both supported backends share. Adapters decode
/// backend-native types into the closest variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// One result row, keyed by column name.
pub type Row = BTreeMap<String, SqlValue>;

/// Result of [`Database::execute_sql`](crate::store::Database::execute_sql).
///
/// `rows` is empty for statements that return no result set; for those,
/// `rows_affected` carries the change count instead.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SqlOutcome {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

/// A single column as reported by schema introspection.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub primary_key: bool,
}

/// Table-to-columns map for the connected database, excluding the
/// engine's own bookkeeping tables.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseSchema {
    pub tables: BTreeMap<String, Vec<ColumnInfo>>,
}

/// One persisted LSH band for a stored value.
///
/// Every value produces exactly `bands` of these, sharing
/// `data_reference` and `source_id`. `bucket_id` is the band index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRow {
    pub band_hash: String,
    pub bucket_id: u32,
    pub data_reference: String,
    pub source_id: String,
}

/// One ranked match from an LSH query: how many bands of the query
/// collided with bands stored under `data_reference`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LshMatch {
    pub data_reference: String,
    pub source_id: String,
    pub match_count: u32,
    /// Most recent `created_at` among the matched rows; ranking
    /// tie-breaker.
    pub last_created_at: i64,
}

/// Relational side of a stored vector.
///
/// `external_id` is null until the external index insert completes; a
/// row with null `external_id` is not searchable and is never returned
/// by similarity queries.
#[derive(Debug, Clone, Serialize)]
pub struct VectorRecord {
    pub id: i64,
    pub external_id: Option<String>,
    pub source_id: String,
    pub chunk_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

/// One similarity search result with relevance rescaled to `[0, 1]`.
#[derive(Debug, Clone, Serialize)]
pub struct VectorMatch {
    pub record_id: i64,
    pub external_id: String,
    pub source_id: String,
    pub chunk_id: Option<String>,
    pub metadata: serde_json::Value,
    pub relevance: f64,
}

/// Relational filter applied before the external index search.
///
/// `metadata` entries match by key/value equality against the stored
/// JSON metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VectorFilter {
    pub source_id: Option<String>,
    pub chunk_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl VectorFilter {
    pub fn is_empty(&self) -> bool {
        self.source_id.is_none() && self.chunk_id.is_none() && self.metadata.is_empty()
    }
}
