//! Storage abstraction for Seekwell.
//!
//! The [`Database`] trait defines every operation the NL2SQL pipeline
//! needs from a relational backend, enabling pluggable backends (embedded
//! SQLite, networked MySQL, in-memory for tests).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    DatabaseSchema, LshMatch, SignatureRow, SqlOutcome, SqlValue, VectorFilter, VectorMatch,
};

/// Abstract database backend for Seekwell.
///
/// A backend may decline a fuzzy-retrieval operation with
/// [`StoreError::Unsupported`](crate::StoreError::Unsupported); callers
/// branch on the error kind, never on backend identity.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`execute_sql`](Database::execute_sql) | Run parameterized SQL (`$1..$n` placeholders) |
/// | [`schema`](Database::schema) | Introspect user tables and columns |
/// | [`begin_transaction`](Database::begin_transaction) / [`commit`](Database::commit) / [`rollback`](Database::rollback) | Explicit transaction control |
/// | [`store_vector`](Database::store_vector) / [`query_vector`](Database::query_vector) | Vector similarity via the external index |
/// | [`store_lsh_signatures`](Database::store_lsh_signatures) / [`query_lsh`](Database::query_lsh) | LSH band persistence and lookup |
/// | [`clear_lsh_data`](Database::clear_lsh_data) / [`clear_vector_data`](Database::clear_vector_data) | Bulk deletion for index rebuilds |
#[async_trait]
pub trait Database: Send + Sync {
    /// Short backend identifier used in `Unsupported` errors and logs.
    fn backend_name(&self) -> &'static str;

    /// Verify connectivity. Adapters establish their pools at
    /// construction; this checks a live connection can be acquired.
    async fn connect(&self) -> Result<()>;

    /// Release the connection pool. Further operations fail with a
    /// connection error.
    async fn disconnect(&self) -> Result<()>;

    /// Execute one SQL statement with `$1..$n` placeholders.
    ///
    /// Placeholders are rewritten to the backend's native syntax; a
    /// parameter may be referenced more than once. Runs inside the
    /// active transaction when one is open, otherwise autocommits.
    async fn execute_sql(&self, query: &str, params: &[SqlValue]) -> Result<SqlOutcome>;

    /// Tables and columns of the connected database, excluding the
    /// engine's own bookkeeping tables.
    async fn schema(&self) -> Result<DatabaseSchema>;

    /// Open an explicit transaction on a dedicated session connection.
    async fn begin_transaction(&self) -> Result<()>;

    /// Commit the active transaction and return its connection to the
    /// pool.
    async fn commit(&self) -> Result<()>;

    /// Roll back the active transaction. The session connection is
    /// always discarded afterwards rather than returned to the pool.
    async fn rollback(&self) -> Result<()>;

    /// Two-phase vector write; returns the relational record id.
    async fn store_vector(
        &self,
        embedding: &[f32],
        metadata: serde_json::Value,
        source_id: &str,
    ) -> Result<i64>;

    /// Similarity search with relevance rescaled to `[0, 1]`.
    async fn query_vector(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorMatch>>;

    /// Persist a batch of LSH bands atomically.
    async fn store_lsh_signatures(&self, batch: &[SignatureRow]) -> Result<()>;

    /// Look up stored bands by hash, grouped by data reference and
    /// ranked by distinct matched bands (ties broken by recency).
    /// No matches is an empty `Ok`, not an error.
    async fn query_lsh(&self, bands: &[crate::minhash::BandKey], top_n: usize)
        -> Result<Vec<LshMatch>>;

    /// Delete all LSH rows. Idempotent.
    async fn clear_lsh_data(&self) -> Result<()>;

    /// Delete all vector records and external index points. Idempotent.
    async fn clear_vector_data(&self) -> Result<()>;
}
