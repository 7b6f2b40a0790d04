//! Embedded SQLite backend.
//!
//! File-backed database for local/offline runs. Implements the full
//! relational and LSH surface; vector operations are declined with
//! `Unsupported`, since the embedded profile has no external index
//! service to bridge to.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Connection, Row as SqlxRow, Sqlite, SqlitePool, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use seekwell_core::minhash::BandKey;
use seekwell_core::models::{
    ColumnInfo, DatabaseSchema, LshMatch, Row, SignatureRow, SqlOutcome, SqlValue, VectorFilter,
    VectorMatch,
};
use seekwell_core::store::Database;
use seekwell_core::{Result, StoreError};

use crate::backend::{
    check_params, map_sqlx_err, rewrite_placeholders, statement_returns_rows, INTERNAL_TABLES,
};
use crate::config::EmbeddedConfig;

const BACKEND: &str = "embedded";

/// SQLite implementation of the [`Database`] contract.
///
/// Holds a bounded pool plus at most one session connection pinned for
/// an explicit transaction. SQL outside a transaction autocommits on a
/// pooled connection.
pub struct SqliteBackend {
    pool: SqlitePool,
    session: Mutex<Option<PoolConnection<Sqlite>>>,
}

impl SqliteBackend {
    /// Open (creating if missing) the database file and initialize the
    /// bookkeeping schema.
    pub async fn open(config: &EmbeddedConfig) -> Result<Self> {
        let path = Path::new(&config.path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Configuration(format!(
                        "cannot create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .test_before_acquire(true)
            .connect_with(options)
            .await
            .map_err(map_sqlx_err)?;

        let backend = Self {
            pool,
            session: Mutex::new(None),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lsh_signatures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                band_hash TEXT NOT NULL,
                bucket_id INTEGER NOT NULL,
                data_reference TEXT NOT NULL,
                source_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_lsh_band_hash ON lsh_signatures (band_hash)",
            "CREATE INDEX IF NOT EXISTS idx_lsh_data_reference ON lsh_signatures (data_reference)",
            "CREATE INDEX IF NOT EXISTS idx_lsh_source_id ON lsh_signatures (source_id)",
        ] {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        }
        Ok(())
    }

    async fn run<'e, E>(
        executor: E,
        sql: &str,
        order: &[usize],
        params: &[SqlValue],
        fetch: bool,
    ) -> Result<SqlOutcome>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let query = bind_params(sqlx::query(sql), order, params);
        if fetch {
            let rows = query.fetch_all(executor).await.map_err(map_sqlx_err)?;
            let mut out = Vec::with_capacity(rows.len());
            for row in &rows {
                out.push(decode_row(row)?);
            }
            Ok(SqlOutcome {
                rows_affected: out.len() as u64,
                rows: out,
            })
        } else {
            let result = query.execute(executor).await.map_err(map_sqlx_err)?;
            Ok(SqlOutcome {
                rows: Vec::new(),
                rows_affected: result.rows_affected(),
            })
        }
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    order: &[usize],
    params: &'q [SqlValue],
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for &idx in order {
        query = match &params[idx - 1] {
            SqlValue::Null => query.bind(Option::<i64>::None),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
            SqlValue::Blob(v) => query.bind(v.as_slice()),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> Result<Row> {
    let mut out = Row::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let raw = row.try_get_raw(idx).map_err(map_sqlx_err)?;
        let value = if raw.is_null() {
            SqlValue::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => {
                    SqlValue::Integer(row.try_get::<i64, _>(idx).map_err(map_sqlx_err)?)
                }
                "REAL" => SqlValue::Real(row.try_get::<f64, _>(idx).map_err(map_sqlx_err)?),
                "TEXT" | "DATETIME" | "DATE" | "TIME" => {
                    SqlValue::Text(row.try_get::<String, _>(idx).map_err(map_sqlx_err)?)
                }
                "BLOB" => SqlValue::Blob(row.try_get::<Vec<u8>, _>(idx).map_err(map_sqlx_err)?),
                _ => decode_untyped(row, idx),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

// Expression columns sometimes report no useful type affinity; probe
// the common decodings in order.
fn decode_untyped(row: &SqliteRow, idx: usize) -> SqlValue {
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return SqlValue::Integer(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return SqlValue::Real(v);
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return SqlValue::Text(v);
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(idx) {
        return SqlValue::Blob(v);
    }
    SqlValue::Null
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl Database for SqliteBackend {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn connect(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_err)?;
        conn.ping().await.map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Drop any pinned session first so close() does not wait on it.
        self.session.lock().await.take();
        self.pool.close().await;
        Ok(())
    }

    async fn execute_sql(&self, query: &str, params: &[SqlValue]) -> Result<SqlOutcome> {
        let (sql, order) = rewrite_placeholders(query)?;
        check_params(&order, params.len())?;
        let fetch = statement_returns_rows(&sql);

        let mut session = self.session.lock().await;
        match session.as_mut() {
            Some(conn) => Self::run(&mut **conn, &sql, &order, params, fetch).await,
            None => Self::run(&self.pool, &sql, &order, params, fetch).await,
        }
    }

    async fn schema(&self) -> Result<DatabaseSchema> {
        let tables = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut schema = DatabaseSchema::default();
        for table_row in &tables {
            let table: String = table_row.try_get("name").map_err(map_sqlx_err)?;
            if INTERNAL_TABLES.contains(&table.as_str()) {
                continue;
            }
            let columns = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(&table)))
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
            let columns = columns
                .iter()
                .map(|row| {
                    Ok(ColumnInfo {
                        name: row.try_get("name").map_err(map_sqlx_err)?,
                        data_type: row.try_get("type").map_err(map_sqlx_err)?,
                        primary_key: row.try_get::<i64, _>("pk").map_err(map_sqlx_err)? > 0,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            schema.tables.insert(table, columns);
        }
        Ok(schema)
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(StoreError::TransactionState(
                "transaction already in progress".into(),
            ));
        }
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_err)?;
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_err)?;
        *session = Some(conn);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let mut conn = session.take().ok_or_else(|| {
            StoreError::TransactionState("commit without an active transaction".into())
        })?;
        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_err)?;
        // Connection returns to the pool on drop.
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let mut conn = session.take().ok_or_else(|| {
            StoreError::TransactionState("rollback without an active transaction".into())
        })?;
        let rolled_back = sqlx::query("ROLLBACK").execute(&mut *conn).await;
        if let Err(e) = &rolled_back {
            warn!(error = %e, "rollback statement failed; discarding connection");
        }
        // Never return a rolled-back connection to the pool; it may
        // carry residual transaction state. The pool replaces it.
        let conn = conn.detach();
        if let Err(e) = conn.close().await {
            debug!(error = %e, "error closing discarded connection");
        }
        rolled_back.map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn store_vector(
        &self,
        _embedding: &[f32],
        _metadata: serde_json::Value,
        _source_id: &str,
    ) -> Result<i64> {
        Err(StoreError::unsupported(BACKEND, "store_vector"))
    }

    async fn query_vector(
        &self,
        _embedding: &[f32],
        _top_k: usize,
        _filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorMatch>> {
        Err(StoreError::unsupported(BACKEND, "query_vector"))
    }

    async fn store_lsh_signatures(&self, batch: &[SignatureRow]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let created_at = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        for row in batch {
            sqlx::query(
                "INSERT INTO lsh_signatures (band_hash, bucket_id, data_reference, source_id, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&row.band_hash)
            .bind(row.bucket_id as i64)
            .bind(&row.data_reference)
            .bind(&row.source_id)
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn query_lsh(&self, bands: &[BandKey], top_n: usize) -> Result<Vec<LshMatch>> {
        if bands.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; bands.len()].join(", ");
        let sql = format!(
            r#"
            SELECT data_reference, source_id,
                   COUNT(DISTINCT bucket_id) AS match_count,
                   MAX(created_at) AS last_created_at
            FROM lsh_signatures
            WHERE band_hash IN ({placeholders})
            GROUP BY data_reference, source_id
            ORDER BY match_count DESC, last_created_at DESC
            LIMIT ?
            "#
        );
        let mut query = sqlx::query(&sql);
        for band in bands {
            query = query.bind(&band.band_hash);
        }
        query = query.bind(top_n as i64);

        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_err)?;
        rows.iter()
            .map(|row| {
                Ok(LshMatch {
                    data_reference: row.try_get("data_reference").map_err(map_sqlx_err)?,
                    source_id: row.try_get("source_id").map_err(map_sqlx_err)?,
                    match_count: row.try_get::<i64, _>("match_count").map_err(map_sqlx_err)?
                        as u32,
                    last_created_at: row
                        .try_get::<i64, _>("last_created_at")
                        .map_err(map_sqlx_err)?,
                })
            })
            .collect()
    }

    async fn clear_lsh_data(&self) -> Result<()> {
        sqlx::query("DELETE FROM lsh_signatures")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn clear_vector_data(&self) -> Result<()> {
        Err(StoreError::unsupported(BACKEND, "clear_vector_data"))
    }
}
