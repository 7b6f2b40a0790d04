//! Networked MySQL backend.
//!
//! Pooled server-backed database for shared deployments. Implements the
//! full relational and LSH surface and, when an external vector-index
//! service is configured, the vector operations through a
//! [`VectorBridge`].

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Connection, MySql, MySqlPool, Row as SqlxRow, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use seekwell_core::bridge::{metadata_matches, VectorBridge, VectorMetadataStore};
use seekwell_core::minhash::BandKey;
use seekwell_core::models::{
    ColumnInfo, DatabaseSchema, LshMatch, Row, SignatureRow, SqlOutcome, SqlValue, VectorFilter,
    VectorMatch, VectorRecord,
};
use seekwell_core::store::Database;
use seekwell_core::{Result, StoreError};

use crate::backend::{
    check_params, map_sqlx_err, rewrite_placeholders, statement_returns_rows, INTERNAL_TABLES,
};
use crate::config::NetworkedConfig;
use crate::index::HttpVectorIndex;

const BACKEND: &str = "networked";

/// MySQL implementation of the [`Database`] contract.
///
/// Vector operations are available only when an index client was
/// configured; otherwise they are declined with `Unsupported`.
pub struct MySqlBackend {
    pool: MySqlPool,
    database: String,
    session: Mutex<Option<PoolConnection<MySql>>>,
    vector: Option<VectorBridge<MySqlVectorMeta, HttpVectorIndex>>,
}

impl MySqlBackend {
    pub async fn open(
        config: &NetworkedConfig,
        index: Option<HttpVectorIndex>,
    ) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);

        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .test_before_acquire(true)
            .connect_with(options)
            .await
            .map_err(map_sqlx_err)?;

        let vector = index.map(|index| {
            VectorBridge::new(
                MySqlVectorMeta {
                    pool: pool.clone(),
                },
                index,
            )
        });

        let backend = Self {
            pool,
            database: config.database.clone(),
            session: Mutex::new(None),
            vector,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lsh_signatures (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                band_hash VARCHAR(64) NOT NULL,
                bucket_id INT UNSIGNED NOT NULL,
                data_reference VARCHAR(512) NOT NULL,
                source_id VARCHAR(255) NOT NULL,
                created_at BIGINT NOT NULL,
                INDEX idx_lsh_band_hash (band_hash),
                INDEX idx_lsh_data_reference (data_reference(191)),
                INDEX idx_lsh_source_id (source_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_metadata (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                external_id VARCHAR(64) UNIQUE,
                source_id VARCHAR(255) NOT NULL,
                chunk_id VARCHAR(255),
                metadata LONGTEXT NOT NULL,
                created_at BIGINT NOT NULL,
                INDEX idx_vector_source_id (source_id),
                INDEX idx_vector_chunk_id (chunk_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
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
        E: sqlx::Executor<'e, Database = MySql>,
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
    mut query: sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments>,
    order: &[usize],
    params: &'q [SqlValue],
) -> sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments> {
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

fn decode_row(row: &MySqlRow) -> Result<Row> {
    let mut out = Row::new();
    for column in row.columns() {
        let idx = column.ordinal();
        out.insert(column.name().to_string(), decode_value(row, idx)?);
    }
    Ok(out)
}

fn decode_value(row: &MySqlRow, idx: usize) -> Result<SqlValue> {
    let raw = row.try_get_raw(idx).map_err(map_sqlx_err)?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "BOOLEAN" => {
            SqlValue::Integer(row.try_get::<i64, _>(idx).map_err(map_sqlx_err)?)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => {
            SqlValue::Integer(row.try_get::<u64, _>(idx).map_err(map_sqlx_err)? as i64)
        }
        "FLOAT" => SqlValue::Real(row.try_get::<f32, _>(idx).map_err(map_sqlx_err)? as f64),
        "DOUBLE" => SqlValue::Real(row.try_get::<f64, _>(idx).map_err(map_sqlx_err)?),
        "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" => {
            SqlValue::Text(row.try_get::<String, _>(idx).map_err(map_sqlx_err)?)
        }
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            SqlValue::Blob(row.try_get::<Vec<u8>, _>(idx).map_err(map_sqlx_err)?)
        }
        "DATETIME" => SqlValue::Text(
            row.try_get::<chrono::NaiveDateTime, _>(idx)
                .map_err(map_sqlx_err)?
                .to_string(),
        ),
        "TIMESTAMP" => SqlValue::Text(
            row.try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
                .map_err(map_sqlx_err)?
                .to_rfc3339(),
        ),
        "DATE" => SqlValue::Text(
            row.try_get::<chrono::NaiveDate, _>(idx)
                .map_err(map_sqlx_err)?
                .to_string(),
        ),
        "TIME" => SqlValue::Text(
            row.try_get::<chrono::NaiveTime, _>(idx)
                .map_err(map_sqlx_err)?
                .to_string(),
        ),
        // DECIMAL, JSON, and anything else: probe common decodings.
        _ => decode_untyped(row, idx),
    };
    Ok(value)
}

fn decode_untyped(row: &MySqlRow, idx: usize) -> SqlValue {
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

#[async_trait]
impl Database for MySqlBackend {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn connect(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_err)?;
        conn.ping().await.map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
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
        let rows = sqlx::query(
            r#"
            SELECT TABLE_NAME AS table_name, COLUMN_NAME AS column_name,
                   DATA_TYPE AS data_type, COLUMN_KEY AS column_key
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = ?
            ORDER BY TABLE_NAME, ORDINAL_POSITION
            "#,
        )
        .bind(&self.database)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut schema = DatabaseSchema::default();
        for row in &rows {
            let table: String = row.try_get("table_name").map_err(map_sqlx_err)?;
            if INTERNAL_TABLES.contains(&table.as_str()) {
                continue;
            }
            let column_key: String = row.try_get("column_key").map_err(map_sqlx_err)?;
            let column = ColumnInfo {
                name: row.try_get("column_name").map_err(map_sqlx_err)?,
                data_type: row.try_get("data_type").map_err(map_sqlx_err)?,
                primary_key: column_key == "PRI",
            };
            schema.tables.entry(table).or_default().push(column);
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
        // Pooled MySQL connections can retain partial transaction state
        // after a failed rollback; the connection is always discarded.
        let conn = conn.detach();
        if let Err(e) = conn.close().await {
            debug!(error = %e, "error closing discarded connection");
        }
        rolled_back.map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn store_vector(
        &self,
        embedding: &[f32],
        metadata: serde_json::Value,
        source_id: &str,
    ) -> Result<i64> {
        match &self.vector {
            Some(bridge) => bridge.store(embedding, metadata, source_id).await,
            None => Err(StoreError::unsupported(BACKEND, "store_vector")),
        }
    }

    async fn query_vector(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorMatch>> {
        match &self.vector {
            Some(bridge) => bridge.query(embedding, top_k, filter).await,
            None => Err(StoreError::unsupported(BACKEND, "query_vector")),
        }
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
            .bind(row.bucket_id)
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
        query = query.bind(top_n as u64);

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
        match &self.vector {
            Some(bridge) => bridge.clear().await,
            None => Err(StoreError::unsupported(BACKEND, "clear_vector_data")),
        }
    }
}

/// Relational half of the vector bridge, backed by the
/// `vector_metadata` table.
pub struct MySqlVectorMeta {
    pool: MySqlPool,
}

fn record_from_row(row: &MySqlRow) -> Result<VectorRecord> {
    let metadata_raw: String = row.try_get("metadata").map_err(map_sqlx_err)?;
    let metadata = serde_json::from_str(&metadata_raw)
        .unwrap_or(serde_json::Value::Object(Default::default()));
    Ok(VectorRecord {
        id: row.try_get("id").map_err(map_sqlx_err)?,
        external_id: row.try_get("external_id").map_err(map_sqlx_err)?,
        source_id: row.try_get("source_id").map_err(map_sqlx_err)?,
        chunk_id: row.try_get("chunk_id").map_err(map_sqlx_err)?,
        metadata,
        created_at: row.try_get("created_at").map_err(map_sqlx_err)?,
    })
}

#[async_trait]
impl VectorMetadataStore for MySqlVectorMeta {
    async fn insert_record(
        &self,
        metadata: &serde_json::Value,
        source_id: &str,
        chunk_id: Option<&str>,
    ) -> Result<i64> {
        let metadata_raw = serde_json::to_string(metadata)
            .map_err(|e| StoreError::Query(format!("unserializable metadata: {e}")))?;
        let result = sqlx::query(
            "INSERT INTO vector_metadata (external_id, source_id, chunk_id, metadata, created_at) VALUES (NULL, ?, ?, ?, ?)",
        )
        .bind(source_id)
        .bind(chunk_id)
        .bind(&metadata_raw)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.last_insert_id() as i64)
    }

    async fn attach_external_id(&self, record_id: i64, external_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE vector_metadata SET external_id = ? WHERE id = ? AND external_id IS NULL",
        )
        .bind(external_id)
        .bind(record_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Query(format!(
                "vector record {record_id} is missing or already has an external id"
            )));
        }
        Ok(())
    }

    async fn searchable_ids(&self, filter: Option<&VectorFilter>) -> Result<Vec<String>> {
        let mut sql = String::from(
            "SELECT external_id, metadata FROM vector_metadata WHERE external_id IS NOT NULL",
        );
        let mut binds: Vec<&str> = Vec::new();
        if let Some(filter) = filter {
            if let Some(source_id) = &filter.source_id {
                sql.push_str(" AND source_id = ?");
                binds.push(source_id.as_str());
            }
            if let Some(chunk_id) = &filter.chunk_id {
                sql.push_str(" AND chunk_id = ?");
                binds.push(chunk_id.as_str());
            }
        }

        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_err)?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(filter) = filter {
                if !filter.metadata.is_empty() {
                    let metadata_raw: String = row.try_get("metadata").map_err(map_sqlx_err)?;
                    let metadata = serde_json::from_str(&metadata_raw)
                        .unwrap_or(serde_json::Value::Null);
                    if !metadata_matches(filter, &metadata) {
                        continue;
                    }
                }
            }
            let external_id: String = row.try_get("external_id").map_err(map_sqlx_err)?;
            ids.push(external_id);
        }
        Ok(ids)
    }

    async fn records_by_external_ids(&self, ids: &[String]) -> Result<Vec<VectorRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, external_id, source_id, chunk_id, metadata, created_at FROM vector_metadata WHERE external_id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_err)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn clear_records(&self) -> Result<()> {
        sqlx::query("DELETE FROM vector_metadata")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }
}
