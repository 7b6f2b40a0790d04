//! End-to-end tests against the embedded backend, driven through the
//! factory exactly as a caller would use it.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use seekwell::config::Config;
use seekwell::engine::{query_values, IndexerConfig, SignatureIndexer};
use seekwell::factory;
use seekwell::minhash::LshConfig;
use seekwell::models::SqlValue;
use seekwell::store::Database;
use seekwell::StoreError;

async fn open_db(dir: &TempDir, pool_size: u32) -> Arc<dyn Database> {
    let path = dir.path().join("seekwell-test.db");
    let raw = format!(
        r#"
        [database]
        kind = "embedded"

        [database.embedded]
        path = "{}"
        pool_size = {pool_size}
        acquire_timeout_secs = 5
        "#,
        path.display()
    );
    let config = Config::from_toml(&raw).unwrap();
    factory::build(&config).await.unwrap()
}

async fn count_rows(db: &dyn Database, table: &str) -> i64 {
    let outcome = db
        .execute_sql(&format!("SELECT COUNT(*) AS n FROM {table}"), &[])
        .await
        .unwrap();
    match outcome.rows[0].get("n") {
        Some(SqlValue::Integer(n)) => *n,
        other => panic!("unexpected count value: {other:?}"),
    }
}

#[tokio::test]
async fn parameterized_sql_roundtrip() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, 5).await;
    db.connect().await.unwrap();

    db.execute_sql(
        "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)",
        &[],
    )
    .await
    .unwrap();

    let outcome = db
        .execute_sql(
            "INSERT INTO people (id, name, age) VALUES ($1, $2, $3)",
            &[
                SqlValue::Integer(1),
                SqlValue::Text("Ada".into()),
                SqlValue::Integer(36),
            ],
        )
        .await
        .unwrap();
    assert_eq!(outcome.rows_affected, 1);

    db.execute_sql(
        "INSERT INTO people (id, name, age) VALUES ($1, $2, $3)",
        &[
            SqlValue::Integer(2),
            SqlValue::Text("Grace".into()),
            SqlValue::Integer(45),
        ],
    )
    .await
    .unwrap();
    db.execute_sql(
        "INSERT INTO people (id, name, age) VALUES ($1, $2, $3)",
        &[SqlValue::Integer(3), SqlValue::Null, SqlValue::Null],
    )
    .await
    .unwrap();

    // Parameters may be reordered and repeated.
    let outcome = db
        .execute_sql(
            "SELECT name FROM people WHERE age > $2 AND id = $1 AND id = $1",
            &[SqlValue::Integer(2), SqlValue::Integer(40)],
        )
        .await
        .unwrap();
    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(
        outcome.rows[0].get("name"),
        Some(&SqlValue::Text("Grace".into()))
    );

    let outcome = db
        .execute_sql("SELECT id FROM people WHERE name IS NULL", &[])
        .await
        .unwrap();
    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(outcome.rows[0].get("id"), Some(&SqlValue::Integer(3)));

    // A dollar sign inside a string literal is not a placeholder.
    let outcome = db
        .execute_sql("SELECT '$1' AS label WHERE 1 = $1", &[SqlValue::Integer(1)])
        .await
        .unwrap();
    assert_eq!(
        outcome.rows[0].get("label"),
        Some(&SqlValue::Text("$1".into()))
    );

    // Referencing a parameter that was not supplied is a query error.
    let err = db.execute_sql("SELECT $2", &[SqlValue::Integer(1)]).await.unwrap_err();
    assert!(matches!(err, StoreError::Query(_)));
}

#[tokio::test]
async fn schema_reports_user_tables_only() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, 5).await;

    db.execute_sql(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, item TEXT NOT NULL, price REAL)",
        &[],
    )
    .await
    .unwrap();

    let schema = db.schema().await.unwrap();
    assert!(schema.tables.contains_key("orders"));
    assert!(!schema.tables.contains_key("lsh_signatures"));
    assert!(!schema.tables.contains_key("vector_metadata"));

    let columns = &schema.tables["orders"];
    let id = columns.iter().find(|c| c.name == "id").unwrap();
    assert!(id.primary_key);
    assert_eq!(id.data_type, "INTEGER");
    let item = columns.iter().find(|c| c.name == "item").unwrap();
    assert!(!item.primary_key);
}

#[tokio::test]
async fn transactions_commit_rollback_and_recover() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, 5).await;
    db.execute_sql("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();

    // Commit path.
    db.begin_transaction().await.unwrap();
    db.execute_sql("INSERT INTO t (v) VALUES ($1)", &[SqlValue::Integer(1)])
        .await
        .unwrap();
    db.commit().await.unwrap();
    assert_eq!(count_rows(db.as_ref(), "t").await, 1);

    // Rollback path discards the insert.
    db.begin_transaction().await.unwrap();
    db.execute_sql("INSERT INTO t (v) VALUES ($1)", &[SqlValue::Integer(2)])
        .await
        .unwrap();
    db.rollback().await.unwrap();
    assert_eq!(count_rows(db.as_ref(), "t").await, 1);

    // State machine violations.
    assert!(matches!(
        db.commit().await,
        Err(StoreError::TransactionState(_))
    ));
    assert!(matches!(
        db.rollback().await,
        Err(StoreError::TransactionState(_))
    ));
    db.begin_transaction().await.unwrap();
    assert!(matches!(
        db.begin_transaction().await,
        Err(StoreError::TransactionState(_))
    ));
    db.rollback().await.unwrap();

    // The slot works again after rollback discarded its connection.
    db.begin_transaction().await.unwrap();
    db.execute_sql("INSERT INTO t (v) VALUES ($1)", &[SqlValue::Integer(3)])
        .await
        .unwrap();
    db.commit().await.unwrap();
    assert_eq!(count_rows(db.as_ref(), "t").await, 2);
}

#[tokio::test]
async fn lsh_store_and_query_roundtrip() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, 5).await;

    let lsh = LshConfig::default();
    let mut indexer =
        SignatureIndexer::new(db.as_ref(), IndexerConfig { lsh, batch_size: 100 }).unwrap();
    indexer
        .add_value("first customer", "t.name.first customer", "db1")
        .await
        .unwrap();
    indexer
        .add_value("second customer", "t.name.second customer", "db1")
        .await
        .unwrap();
    indexer.finish().await.unwrap();

    // Exactly bands rows per stored value.
    assert_eq!(
        count_rows(db.as_ref(), "lsh_signatures").await,
        2 * lsh.bands as i64
    );

    // A stored value matches on every band.
    let matches = query_values(db.as_ref(), "first customer", &lsh, 10)
        .await
        .unwrap();
    assert_eq!(matches[0].data_reference, "t.name.first customer");
    assert_eq!(matches[0].match_count, lsh.bands as u32);

    // No collisions is an empty Ok, not an error.
    let matches = query_values(db.as_ref(), "zzz qqq xxx", &lsh, 10)
        .await
        .unwrap();
    assert!(matches.is_empty());

    // Clearing twice is fine.
    db.clear_lsh_data().await.unwrap();
    db.clear_lsh_data().await.unwrap();
    assert_eq!(count_rows(db.as_ref(), "lsh_signatures").await, 0);
}

#[tokio::test]
async fn lsh_name_lookup_scenario() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, 5).await;

    let lsh = LshConfig {
        shingle_size: 3,
        signature_size: 20,
        bands: 4,
    };
    let mut indexer =
        SignatureIndexer::new(db.as_ref(), IndexerConfig { lsh, batch_size: 100 }).unwrap();
    for name in ["舒然", "Shuran", "刘娟"] {
        indexer
            .add_value(name, &format!("person.name.{name}"), "people_db")
            .await
            .unwrap();
    }
    indexer.finish().await.unwrap();

    // A near-miss query only ever surfaces the almost-identical latin
    // name; the other stored names share no shingles with it.
    let matches = query_values(db.as_ref(), "Shuran ", &lsh, 10).await.unwrap();
    for m in &matches {
        assert_eq!(m.data_reference, "person.name.Shuran");
    }

    // Exact queries collide on every band, including the short value
    // that fits in a single shingle.
    let matches = query_values(db.as_ref(), "Shuran", &lsh, 10).await.unwrap();
    assert_eq!(matches[0].data_reference, "person.name.Shuran");
    assert_eq!(matches[0].match_count, 4);

    let matches = query_values(db.as_ref(), "刘娟", &lsh, 10).await.unwrap();
    assert_eq!(matches[0].data_reference, "person.name.刘娟");
    assert_eq!(matches[0].match_count, 4);
}

#[tokio::test]
async fn embedded_backend_declines_vector_operations() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, 5).await;

    let err = db
        .store_vector(&[0.1, 0.2], serde_json::json!({}), "db1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Unsupported {
            backend: "embedded",
            operation: "store_vector",
        }
    ));
    assert!(!err.is_transient());

    assert!(matches!(
        db.query_vector(&[0.1], 5, None).await,
        Err(StoreError::Unsupported { .. })
    ));
    assert!(matches!(
        db.clear_vector_data().await,
        Err(StoreError::Unsupported { .. })
    ));
}

#[tokio::test]
async fn exhausted_pool_blocks_instead_of_erroring() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, 1).await;

    // The transaction pins the pool's only connection.
    db.begin_transaction().await.unwrap();

    let db2 = Arc::clone(&db);
    let handle = tokio::spawn(async move {
        let lsh = LshConfig::default();
        let mut indexer =
            SignatureIndexer::new(db2.as_ref(), IndexerConfig { lsh, batch_size: 100 }).unwrap();
        indexer.add_value("queued value", "t.c.queued", "db1").await?;
        indexer.finish().await
    });

    // The writer needs its own connection, so it waits rather than
    // failing while the transaction holds the pool.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished());

    db.commit().await.unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(
        count_rows(db.as_ref(), "lsh_signatures").await,
        LshConfig::default().bands as i64
    );
}

#[tokio::test]
async fn interpolated_config_builds_a_working_backend() {
    let dir = TempDir::new().unwrap();
    std::env::set_var("SEEKWELL_ITEST_DB_DIR", dir.path());
    let raw = r#"
        [database]
        kind = "embedded"

        [database.embedded]
        path = "${SEEKWELL_ITEST_DB_DIR}/interp.db"
        pool_size = ${SEEKWELL_ITEST_POOL_SIZE:2}
    "#;
    let config = Config::from_toml(raw).unwrap();
    let embedded = config.database.embedded.as_ref().unwrap();
    assert_eq!(embedded.pool_size, 2);

    let db = factory::build(&config).await.unwrap();
    db.connect().await.unwrap();
    db.execute_sql("CREATE TABLE ok (v INTEGER)", &[]).await.unwrap();
    assert_eq!(count_rows(db.as_ref(), "ok").await, 0);
}

#[tokio::test]
async fn disconnect_releases_the_pool() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, 2).await;
    db.connect().await.unwrap();
    db.disconnect().await.unwrap();

    let err = db.execute_sql("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, StoreError::Connection(_)));
    assert!(err.is_transient());
}
