//! Distinct-value collection.
//!
//! Read path of signature preprocessing: pull the distinct non-null
//! values of one text column so they can be fed to a
//! [`SignatureIndexer`](seekwell_core::engine::SignatureIndexer).
//! Deciding which columns are worth indexing (skipping ids, URLs,
//! dates) stays with the caller.

use seekwell_core::models::SqlValue;
use seekwell_core::store::Database;
use seekwell_core::{Result, StoreError};

fn valid_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Distinct non-null text values of `table.column`. Non-text cells are
/// skipped.
pub async fn collect_text_values<S: Database + ?Sized>(
    db: &S,
    table: &str,
    column: &str,
) -> Result<Vec<String>> {
    if !valid_identifier(table) || !valid_identifier(column) {
        return Err(StoreError::Query(format!(
            "invalid identifier in {table}.{column}"
        )));
    }
    let sql =
        format!("SELECT DISTINCT `{column}` FROM `{table}` WHERE `{column}` IS NOT NULL");
    let outcome = db.execute_sql(&sql, &[]).await?;
    Ok(outcome
        .rows
        .into_iter()
        .filter_map(|mut row| match row.remove(column) {
            Some(SqlValue::Text(value)) => Some(value),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use seekwell_core::store::memory::MemoryBackend;

    #[tokio::test]
    async fn rejects_unsafe_identifiers() {
        let db = MemoryBackend::new();
        let err = collect_text_values(&db, "users; DROP TABLE users", "name")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));

        let err = collect_text_values(&db, "users", "name`").await.unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));
    }
}
