//! SQL backend adapters.
//!
//! Both adapters speak the same placeholder convention (`$1..$n`) and
//! translate it to their native `?` syntax here, so callers never write
//! backend-specific SQL parameters.

pub mod mysql;
pub mod sqlite;

use seekwell_core::{Result, StoreError};

/// Bookkeeping tables hidden from schema introspection.
pub(crate) const INTERNAL_TABLES: &[&str] = &["lsh_signatures", "vector_metadata"];

/// Rewrite `$1..$n` placeholders to `?`, returning the rewritten SQL
/// and the 1-based parameter index for each `?` in order. A parameter
/// may be referenced any number of times and in any order. Dollar signs
/// inside single-quoted string literals are left untouched.
pub(crate) fn rewrite_placeholders(query: &str) -> Result<(String, Vec<usize>)> {
    let mut sql = String::with_capacity(query.len());
    let mut order = Vec::new();
    let mut chars = query.chars().peekable();
    let mut in_literal = false;

    while let Some(c) = chars.next() {
        if in_literal {
            sql.push(c);
            if c == '\'' {
                // '' escapes a quote inside the literal.
                if chars.peek() == Some(&'\'') {
                    sql.push('\'');
                    chars.next();
                } else {
                    in_literal = false;
                }
            }
            continue;
        }
        match c {
            '\'' => {
                in_literal = true;
                sql.push(c);
            }
            '$' if chars.peek().map_or(false, |c| c.is_ascii_digit()) => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let index: usize = digits
                    .parse()
                    .map_err(|_| StoreError::Query(format!("invalid placeholder ${digits}")))?;
                if index == 0 {
                    return Err(StoreError::Query("placeholder indexes start at $1".into()));
                }
                order.push(index);
                sql.push('?');
            }
            _ => sql.push(c),
        }
    }
    Ok((sql, order))
}

/// Every referenced placeholder must have a supplied parameter.
pub(crate) fn check_params(order: &[usize], supplied: usize) -> Result<()> {
    if let Some(&max) = order.iter().max() {
        if max > supplied {
            return Err(StoreError::Query(format!(
                "query references ${max} but only {supplied} parameters were supplied"
            )));
        }
    }
    Ok(())
}

/// Whether a statement produces a result set (fetch) rather than a
/// change count (execute).
pub(crate) fn statement_returns_rows(query: &str) -> bool {
    let first = query
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        first.as_str(),
        "SELECT" | "WITH" | "PRAGMA" | "EXPLAIN" | "SHOW" | "DESCRIBE" | "VALUES"
    )
}

/// Translate a sqlx failure into the shared taxonomy.
pub(crate) fn map_sqlx_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut => {
            StoreError::Connection("timed out waiting for a pooled connection".into())
        }
        sqlx::Error::PoolClosed => StoreError::Connection("connection pool is closed".into()),
        sqlx::Error::Io(e) => StoreError::Connection(e.to_string()),
        sqlx::Error::Tls(e) => StoreError::Connection(e.to_string()),
        sqlx::Error::Protocol(e) => StoreError::Connection(e),
        sqlx::Error::Configuration(e) => StoreError::Configuration(e.to_string()),
        sqlx::Error::Database(e) => StoreError::Query(e.to_string()),
        other => StoreError::Query(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_in_order() {
        let (sql, order) = rewrite_placeholders("SELECT * FROM t WHERE a = $1 AND b = $2").unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a = ? AND b = ?");
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn handles_reordered_and_repeated_parameters() {
        let (sql, order) =
            rewrite_placeholders("SELECT $2, $1 WHERE x = $1").unwrap();
        assert_eq!(sql, "SELECT ?, ? WHERE x = ?");
        assert_eq!(order, vec![2, 1, 1]);
    }

    #[test]
    fn leaves_string_literals_alone() {
        let (sql, order) =
            rewrite_placeholders("SELECT '$1 costs $2' AS label WHERE id = $1").unwrap();
        assert_eq!(sql, "SELECT '$1 costs $2' AS label WHERE id = ?");
        assert_eq!(order, vec![1]);
    }

    #[test]
    fn escaped_quotes_stay_inside_literals() {
        let (sql, order) = rewrite_placeholders("SELECT 'it''s $1' WHERE a = $1").unwrap();
        assert_eq!(sql, "SELECT 'it''s $1' WHERE a = ?");
        assert_eq!(order, vec![1]);
    }

    #[test]
    fn zero_index_is_rejected() {
        assert!(rewrite_placeholders("SELECT $0").is_err());
    }

    #[test]
    fn missing_parameters_are_detected() {
        let (_, order) = rewrite_placeholders("SELECT $3").unwrap();
        assert!(check_params(&order, 2).is_err());
        assert!(check_params(&order, 3).is_ok());
        assert!(check_params(&[], 0).is_ok());
    }

    #[test]
    fn classifies_statements() {
        assert!(statement_returns_rows("SELECT 1"));
        assert!(statement_returns_rows("  with q as (select 1) select * from q"));
        assert!(statement_returns_rows("PRAGMA table_info('t')"));
        assert!(!statement_returns_rows("INSERT INTO t VALUES (1)"));
        assert!(!statement_returns_rows("UPDATE t SET a = 1"));
    }
}
