//! Database factory.
//!
//! Turns a validated [`Config`] into a ready backend behind the
//! [`Database`] contract. Construction is where configuration problems
//! surface; a successfully built backend never fails later for a reason
//! the config could have caught.

use std::sync::Arc;

use tracing::info;

use seekwell_core::store::Database;
use seekwell_core::{Result, StoreError};

use crate::backend::mysql::MySqlBackend;
use crate::backend::sqlite::SqliteBackend;
use crate::config::Config;
use crate::index::HttpVectorIndex;

/// Build the backend selected by `config.database.kind`.
///
/// The networked backend gains vector support only when an `[index]`
/// section is present; without one it declines vector operations.
pub async fn build(config: &Config) -> Result<Arc<dyn Database>> {
    config.validate()?;
    match config.database.kind.as_str() {
        "embedded" => {
            let embedded = config.database.embedded.as_ref().ok_or_else(|| {
                StoreError::Configuration("[database.embedded] is missing".into())
            })?;
            let backend = SqliteBackend::open(embedded).await?;
            info!(path = %embedded.path, "opened embedded database");
            Ok(Arc::new(backend))
        }
        "networked" => {
            let networked = config.database.networked.as_ref().ok_or_else(|| {
                StoreError::Configuration("[database.networked] is missing".into())
            })?;
            let index = config.index.as_ref().map(HttpVectorIndex::new).transpose()?;
            let backend = MySqlBackend::open(networked, index).await?;
            info!(
                host = %networked.host,
                database = %networked.database,
                "connected networked database"
            );
            Ok(Arc::new(backend))
        }
        other => Err(StoreError::Configuration(format!(
            "unknown database kind '{other}' (expected 'embedded' or 'networked')"
        ))),
    }
}
