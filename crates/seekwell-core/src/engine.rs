//! Signature indexing and LSH query engines.
//!
//! [`SignatureIndexer`] turns distinct column values into band rows and
//! persists them through any [`Database`] in value-aligned batches, so a
//! value is never stored with a partial subset of its bands.
//! [`query_values`] runs the identical pipeline over a query string and
//! ranks stored references by how many bands collided.

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::minhash::{band_hashes, LshConfig};
use crate::models::{LshMatch, SignatureRow};
use crate::store::Database;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Indexer tunables. `batch_size` counts values, not rows; each flush
/// writes `values x bands` rows in one transaction.
#[derive(Debug, Clone, Copy)]
pub struct IndexerConfig {
    pub lsh: LshConfig,
    pub batch_size: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            lsh: LshConfig::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Buffers band rows and flushes them in batches.
///
/// Call [`finish`](SignatureIndexer::finish) when done; dropping the
/// indexer without it loses any still-buffered rows.
pub struct SignatureIndexer<'a, S: Database + ?Sized> {
    store: &'a S,
    config: IndexerConfig,
    buffer: Vec<SignatureRow>,
    buffered_values: usize,
}

impl<'a, S: Database + ?Sized> SignatureIndexer<'a, S> {
    pub fn new(store: &'a S, config: IndexerConfig) -> Result<Self> {
        config.lsh.validate()?;
        if config.batch_size == 0 {
            return Err(StoreError::Configuration(
                "indexer batch_size must be positive".into(),
            ));
        }
        Ok(Self {
            store,
            config,
            buffer: Vec::new(),
            buffered_values: 0,
        })
    }

    /// Queue one value. Values with no shingles are skipped. Flushes
    /// automatically once `batch_size` values are buffered.
    pub async fn add_value(
        &mut self,
        value: &str,
        data_reference: &str,
        source_id: &str,
    ) -> Result<()> {
        let keys = band_hashes(value, &self.config.lsh);
        if keys.is_empty() {
            debug!(data_reference, "skipping value with no shingles");
            return Ok(());
        }
        for key in keys {
            self.buffer.push(SignatureRow {
                band_hash: key.band_hash,
                bucket_id: key.bucket_id,
                data_reference: data_reference.to_string(),
                source_id: source_id.to_string(),
            });
        }
        self.buffered_values += 1;
        if self.buffered_values >= self.config.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Persist everything buffered so far.
    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        debug!(
            values = self.buffered_values,
            rows = self.buffer.len(),
            "flushing signature batch"
        );
        self.store.store_lsh_signatures(&self.buffer).await?;
        self.buffer.clear();
        self.buffered_values = 0;
        Ok(())
    }

    /// Flush the remainder and consume the indexer.
    pub async fn finish(mut self) -> Result<()> {
        self.flush().await
    }
}

/// Rank stored references against `query` by colliding bands.
///
/// A query that yields no shingles, or one whose bands match nothing,
/// returns an empty `Ok` rather than an error.
pub async fn query_values<S: Database + ?Sized>(
    store: &S,
    query: &str,
    lsh: &LshConfig,
    top_n: usize,
) -> Result<Vec<LshMatch>> {
    lsh.validate()?;
    let bands = band_hashes(query, lsh);
    if bands.is_empty() {
        return Ok(Vec::new());
    }
    store.query_lsh(&bands, top_n).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;

    fn config() -> IndexerConfig {
        IndexerConfig::default()
    }

    #[tokio::test]
    async fn each_value_produces_one_row_per_band() {
        let store = MemoryBackend::new();
        let mut indexer = SignatureIndexer::new(&store, config()).unwrap();
        indexer.add_value("alpha one", "t.c.alpha one", "db1").await.unwrap();
        indexer.add_value("beta two", "t.c.beta two", "db1").await.unwrap();
        indexer.finish().await.unwrap();
        assert_eq!(store.row_count(), 2 * LshConfig::default().bands);
    }

    #[tokio::test]
    async fn stored_value_matches_all_bands() {
        let store = MemoryBackend::new();
        let mut indexer = SignatureIndexer::new(&store, config()).unwrap();
        indexer
            .add_value("customer name", "t.c.customer name", "db1")
            .await
            .unwrap();
        indexer.finish().await.unwrap();

        let lsh = LshConfig::default();
        let matches = query_values(&store, "customer name", &lsh, 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].data_reference, "t.c.customer name");
        assert_eq!(matches[0].match_count, lsh.bands as u32);
    }

    #[tokio::test]
    async fn flushes_at_batch_boundary() {
        let store = MemoryBackend::new();
        let cfg = IndexerConfig {
            lsh: LshConfig::default(),
            batch_size: 2,
        };
        let mut indexer = SignatureIndexer::new(&store, cfg).unwrap();
        indexer.add_value("first", "r1", "db").await.unwrap();
        assert_eq!(store.row_count(), 0);
        indexer.add_value("second", "r2", "db").await.unwrap();
        // Second value crossed the batch boundary.
        assert_eq!(store.row_count(), 2 * cfg.lsh.bands);
        indexer.add_value("third", "r3", "db").await.unwrap();
        assert_eq!(store.row_count(), 2 * cfg.lsh.bands);
        indexer.finish().await.unwrap();
        assert_eq!(store.row_count(), 3 * cfg.lsh.bands);
    }

    #[tokio::test]
    async fn empty_values_are_skipped() {
        let store = MemoryBackend::new();
        let mut indexer = SignatureIndexer::new(&store, config()).unwrap();
        indexer.add_value("", "r1", "db").await.unwrap();
        indexer.add_value("   ", "r2", "db").await.unwrap();
        indexer.finish().await.unwrap();
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn unseen_query_returns_empty_ok() {
        let store = MemoryBackend::new();
        let lsh = LshConfig::default();
        let matches = query_values(&store, "nothing stored here", &lsh, 5)
            .await
            .unwrap();
        assert!(matches.is_empty());

        let matches = query_values(&store, "", &lsh, 5).await.unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let store = MemoryBackend::new();
        let cfg = IndexerConfig {
            lsh: LshConfig {
                shingle_size: 3,
                signature_size: 20,
                bands: 7,
            },
            batch_size: 100,
        };
        assert!(SignatureIndexer::new(&store, cfg).is_err());
    }
}
