//! Vector store bridge.
//!
//! Vector storage spans two systems: relational rows carrying metadata
//! (a [`VectorMetadataStore`]) and an external similarity service
//! holding the embeddings (a [`VectorIndex`]). [`VectorBridge`] keeps
//! the two consistent through the two-phase write and joins them on the
//! query path.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{VectorFilter, VectorMatch, VectorRecord};

/// Distance metric reported by the external index, used to rescale raw
/// scores into `[0, 1]` relevance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
    InnerProduct,
}

/// One raw hit from the external index.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub external_id: String,
    pub score: f64,
}

/// Raw search response from the external index.
#[derive(Debug, Clone)]
pub struct IndexSearchResult {
    pub metric: DistanceMetric,
    pub hits: Vec<IndexHit>,
}

/// Client for the external vector-index service.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Add an embedding tagged with the relational record id; returns
    /// the external point id.
    async fn add(&self, embedding: &[f32], record_id: i64) -> Result<String>;

    /// Similarity search, optionally restricted to a candidate set of
    /// external ids.
    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        restrict_to: Option<&[String]>,
    ) -> Result<IndexSearchResult>;

    /// Drop every point in the collection. Idempotent.
    async fn clear(&self) -> Result<()>;
}

/// Relational side of vector storage.
#[async_trait]
pub trait VectorMetadataStore: Send + Sync {
    /// Insert a record with null external id; returns the record id.
    async fn insert_record(
        &self,
        metadata: &serde_json::Value,
        source_id: &str,
        chunk_id: Option<&str>,
    ) -> Result<i64>;

    /// Backfill the external id once the index insert succeeded. Fails
    /// if the record already has one.
    async fn attach_external_id(&self, record_id: i64, external_id: &str) -> Result<()>;

    /// External ids of records matching `filter`. Records with a null
    /// external id are never included.
    async fn searchable_ids(&self, filter: Option<&VectorFilter>) -> Result<Vec<String>>;

    async fn records_by_external_ids(&self, ids: &[String]) -> Result<Vec<VectorRecord>>;

    /// Delete every record. Idempotent.
    async fn clear_records(&self) -> Result<()>;
}

/// Rescale raw index scores into `[0, 1]` relevance.
///
/// Cosine similarity maps linearly from `[-1, 1]`; euclidean distance
/// inverts so zero distance is 1.0; inner product (and anything
/// unrecognized upstream) is min-max scaled within the result set, with
/// an all-equal set mapping to 1.0.
pub fn normalize_relevance(metric: DistanceMetric, scores: &[f64]) -> Vec<f64> {
    match metric {
        DistanceMetric::Cosine => scores
            .iter()
            .map(|s| ((s + 1.0) / 2.0).clamp(0.0, 1.0))
            .collect(),
        DistanceMetric::Euclidean => scores.iter().map(|d| 1.0 / (1.0 + d.max(0.0))).collect(),
        DistanceMetric::InnerProduct => {
            let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            if scores.is_empty() {
                return Vec::new();
            }
            if (max - min).abs() < f64::EPSILON {
                return vec![1.0; scores.len()];
            }
            scores.iter().map(|s| (s - min) / (max - min)).collect()
        }
    }
}

/// Whether a stored metadata document satisfies the filter's key/value
/// pairs. Non-string JSON values compare by their canonical rendering.
pub fn metadata_matches(filter: &VectorFilter, metadata: &serde_json::Value) -> bool {
    filter.metadata.iter().all(|(key, want)| {
        match metadata.get(key) {
            Some(serde_json::Value::String(s)) => s == want,
            Some(other) => other.to_string() == *want,
            None => false,
        }
    })
}

/// Coordinates the relational metadata store and the external index.
pub struct VectorBridge<M, I> {
    meta: M,
    index: I,
}

impl<M: VectorMetadataStore, I: VectorIndex> VectorBridge<M, I> {
    pub fn new(meta: M, index: I) -> Self {
        Self { meta, index }
    }

    /// Two-phase write: relational row first (null external id), then
    /// the index insert, then the external-id backfill. A failure after
    /// the first phase leaves an inert, non-searchable row behind; the
    /// error is surfaced and the row is not rolled back.
    pub async fn store(
        &self,
        embedding: &[f32],
        metadata: serde_json::Value,
        source_id: &str,
    ) -> Result<i64> {
        let chunk_id = metadata
            .get("chunk_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let record_id = self
            .meta
            .insert_record(&metadata, source_id, chunk_id.as_deref())
            .await?;

        let external_id = match self.index.add(embedding, record_id).await {
            Ok(id) => id,
            Err(e) => {
                warn!(record_id, "index insert failed; record stays non-searchable");
                return Err(e);
            }
        };
        self.meta.attach_external_id(record_id, &external_id).await?;
        Ok(record_id)
    }

    /// Filter-then-search: resolve the relational filter to a candidate
    /// id set, short-circuit on an empty set, search the index, rescale
    /// scores, and join back to the relational records.
    pub async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorMatch>> {
        let restrict = match filter {
            Some(f) if !f.is_empty() => {
                let ids = self.meta.searchable_ids(Some(f)).await?;
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                Some(ids)
            }
            _ => None,
        };

        let result = self
            .index
            .search(embedding, top_k, restrict.as_deref())
            .await?;
        if result.hits.is_empty() {
            return Ok(Vec::new());
        }

        let scores: Vec<f64> = result.hits.iter().map(|h| h.score).collect();
        let relevance = normalize_relevance(result.metric, &scores);

        let ids: Vec<String> = result.hits.iter().map(|h| h.external_id.clone()).collect();
        let records = self.meta.records_by_external_ids(&ids).await?;
        let by_external: HashMap<&str, &VectorRecord> = records
            .iter()
            .filter_map(|r| r.external_id.as_deref().map(|e| (e, r)))
            .collect();

        let mut matches = Vec::new();
        for (hit, relevance) in result.hits.iter().zip(relevance) {
            let Some(record) = by_external.get(hit.external_id.as_str()) else {
                debug!(external_id = %hit.external_id, "index hit without a relational record");
                continue;
            };
            matches.push(VectorMatch {
                record_id: record.id,
                external_id: hit.external_id.clone(),
                source_id: record.source_id.clone(),
                chunk_id: record.chunk_id.clone(),
                metadata: record.metadata.clone(),
                relevance,
            });
        }
        matches.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(Ordering::Equal)
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    /// Clear the index first, then the relational rows; a failed index
    /// clear leaves the rows intact for a retry.
    pub async fn clear(&self) -> Result<()> {
        self.index.clear().await?;
        self.meta.clear_records().await
    }
}
