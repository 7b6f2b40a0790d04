//! HTTP client for the external vector-index service.
//!
//! Deployed index services answer one of two request shapes depending
//! on version. [`HttpVectorIndex::search`] tries them in a fixed order:
//! the points-search endpoint, the legacy collection-query endpoint,
//! and finally the points-search endpoint again on a freshly built
//! client (a stale keep-alive connection can poison the first client
//! after a service restart). Only when every attempt fails does one
//! normalized `ExternalIndex` error surface.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use seekwell_core::bridge::{DistanceMetric, IndexHit, IndexSearchResult, VectorIndex};
use seekwell_core::{Result, StoreError};

use crate::config::IndexConfig;

pub struct HttpVectorIndex {
    base_url: String,
    collection: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpVectorIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = build_client(timeout)?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            timeout,
            client,
        })
    }

    fn points_url(&self) -> String {
        format!("{}/collections/{}/points", self.base_url, self.collection)
    }

    async fn search_points(
        &self,
        client: &reqwest::Client,
        embedding: &[f32],
        top_k: usize,
        restrict_to: Option<&[String]>,
    ) -> std::result::Result<IndexSearchResult, String> {
        let mut body = json!({
            "vector": embedding,
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(ids) = restrict_to {
            body["filter"] = json!({ "must": [{ "has_id": ids }] });
        }
        let response = client
            .post(format!("{}/search", self.points_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("points search request failed: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("points search returned {status}"));
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("points search returned invalid JSON: {e}"))?;
        parse_search_response(&value)
    }

    async fn search_legacy(
        &self,
        embedding: &[f32],
        top_k: usize,
        restrict_to: Option<&[String]>,
    ) -> std::result::Result<IndexSearchResult, String> {
        let mut body = json!({
            "query": embedding,
            "top": top_k,
        });
        if let Some(ids) = restrict_to {
            body["ids"] = json!(ids);
        }
        let response = self
            .client
            .post(format!(
                "{}/collections/{}/query",
                self.base_url, self.collection
            ))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("legacy query request failed: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("legacy query returned {status}"));
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("legacy query returned invalid JSON: {e}"))?;
        parse_search_response(&value)
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| StoreError::Configuration(format!("cannot build HTTP client: {e}")))
}

fn parse_metric(raw: Option<&str>) -> DistanceMetric {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("l2") | Some("euclid") | Some("euclidean") => DistanceMetric::Euclidean,
        Some("dot") | Some("ip") | Some("inner_product") => DistanceMetric::InnerProduct,
        // Cosine is the deployment default and the safe fallback.
        _ => DistanceMetric::Cosine,
    }
}

/// Accepts both response layouts: a bare hit array, or hits nested under
/// `result` (optionally under `result.points`). The metric may ride
/// alongside as `metric` or `distance`.
fn parse_search_response(
    value: &serde_json::Value,
) -> std::result::Result<IndexSearchResult, String> {
    let metric_raw = value
        .get("metric")
        .or_else(|| value.get("distance"))
        .or_else(|| value.get("result").and_then(|r| r.get("metric")))
        .and_then(|m| m.as_str());
    let metric = parse_metric(metric_raw);

    let container = value.get("result").unwrap_or(value);
    let hits_value = if container.is_array() {
        container
    } else {
        container
            .get("points")
            .or_else(|| container.get("hits"))
            .ok_or_else(|| String::from("response carries no hit array"))?
    };
    let items = hits_value
        .as_array()
        .ok_or_else(|| String::from("hits are not an array"))?;

    let mut hits = Vec::with_capacity(items.len());
    for item in items {
        let external_id = match item.get("id") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err("hit without an id".into()),
        };
        let score = item
            .get("score")
            .or_else(|| item.get("distance"))
            .and_then(|s| s.as_f64())
            .ok_or_else(|| String::from("hit without a numeric score"))?;
        hits.push(IndexHit { external_id, score });
    }
    Ok(IndexSearchResult { metric, hits })
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn add(&self, embedding: &[f32], record_id: i64) -> Result<String> {
        let point_id = Uuid::new_v4().to_string();
        let body = json!({
            "points": [{
                "id": point_id,
                "vector": embedding,
                "payload": { "record_id": record_id },
            }]
        });
        let response = self
            .client
            .post(self.points_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::ExternalIndex(format!("point insert failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::ExternalIndex(format!(
                "point insert returned {status}"
            )));
        }
        Ok(point_id)
    }

    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        restrict_to: Option<&[String]>,
    ) -> Result<IndexSearchResult> {
        let primary = match self
            .search_points(&self.client, embedding, top_k, restrict_to)
            .await
        {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        debug!(error = %primary, "points search failed; trying legacy query shape");

        let legacy = match self.search_legacy(embedding, top_k, restrict_to).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        debug!(error = %legacy, "legacy query failed; retrying with a fresh client");

        let fresh_client = build_client(self.timeout)?;
        let retry = match self
            .search_points(&fresh_client, embedding, top_k, restrict_to)
            .await
        {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        Err(StoreError::ExternalIndex(format!(
            "all index search attempts failed: {primary}; {legacy}; {retry}"
        )))
    }

    async fn clear(&self) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/delete", self.points_url()))
            .json(&json!({ "filter": {} }))
            .send()
            .await
            .map_err(|e| StoreError::ExternalIndex(format!("point delete failed: {e}")))?;
        let status = response.status();
        // A missing collection means there is nothing to clear.
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !status.is_success() {
            return Err(StoreError::ExternalIndex(format!(
                "point delete returned {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wrapped_result_array() {
        let value = json!({
            "result": [
                { "id": "a", "score": 0.9 },
                { "id": 7, "score": 0.4 },
            ],
            "metric": "cosine",
        });
        let parsed = parse_search_response(&value).unwrap();
        assert_eq!(parsed.metric, DistanceMetric::Cosine);
        assert_eq!(parsed.hits.len(), 2);
        assert_eq!(parsed.hits[0].external_id, "a");
        assert_eq!(parsed.hits[1].external_id, "7");
    }

    #[test]
    fn parses_nested_points_with_distance() {
        let value = json!({
            "result": {
                "points": [ { "id": "x", "distance": 1.5 } ],
                "metric": "l2",
            }
        });
        let parsed = parse_search_response(&value).unwrap();
        assert_eq!(parsed.metric, DistanceMetric::Euclidean);
        assert_eq!(parsed.hits[0].score, 1.5);
    }

    #[test]
    fn parses_bare_hit_array() {
        let value = json!([ { "id": "a", "score": 0.2 } ]);
        let parsed = parse_search_response(&value).unwrap();
        assert_eq!(parsed.hits.len(), 1);
        // No metric advertised: assume cosine.
        assert_eq!(parsed.metric, DistanceMetric::Cosine);
    }

    #[test]
    fn rejects_malformed_hits() {
        assert!(parse_search_response(&json!({"result": [{"score": 0.1}]})).is_err());
        assert!(parse_search_response(&json!({"result": [{"id": "a"}]})).is_err());
        assert!(parse_search_response(&json!({"status": "ok"})).is_err());
    }

    #[test]
    fn metric_names() {
        assert_eq!(parse_metric(Some("Cosine")), DistanceMetric::Cosine);
        assert_eq!(parse_metric(Some("euclidean")), DistanceMetric::Euclidean);
        assert_eq!(parse_metric(Some("dot")), DistanceMetric::InnerProduct);
        assert_eq!(parse_metric(Some("ip")), DistanceMetric::InnerProduct);
        assert_eq!(parse_metric(None), DistanceMetric::Cosine);
        assert_eq!(parse_metric(Some("whatever")), DistanceMetric::Cosine);
    }
}
