//! Bulk indexer client.
//!
//! Speaks the Elasticsearch/OpenSearch bulk protocol over HTTP: NDJSON
//! bodies, per-item responses. Chunks are bounded by action count and by
//! rendered bytes, submitted with bounded concurrency, and retried with
//! exponential backoff when the failure is retryable.

use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{self, TryStreamExt};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use crate::error::IndexerError;
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    /// Upsert one document by id.
    Index { id: String, document: JsonValue },
    /// Remove one document by id.
    Delete { id: String },
}

impl BulkAction {
    /// NDJSON lines for this action, newline-terminated.
    pub fn render(&self) -> String {
        match self {
            BulkAction::Index { id, document } => {
                format!(
                    "{}\n{}\n",
                    json!({"index": {"_id": id}}),
                    serde_json::to_string(document).expect("documents are valid json")
                )
            }
            BulkAction::Delete { id } => format!("{}\n", json!({"delete": {"_id": id}})),
        }
    }
}

/// Split rendered actions into bulk bodies bounded by count and bytes.
pub fn chunk_bodies(actions: &[BulkAction], max_count: usize, max_bytes: usize) -> Vec<String> {
    let mut bodies = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;

    for action in actions {
        let rendered = action.render();
        let over_count = count + 1 > max_count;
        let over_bytes = !current.is_empty() && current.len() + rendered.len() > max_bytes;
        if over_count || over_bytes {
            bodies.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push_str(&rendered);
        count += 1;
    }
    if !current.is_empty() {
        bodies.push(current);
    }
    bodies
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Map<String, JsonValue>>,
}

/// Classify a bulk response: any retryable item failure retries the whole
/// chunk; otherwise the first error is fatal for the batch.
fn classify_response(response: &BulkResponse) -> Result<(), IndexerError> {
    if !response.errors {
        return Ok(());
    }

    let mut first_fatal: Option<(u16, String)> = None;
    for item in &response.items {
        for outcome in item.values() {
            let status = outcome
                .get("status")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0) as u16;
            let Some(error) = outcome.get("error") else {
                continue;
            };
            if status == 429 || status >= 500 {
                return Err(IndexerError::Retryable { status });
            }
            if first_fatal.is_none() {
                first_fatal = Some((status, error.to_string()));
            }
        }
    }

    match first_fatal {
        Some((status, reason)) => Err(IndexerError::Fatal { status, reason }),
        // The errors flag was set but no item carried one; treat as
        // retryable noise.
        None => Err(IndexerError::Retryable { status: 0 }),
    }
}

#[derive(Clone)]
pub struct Indexer {
    client: reqwest::Client,
    base_url: String,
    chunk_size: usize,
    max_chunk_bytes: usize,
    thread_count: usize,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Indexer {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.elasticsearch_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: settings.elasticsearch_url.trim_end_matches('/').to_string(),
            chunk_size: settings.elasticsearch_chunk_size.max(1),
            max_chunk_bytes: settings.elasticsearch_max_chunk_bytes,
            thread_count: settings.elasticsearch_thread_count.max(1),
            max_retries: settings.elasticsearch_max_retries,
            initial_backoff: settings.elasticsearch_initial_backoff,
            max_backoff: settings.elasticsearch_max_backoff,
        })
    }

    /// Submit a batch of actions against one index. Chunks run with
    /// bounded concurrency; the call returns once every chunk is
    /// acknowledged or the first non-recoverable failure surfaces.
    pub async fn bulk(&self, index: &str, actions: &[BulkAction]) -> Result<(), IndexerError> {
        if actions.is_empty() {
            return Ok(());
        }
        let bodies = chunk_bodies(actions, self.chunk_size, self.max_chunk_bytes);
        debug!(index, actions = actions.len(), chunks = bodies.len(), "bulk submit");

        stream::iter(bodies.into_iter().map(Ok))
            .try_for_each_concurrent(self.thread_count, |body| async move {
                self.submit_with_retry(index, body).await
            })
            .await
    }

    /// Remove every document in the index; used for TRUNCATE on the pivot.
    pub async fn delete_all(&self, index: &str) -> Result<(), IndexerError> {
        let url = format!("{}/{}/_delete_by_query?conflicts=proceed", self.base_url, index);
        let response = self
            .client
            .post(&url)
            .json(&json!({"query": {"match_all": {}}}))
            .send()
            .await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(IndexerError::from_status(status, reason));
        }
        Ok(())
    }

    /// Make indexed documents visible; tests and one-shot runs use this to
    /// observe a consistent index.
    pub async fn refresh(&self, index: &str) -> Result<(), IndexerError> {
        let url = format!("{}/{}/_refresh", self.base_url, index);
        let response = self.client.post(&url).send().await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(IndexerError::from_status(status, reason));
        }
        Ok(())
    }

    async fn submit_with_retry(&self, index: &str, body: String) -> Result<(), IndexerError> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;

        loop {
            match self.submit(index, body.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(index, attempt, error = %e, "bulk chunk failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn submit(&self, index: &str, body: String) -> Result<(), IndexerError> {
        let url = format!("{}/{}/_bulk", self.base_url, index);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(IndexerError::from_status(status, reason));
        }

        let parsed: BulkResponse = response.json().await?;
        classify_response(&parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_index_action() {
        let action = BulkAction::Index {
            id: "9788374950978".to_string(),
            document: json!({"isbn": "9788374950978", "title": "Kafka on the Shore"}),
        };
        let rendered = action.render();
        let mut lines = rendered.lines();
        assert_eq!(
            serde_json::from_str::<JsonValue>(lines.next().unwrap()).unwrap(),
            json!({"index": {"_id": "9788374950978"}})
        );
        assert_eq!(
            serde_json::from_str::<JsonValue>(lines.next().unwrap()).unwrap(),
            json!({"isbn": "9788374950978", "title": "Kafka on the Shore"})
        );
        assert!(rendered.ends_with('\n'));
    }

    #[test]
    fn test_render_delete_action() {
        let action = BulkAction::Delete {
            id: "9781471331435".to_string(),
        };
        assert_eq!(
            serde_json::from_str::<JsonValue>(action.render().trim()).unwrap(),
            json!({"delete": {"_id": "9781471331435"}})
        );
    }

    #[test]
    fn test_chunk_by_count() {
        let actions: Vec<BulkAction> = (0..5)
            .map(|i| BulkAction::Delete { id: i.to_string() })
            .collect();
        let bodies = chunk_bodies(&actions, 2, usize::MAX);
        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[0].lines().count(), 2);
        assert_eq!(bodies[2].lines().count(), 1);
    }

    #[test]
    fn test_chunk_by_bytes() {
        let actions: Vec<BulkAction> = (0..3)
            .map(|i| BulkAction::Index {
                id: i.to_string(),
                document: json!({"filler": "x".repeat(100)}),
            })
            .collect();
        let one_action = actions[0].render().len();
        let bodies = chunk_bodies(&actions, usize::MAX, one_action + 1);
        assert_eq!(bodies.len(), 3);
    }

    #[test]
    fn test_oversized_single_action_still_ships() {
        let actions = vec![BulkAction::Index {
            id: "1".to_string(),
            document: json!({"filler": "y".repeat(1000)}),
        }];
        let bodies = chunk_bodies(&actions, 10, 8);
        assert_eq!(bodies.len(), 1);
    }

    #[test]
    fn test_classify_clean_response() {
        let response: BulkResponse = serde_json::from_value(json!({
            "errors": false,
            "items": [{"index": {"_id": "1", "status": 201}}]
        }))
        .unwrap();
        assert!(classify_response(&response).is_ok());
    }

    #[test]
    fn test_classify_retryable_item() {
        let response: BulkResponse = serde_json::from_value(json!({
            "errors": true,
            "items": [
                {"index": {"_id": "1", "status": 201}},
                {"index": {"_id": "2", "status": 429,
                           "error": {"type": "es_rejected_execution_exception"}}}
            ]
        }))
        .unwrap();
        assert!(matches!(
            classify_response(&response).unwrap_err(),
            IndexerError::Retryable { status: 429 }
        ));
    }

    #[test]
    fn test_classify_fatal_item() {
        let response: BulkResponse = serde_json::from_value(json!({
            "errors": true,
            "items": [{"index": {"_id": "1", "status": 400,
                                 "error": {"type": "mapper_parsing_exception"}}}]
        }))
        .unwrap();
        assert!(matches!(
            classify_response(&response).unwrap_err(),
            IndexerError::Fatal { status: 400, .. }
        ));
    }

    #[test]
    fn test_retryable_wins_over_fatal() {
        // A mixed failure retries the whole chunk; the upsert is
        // idempotent so replaying the fatal item is harmless.
        let response: BulkResponse = serde_json::from_value(json!({
            "errors": true,
            "items": [
                {"index": {"_id": "1", "status": 400, "error": {"type": "bad"}}},
                {"index": {"_id": "2", "status": 503, "error": {"type": "unavailable"}}}
            ]
        }))
        .unwrap();
        assert!(matches!(
            classify_response(&response).unwrap_err(),
            IndexerError::Retryable { status: 503 }
        ));
    }
}
