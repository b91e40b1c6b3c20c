//! Vector index backends.
//!
//! [`VectorIndex`] is the narrow surface the writer and the readiness prober
//! need from a vector store: collection management, batched inserts with a
//! per-object error report, and single-object write/read/delete for probes.
//!
//! Two implementations ship with the crate:
//!
//! - [`WeaviateIndex`]: Weaviate over its REST API. Embeddings are computed
//!   server-side from the `content` property by the `text2vec-ollama` module.
//! - [`InMemoryIndex`]: a process-local store with injectable failures, used
//!   by tests and dry runs.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::IndexConfig;
use crate::error::{Result, SpiderError};
use crate::models::IndexRecord;

/// Result of one batch submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub inserted: usize,
    /// One message per object the index rejected.
    pub errors: Vec<String>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection with the fixed property schema if it does not
    /// exist. Returns `true` when it was created.
    async fn ensure_collection(&self) -> Result<bool>;

    /// Drop the collection and everything in it. Returns `false` when there
    /// was nothing to drop.
    async fn delete_collection(&self) -> Result<bool>;

    async fn insert_batch(&self, records: &[IndexRecord]) -> Result<BatchOutcome>;

    /// Write one entry and return its id.
    async fn insert_one(&self, record: &IndexRecord) -> Result<String>;

    async fn exists(&self, id: &str) -> Result<bool>;

    async fn delete_by_id(&self, id: &str) -> Result<bool>;
}

/// Property schema of the collection: `(name, data type)`.
pub const PROPERTIES: &[(&str, &str)] = &[
    ("content", "text"),
    ("name", "text"),
    ("type", "text"),
    ("object_id", "text"),
    ("page", "int"),
    ("chunk_id", "int"),
    ("site_id", "text"),
    ("site_name", "text"),
    ("size", "int"),
    ("created_at", "date"),
    ("created_by_id", "text"),
    ("updated_at", "date"),
    ("updated_by_id", "text"),
    ("link", "text"),
];

/// Entry properties as a JSON object, with null fields left out.
pub fn record_properties(record: &IndexRecord) -> Result<Value> {
    let mut value = serde_json::to_value(record)?;
    if let Value::Object(map) = &mut value {
        map.retain(|_, v| !v.is_null());
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Weaviate

pub struct WeaviateIndex {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    collection: String,
    vectorizer_endpoint: Option<String>,
    vectorizer_model: Option<String>,
}

impl WeaviateIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.resolved_api_key(),
            collection: config.collection.clone(),
            vectorizer_endpoint: config.vectorizer_endpoint.clone(),
            vectorizer_model: config.vectorizer_model.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Class definition sent on creation.
    pub fn class_definition(&self) -> Value {
        let mut ollama = serde_json::Map::new();
        if let Some(endpoint) = &self.vectorizer_endpoint {
            ollama.insert("apiEndpoint".into(), json!(endpoint));
        }
        if let Some(model) = &self.vectorizer_model {
            ollama.insert("model".into(), json!(model));
        }

        let properties: Vec<Value> = PROPERTIES
            .iter()
            .map(|(name, data_type)| {
                json!({
                    "name": name,
                    "dataType": [data_type],
                    "moduleConfig": {
                        "text2vec-ollama": { "skip": *name != "content" }
                    }
                })
            })
            .collect();

        json!({
            "class": self.collection,
            "vectorizer": "text2vec-ollama",
            "moduleConfig": { "text2vec-ollama": ollama },
            "properties": properties,
        })
    }

    async fn error_for(response: reqwest::Response, what: &str) -> SpiderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        SpiderError::Index(format!("{} failed: HTTP {}: {}", what, status, body))
    }

    fn object_body(&self, record: &IndexRecord) -> Result<Value> {
        let mut body = json!({
            "class": self.collection,
            "properties": record_properties(record)?,
        });
        if let Some(id) = &record.id {
            body["id"] = json!(id);
        }
        Ok(body)
    }
}

/// Error messages from a `/v1/batch/objects` response, one per failed object.
pub fn batch_errors(response: &Value) -> Vec<String> {
    let Some(items) = response.as_array() else {
        return vec!["malformed batch response".to_string()];
    };
    items
        .iter()
        .filter_map(|item| {
            let errors = item.pointer("/result/errors/error")?.as_array()?;
            if errors.is_empty() {
                return None;
            }
            let messages: Vec<&str> = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect();
            Some(messages.join("; "))
        })
        .collect()
}

#[async_trait]
impl VectorIndex for WeaviateIndex {
    async fn ensure_collection(&self) -> Result<bool> {
        let path = format!("/v1/schema/{}", self.collection);
        let resp = self.request(reqwest::Method::GET, &path).send().await?;
        if resp.status().is_success() {
            return Ok(false);
        }
        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Self::error_for(resp, "schema lookup").await);
        }

        let resp = self
            .request(reqwest::Method::POST, "/v1/schema")
            .json(&self.class_definition())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp, "collection creation").await);
        }
        info!(collection = %self.collection, "collection created");
        Ok(true)
    }

    async fn delete_collection(&self) -> Result<bool> {
        let path = format!("/v1/schema/{}", self.collection);
        let resp = self.request(reqwest::Method::DELETE, &path).send().await?;
        match resp.status() {
            s if s.is_success() => {
                info!(collection = %self.collection, "collection deleted");
                Ok(true)
            }
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::error_for(resp, "collection deletion").await),
        }
    }

    async fn insert_batch(&self, records: &[IndexRecord]) -> Result<BatchOutcome> {
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let objects = records
            .iter()
            .map(|r| self.object_body(r))
            .collect::<Result<Vec<_>>>()?;

        let resp = self
            .request(reqwest::Method::POST, "/v1/batch/objects")
            .json(&json!({ "objects": objects }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp, "batch insert").await);
        }
        let body: Value = resp.json().await?;
        let errors = batch_errors(&body);
        debug!(submitted = records.len(), errors = errors.len(), "batch submitted");
        Ok(BatchOutcome {
            inserted: records.len().saturating_sub(errors.len()),
            errors,
        })
    }

    async fn insert_one(&self, record: &IndexRecord) -> Result<String> {
        let resp = self
            .request(reqwest::Method::POST, "/v1/objects")
            .json(&self.object_body(record)?)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp, "object insert").await);
        }
        let body: Value = resp.json().await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SpiderError::Index("object insert returned no id".to_string()))
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let path = format!("/v1/objects/{}/{}", self.collection, id);
        let resp = self.request(reqwest::Method::GET, &path).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::error_for(resp, "object lookup").await),
        }
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let path = format!("/v1/objects/{}/{}", self.collection, id);
        let resp = self.request(reqwest::Method::DELETE, &path).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::error_for(resp, "object deletion").await),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory

#[derive(Default)]
struct MemoryState {
    collection: bool,
    entries: BTreeMap<String, (u64, IndexRecord)>,
    next_seq: u64,
    batch_failures: Vec<usize>,
    failing_calls: usize,
    failing_reads: usize,
}

/// Process-local index. Entries keep insertion order. Batches overwrite an
/// explicit id that is already present; `insert_one` rejects it, as Weaviate
/// does for `POST /v1/objects`.
#[derive(Default)]
pub struct InMemoryIndex {
    state: Mutex<MemoryState>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `insert_batch` call reject its first `errors` records.
    pub fn fail_next_batch(&self, errors: usize) {
        self.lock().batch_failures.push(errors);
    }

    /// Make the next `n` single-object calls (`insert_one`, `exists`) fail
    /// with an index error, as a backend that is still warming up would.
    pub fn fail_next_calls(&self, n: usize) {
        self.lock().failing_calls = n;
    }

    /// Make the next `n` `exists` calls fail, leaving inserts working.
    pub fn fail_next_reads(&self, n: usize) {
        self.lock().failing_reads = n;
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> Vec<IndexRecord> {
        let state = self.lock();
        let mut all: Vec<&(u64, IndexRecord)> = state.entries.values().collect();
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_collection(&self) -> bool {
        self.lock().collection
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means another test thread panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_call_failure(state: &mut MemoryState) -> Result<()> {
        if state.failing_calls > 0 {
            state.failing_calls -= 1;
            return Err(SpiderError::Index("index not ready".to_string()));
        }
        Ok(())
    }

    fn store(state: &mut MemoryState, record: &IndexRecord) -> String {
        let id = record
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let seq = match state.entries.get(&id) {
            Some((seq, _)) => *seq,
            None => {
                state.next_seq += 1;
                state.next_seq
            }
        };
        let mut stored = record.clone();
        stored.id = Some(id.clone());
        state.entries.insert(id.clone(), (seq, stored));
        id
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn ensure_collection(&self) -> Result<bool> {
        let mut state = self.lock();
        let created = !state.collection;
        state.collection = true;
        Ok(created)
    }

    async fn delete_collection(&self) -> Result<bool> {
        let mut state = self.lock();
        let existed = state.collection;
        state.collection = false;
        state.entries.clear();
        Ok(existed)
    }

    async fn insert_batch(&self, records: &[IndexRecord]) -> Result<BatchOutcome> {
        let mut state = self.lock();
        let failing = if state.batch_failures.is_empty() {
            0
        } else {
            state.batch_failures.remove(0)
        };
        let mut outcome = BatchOutcome::default();
        for (i, record) in records.iter().enumerate() {
            if i < failing {
                outcome
                    .errors
                    .push(format!("rejected object {} of {}", record.chunk_id, record.metadata.object_id));
            } else {
                Self::store(&mut state, record);
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn insert_one(&self, record: &IndexRecord) -> Result<String> {
        let mut state = self.lock();
        Self::take_call_failure(&mut state)?;
        if let Some(id) = &record.id {
            if state.entries.contains_key(id) {
                return Err(SpiderError::Index(format!("object insert failed: id '{}' already exists", id)));
            }
        }
        Ok(Self::store(&mut state, record))
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let mut state = self.lock();
        Self::take_call_failure(&mut state)?;
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(SpiderError::Index("object lookup failed: HTTP 500".to_string()));
        }
        Ok(state.entries.contains_key(id))
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        Ok(self.lock().entries.remove(id).is_some())
    }
}
