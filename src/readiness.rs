//! Readiness gates run before any ingestion work.
//!
//! [`await_ready`] proves the vector index can take a real write: a probe
//! entry is inserted, read back by id, and deleted. Until that round trip
//! succeeds the call sleeps a fixed interval and tries again, with no upper
//! bound on attempts. [`await_db_ready`] does the same for the ledger
//! database with a `SELECT 1`.

use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, SpiderError};
use crate::index::VectorIndex;
use crate::models::{EntryMetadata, IndexRecord, ObjectType};

/// Synthetic entry used for the round trip. The entry id is left to the
/// index, so every attempt writes a fresh object; `probe_id` only tags it.
pub fn probe_record(probe_id: &str) -> IndexRecord {
    IndexRecord {
        id: None,
        content: "test".to_string(),
        chunk_id: 1,
        metadata: EntryMetadata {
            object_id: probe_id.to_string(),
            object_type: ObjectType::File,
            name: "readiness-probe".to_string(),
            site_id: String::new(),
            site_name: None,
            size: None,
            created_at: None,
            created_by_id: None,
            updated_at: None,
            updated_by_id: None,
            link: None,
        },
    }
}

/// One write/read attempt. An entry that was written but could not be read
/// back is deleted again before the error is returned.
async fn probe_once(index: &dyn VectorIndex, record: &IndexRecord) -> Result<String> {
    let id = index.insert_one(record).await?;
    let read = index.exists(&id).await;
    if let Ok(true) = read {
        return Ok(id);
    }
    if let Err(e) = index.delete_by_id(&id).await {
        warn!(id = %id, error = %e, "could not remove unread probe entry");
    }
    match read {
        Err(e) => Err(e),
        _ => Err(SpiderError::Index(format!("probe entry {} not readable yet", id))),
    }
}

/// Block until the index accepts a write/read/delete round trip.
///
/// Returns the number of failed attempts before success.
pub async fn await_ready(index: &dyn VectorIndex, probe_id: &str, interval: Duration) -> Result<u32> {
    let record = probe_record(probe_id);
    let mut failures = 0u32;

    info!(probe = probe_id, "checking vector index readiness");
    let id = loop {
        match probe_once(index, &record).await {
            Ok(id) => break id,
            Err(e) => warn!(probe = probe_id, error = %e, "probe failed, sleeping"),
        }
        failures += 1;
        tokio::time::sleep(interval).await;
    };

    index.delete_by_id(&id).await?;
    info!(probe = probe_id, failures, "vector index ready");
    Ok(failures)
}

/// Block until the ledger database answers a trivial query.
pub async fn await_db_ready(pool: &SqlitePool, interval: Duration) -> u32 {
    let mut failures = 0u32;
    loop {
        match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => {
                info!(failures, "database ready");
                return failures;
            }
            Err(e) => {
                warn!(error = %e, "database not ready, sleeping");
                failures += 1;
                tokio::time::sleep(interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::index::{InMemoryIndex, WeaviateIndex};
    use axum::extract::{Path as UrlPath, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    const PROBE: &str = "4b0a6c1e-8f5b-4c6e-9a57-3f1b2d9c0e11";

    #[tokio::test(start_paused = true)]
    async fn ready_immediately_does_not_sleep() {
        let index = InMemoryIndex::new();
        let start = Instant::now();
        let failures = await_ready(&index, PROBE, Duration::from_secs(10)).await.unwrap();
        assert_eq!(failures, 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(index.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_mean_two_intervals() {
        let index = InMemoryIndex::new();
        index.fail_next_calls(2);
        let start = Instant::now();

        let failures = await_ready(&index, PROBE, Duration::from_secs(10)).await.unwrap();

        assert_eq!(failures, 2);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
        assert!(index.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_read_back_retries_with_a_new_entry() {
        let index = InMemoryIndex::new();
        index.fail_next_reads(1);
        let start = Instant::now();

        let failures = await_ready(&index, PROBE, Duration::from_secs(10)).await.unwrap();

        assert_eq!(failures, 1);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn round_trip_tags_entry_with_identity() {
        let index = InMemoryIndex::new();
        let id = probe_once(&index, &probe_record(PROBE)).await.unwrap();
        let entries = index.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id.as_deref(), Some(id.as_str()));
        assert_eq!(entries[0].metadata.object_id, PROBE);
    }

    #[derive(Default)]
    struct FakeWeaviate {
        objects: HashSet<String>,
        posts: usize,
        gets: usize,
    }

    type Shared = Arc<Mutex<FakeWeaviate>>;

    async fn create_object(State(state): State<Shared>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        let mut s = state.lock().unwrap();
        s.posts += 1;
        let id = match body.get("id").and_then(Value::as_str) {
            Some(id) if s.objects.contains(id) => {
                return (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({ "error": [{ "message": format!("id '{}' already exists", id) }] })),
                );
            }
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        s.objects.insert(id.clone());
        (StatusCode::OK, Json(json!({ "id": id })))
    }

    async fn read_object(State(state): State<Shared>, UrlPath((_, id)): UrlPath<(String, String)>) -> StatusCode {
        let mut s = state.lock().unwrap();
        s.gets += 1;
        if s.gets == 1 {
            StatusCode::INTERNAL_SERVER_ERROR
        } else if s.objects.contains(&id) {
            StatusCode::OK
        } else {
            StatusCode::NOT_FOUND
        }
    }

    async fn delete_object(State(state): State<Shared>, UrlPath((_, id)): UrlPath<(String, String)>) -> StatusCode {
        if state.lock().unwrap().objects.remove(&id) {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::NOT_FOUND
        }
    }

    #[tokio::test]
    async fn weaviate_read_error_does_not_wedge_the_gate() {
        let state: Shared = Arc::default();
        let app = Router::new()
            .route("/v1/objects", post(create_object))
            .route("/v1/objects/{class}/{id}", get(read_object).delete(delete_object))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let index = WeaviateIndex::new(&IndexConfig {
            url: format!("http://{}", addr),
            api_key: None,
            collection: "Catsearch".into(),
            vectorizer_endpoint: None,
            vectorizer_model: None,
            max_batch_errors: 1,
            deterministic_ids: false,
            timeout_secs: 5,
        })
        .unwrap();

        let failures = tokio::time::timeout(
            Duration::from_secs(5),
            await_ready(&index, PROBE, Duration::from_millis(20)),
        )
        .await
        .expect("readiness gate did not return")
        .unwrap();

        assert_eq!(failures, 1);
        let s = state.lock().unwrap();
        assert_eq!(s.posts, 2);
        assert_eq!(s.gets, 2);
        assert!(s.objects.is_empty());
    }

    #[tokio::test]
    async fn db_ready_on_open_pool() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("r.sqlite"))
            .await
            .unwrap();
        assert_eq!(await_db_ready(&pool, Duration::from_millis(10)).await, 0);
    }
}
