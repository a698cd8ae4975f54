//! Elasticsearch sink against an in-process mock of the REST API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};

use search_sync::adapter::Datastore;
use search_sync::backoff::BackoffPolicy;
use search_sync::error::SyncError;
use search_sync::sink::elasticsearch::ElasticsearchSink;
use search_sync::sink::{chunked_bulk, ensure_index, BulkItem, ChunkPolicy, SearchSink};

#[derive(Default)]
struct Mock {
    indices: Mutex<HashMap<String, Value>>,
    docs: Mutex<HashMap<String, Value>>,
    throttle: AtomicU32,
    bulk_requests: AtomicU32,
}

type Shared = Arc<Mock>;

async fn root() -> Json<Value> {
    Json(json!({ "name": "mock", "version": { "number": "8.13.0" } }))
}

async fn head_index(State(mock): State<Shared>, Path(index): Path<String>) -> StatusCode {
    if mock.indices.lock().unwrap().contains_key(&index) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn put_index(
    State(mock): State<Shared>,
    Path(index): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let mut indices = mock.indices.lock().unwrap();
    if indices.contains_key(&index) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": { "type": "resource_already_exists_exception", "reason": "index exists" },
                "status": 400
            })),
        );
    }
    indices.insert(index.clone(), body);
    (
        StatusCode::OK,
        Json(json!({ "acknowledged": true, "index": index })),
    )
}

async fn bulk(State(mock): State<Shared>, body: String) -> Json<Value> {
    mock.bulk_requests.fetch_add(1, Ordering::SeqCst);
    let throttled = mock
        .throttle
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    let lines: Vec<Value> = body
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let mut items = Vec::new();
    let mut errors = false;
    for pair in lines.chunks(2) {
        let action = &pair[0]["index"];
        let id = action["_id"].as_str().unwrap().to_string();
        let doc = &pair[1];
        let item = if throttled {
            errors = true;
            json!({ "index": { "_id": id, "status": 429,
                "error": { "type": "es_rejected_execution_exception", "reason": "queue full" } } })
        } else if doc.get("reject").is_some() {
            errors = true;
            json!({ "index": { "_id": id, "status": 400,
                "error": { "type": "mapper_parsing_exception", "reason": "failed to parse field [reject]" } } })
        } else {
            let key = format!("{}/{}", action["_index"].as_str().unwrap(), id);
            mock.docs.lock().unwrap().insert(key, doc.clone());
            json!({ "index": { "_id": id, "status": 201, "result": "created" } })
        };
        items.push(item);
    }
    Json(json!({ "took": 1, "errors": errors, "items": items }))
}

async fn serve() -> (String, Shared) {
    let mock: Shared = Arc::new(Mock::default());
    let app = Router::new()
        .route("/", get(root))
        .route("/_bulk", post(bulk))
        .route("/{index}", put(put_index).head(head_index))
        .with_state(mock.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), mock)
}

fn policy() -> BackoffPolicy {
    BackoffPolicy {
        start: Duration::from_millis(10),
        cap: Duration::from_millis(50),
        max_attempts: Some(3),
        ..BackoffPolicy::default()
    }
}

async fn connected(url: &str) -> ElasticsearchSink {
    let sink = ElasticsearchSink::new(url, Duration::from_secs(5), policy());
    sink.connect().await.unwrap();
    sink
}

fn items(n: usize) -> Vec<BulkItem> {
    (0..n)
        .map(|i| BulkItem {
            index: "genres".into(),
            id: format!("g{i}"),
            document: json!({ "id": format!("g{i}"), "name": format!("Genre {i}") }),
        })
        .collect()
}

#[tokio::test]
async fn test_connect_and_probe() {
    let (url, _) = serve().await;
    let sink = connected(&url).await;
    assert!(sink.is_connected().await);
    sink.close().await;
    assert!(!sink.is_connected().await);
    sink.close().await;
}

#[tokio::test]
async fn test_ensure_index_creates_once() {
    let (url, mock) = serve().await;
    let sink = connected(&url).await;
    let schema = json!({ "mappings": { "dynamic": "strict" } });

    assert!(!sink.index_exists("genres").await.unwrap());
    assert!(ensure_index(&sink, "genres", &schema).await.unwrap());
    assert!(sink.index_exists("genres").await.unwrap());
    assert!(!ensure_index(&sink, "genres", &schema).await.unwrap());
    // Racing creator: the index appeared between check and create.
    sink.index_create("genres", &schema).await.unwrap();
    assert_eq!(mock.indices.lock().unwrap()["genres"], schema);
}

#[tokio::test]
async fn test_chunked_bulk_sends_ordered_chunks() {
    let (url, mock) = serve().await;
    let sink = connected(&url).await;
    let policy = ChunkPolicy {
        chunk_size: 2,
        raise_on_error: true,
    };
    let summary = chunked_bulk(&sink, &items(5), &policy).await.unwrap();
    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.indexed, 5);
    assert!(summary.is_complete());
    assert_eq!(mock.bulk_requests.load(Ordering::SeqCst), 3);
    assert_eq!(mock.docs.lock().unwrap()["genres/g4"]["name"], "Genre 4");
}

#[tokio::test]
async fn test_throttled_bulk_is_retried() {
    let (url, mock) = serve().await;
    let sink = connected(&url).await;
    mock.throttle.store(1, Ordering::SeqCst);

    let report = sink.bulk(&items(2)).await.unwrap();
    assert_eq!(report.indexed, 2);
    assert_eq!(mock.bulk_requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejected_item_is_partial_load() {
    let (url, _) = serve().await;
    let sink = connected(&url).await;
    let mut batch = items(3);
    batch[1].document["reject"] = json!(true);

    let report = sink.bulk(&batch).await.unwrap();
    assert_eq!(report.indexed, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, "g1");
    assert_eq!(report.failures[0].status, 400);

    let policy = ChunkPolicy {
        chunk_size: 10,
        raise_on_error: true,
    };
    let err = chunked_bulk(&sink, &batch, &policy).await.unwrap_err();
    assert!(matches!(err, SyncError::PartialLoad { ref index, .. } if index == "genres"));

    let policy = ChunkPolicy {
        chunk_size: 1,
        raise_on_error: false,
    };
    let summary = chunked_bulk(&sink, &batch, &policy).await.unwrap();
    assert_eq!(summary.failed_chunks, 1);
    assert_eq!(summary.indexed, 2);
    assert!(!summary.is_complete());
}

#[tokio::test]
async fn test_unreachable_server_gives_up_after_budget() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let sink = ElasticsearchSink::new(&format!("http://{addr}"), Duration::from_secs(1), policy());
    let err = sink.connect().await.unwrap_err();
    assert!(err.is_connection());
    assert!(!sink.is_connected().await);
}
