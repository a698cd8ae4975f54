//! Elasticsearch sink over the REST API.
//!
//! Documents are written with `index` bulk actions keyed by document id, so
//! re-sending a document replaces it wholesale and repeated loads converge
//! on the same index content.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::adapter::{guarded, Datastore};
use crate::backoff::BackoffPolicy;
use crate::error::{classify_status, ErrorClass, StoreError};

use super::{BulkItem, BulkReport, ItemFailure, SearchSink};

const STORE: &str = "elasticsearch";

pub struct ElasticsearchSink {
    base_url: String,
    timeout: Duration,
    policy: BackoffPolicy,
    client: RwLock<Option<reqwest::Client>>,
}

impl ElasticsearchSink {
    pub fn new(base_url: &str, timeout: Duration, policy: BackoffPolicy) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            policy,
            client: RwLock::new(None),
        }
    }

    fn client(&self) -> Result<reqwest::Client, StoreError> {
        let guard = self.client.read().unwrap_or_else(|e| e.into_inner());
        guard
            .clone()
            .ok_or_else(|| StoreError::connection(STORE, "not connected"))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn ping(&self, client: &reqwest::Client) -> Result<(), StoreError> {
        let resp = client
            .get(self.url("/"))
            .send()
            .await
            .map_err(|e| StoreError::connection(STORE, format!("ping: {e}")))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        match classify_status(status.as_u16()) {
            ErrorClass::Fatal => Err(StoreError::fatal(STORE, "ping", format!("HTTP {status}"))),
            ErrorClass::Transient => Err(StoreError::connection(STORE, format!("ping: HTTP {status}"))),
        }
    }
}

async fn status_error(op: &'static str, resp: reqwest::Response) -> StoreError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    StoreError::new(
        classify_status(status.as_u16()),
        STORE,
        op,
        format!("HTTP {status}: {}", truncate(&body, 512)),
    )
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

fn transport(op: &'static str) -> impl Fn(reqwest::Error) -> StoreError {
    move |e| StoreError::from_reqwest(STORE, op, e)
}

/// Build the newline-delimited bulk body.
pub fn bulk_body(items: &[BulkItem]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for item in items {
        let action = json!({ "index": { "_index": item.index, "_id": item.id } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&item.document)?);
        body.push('\n');
    }
    Ok(body)
}

/// Interpret a bulk response body.
///
/// Items rejected with a retryable status (429 or 5xx) make the whole chunk
/// a transient error so the caller re-sends it; other rejections are
/// reported per item.
pub fn parse_bulk_response(resp: &Value) -> Result<BulkReport, StoreError> {
    let items = resp
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| StoreError::fatal(STORE, "bulk", "response has no items"))?;

    let mut report = BulkReport::default();
    let mut retryable = 0usize;
    for entry in items {
        let Some(result) = entry.as_object().and_then(|o| o.values().next()) else {
            continue;
        };
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
        if (200..300).contains(&status) {
            report.indexed += 1;
            continue;
        }
        if status == 429 || status >= 500 {
            retryable += 1;
        }
        let reason = result
            .get("error")
            .map(|e| match e.get("reason").and_then(Value::as_str) {
                Some(reason) => format!(
                    "{}: {reason}",
                    e.get("type").and_then(Value::as_str).unwrap_or("error")
                ),
                None => e.to_string(),
            })
            .unwrap_or_else(|| format!("HTTP {status}"));
        report.failures.push(ItemFailure {
            id: result
                .get("_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status,
            reason,
        });
    }
    if retryable > 0 {
        return Err(StoreError::transient(
            STORE,
            "bulk",
            format!("{retryable} item(s) throttled or unavailable"),
        ));
    }
    Ok(report)
}

#[async_trait]
impl Datastore for ElasticsearchSink {
    fn name(&self) -> &'static str {
        STORE
    }

    fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    async fn open(&self) -> Result<(), StoreError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| StoreError::fatal(STORE, "connect", e.to_string()))?;
        self.ping(&client).await?;
        *self.client.write().unwrap_or_else(|e| e.into_inner()) = Some(client);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.client() {
            Ok(client) => self.ping(&client).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn close(&self) {
        self.client.write().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[async_trait]
impl SearchSink for ElasticsearchSink {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn index_exists(&self, name: &str) -> Result<bool, StoreError> {
        guarded(self, "index_exists", move || async move {
            let resp = self
                .client()?
                .head(self.url(name))
                .send()
                .await
                .map_err(transport("index_exists"))?;
            match resp.status() {
                s if s.is_success() => Ok(true),
                StatusCode::NOT_FOUND => Ok(false),
                _ => Err(status_error("index_exists", resp).await),
            }
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self, schema))]
    async fn index_create(&self, name: &str, schema: &Value) -> Result<(), StoreError> {
        guarded(self, "index_create", move || async move {
            let resp = self
                .client()?
                .put(self.url(name))
                .json(schema)
                .send()
                .await
                .map_err(transport("index_create"))?;
            if resp.status().is_success() {
                return Ok(());
            }
            let err = status_error("index_create", resp).await;
            if err.to_string().contains("resource_already_exists_exception") {
                return Ok(());
            }
            Err(err)
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self, items), fields(count = items.len()))]
    async fn bulk(&self, items: &[BulkItem]) -> Result<BulkReport, StoreError> {
        if items.is_empty() {
            return Ok(BulkReport::default());
        }
        let body = bulk_body(items).map_err(|e| StoreError::fatal(STORE, "bulk", e.to_string()))?;
        let body = body.as_str();
        guarded(self, "bulk", move || async move {
            let resp = self
                .client()?
                .post(self.url("/_bulk"))
                .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                .body(body.to_string())
                .send()
                .await
                .map_err(transport("bulk"))?;
            if !resp.status().is_success() {
                return Err(status_error("bulk", resp).await);
            }
            let json: Value = resp.json().await.map_err(transport("bulk"))?;
            parse_bulk_response(&json)
        })
        .await
    }
}
