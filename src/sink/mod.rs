//! Search index sinks.
//!
//! A [`SearchSink`] knows how to check for and create an index and how to
//! send one bulk request. [`chunked_bulk`] splits a document set into
//! fixed-size chunks and sends them in order under a [`ChunkPolicy`].

pub mod elasticsearch;
pub mod memory;

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use search_sync_core::models::DocumentKind;

use crate::adapter::Datastore;
use crate::error::{ErrorClass, StoreError, SyncError};

/// One document addressed to an index.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    pub index: String,
    pub id: String,
    pub document: Value,
}

/// A document the index refused.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub id: String,
    /// HTTP status of the item, or 0 when the whole request failed.
    pub status: u16,
    pub reason: String,
}

/// Outcome of a single bulk request that reached the index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkReport {
    pub indexed: usize,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub chunk_size: usize,
    /// Abort on the first failed chunk instead of recording and moving on.
    pub raise_on_error: bool,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            raise_on_error: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkSummary {
    pub chunks: usize,
    pub failed_chunks: usize,
    pub indexed: usize,
    pub failures: Vec<ItemFailure>,
}

impl BulkSummary {
    pub fn is_complete(&self) -> bool {
        self.failed_chunks == 0 && self.failures.is_empty()
    }
}

#[async_trait]
pub trait SearchSink: Datastore {
    async fn index_exists(&self, name: &str) -> Result<bool, StoreError>;

    /// Create `name` with `schema`. Creating an existing index is not an error.
    async fn index_create(&self, name: &str, schema: &Value) -> Result<(), StoreError>;

    /// Send one bulk request. Items rejected individually are reported in
    /// the [`BulkReport`]; the call only errors when the request itself fails.
    async fn bulk(&self, items: &[BulkItem]) -> Result<BulkReport, StoreError>;
}

/// Send `items` in chunks of `policy.chunk_size`, in order.
///
/// With `raise_on_error` the first failed chunk aborts the remaining ones.
/// Otherwise failures are logged, collected in the summary, and the next
/// chunk is sent. A fatal store error always aborts.
pub async fn chunked_bulk<S: SearchSink + ?Sized>(
    sink: &S,
    items: &[BulkItem],
    policy: &ChunkPolicy,
) -> Result<BulkSummary, SyncError> {
    let mut summary = BulkSummary::default();
    for (n, chunk) in items.chunks(policy.chunk_size.max(1)).enumerate() {
        summary.chunks += 1;
        let index = chunk.first().map(|i| i.index.clone()).unwrap_or_default();
        match sink.bulk(chunk).await {
            Ok(report) => {
                summary.indexed += report.indexed;
                if report.failures.is_empty() {
                    tracing::debug!(chunk = n, size = chunk.len(), "chunk indexed");
                    continue;
                }
                if policy.raise_on_error {
                    return Err(SyncError::PartialLoad {
                        index,
                        failures: report.failures,
                    });
                }
                tracing::error!(
                    chunk = n,
                    index = %index,
                    rejected = report.failures.len(),
                    "chunk partially rejected, continuing"
                );
                summary.failed_chunks += 1;
                summary.failures.extend(report.failures);
            }
            Err(e) if policy.raise_on_error || e.class() == ErrorClass::Fatal => {
                return Err(e.into());
            }
            Err(e) => {
                tracing::error!(chunk = n, index = %index, error = %e, "chunk failed, continuing");
                summary.failed_chunks += 1;
                summary.failures.extend(chunk.iter().map(|item| ItemFailure {
                    id: item.id.clone(),
                    status: 0,
                    reason: e.to_string(),
                }));
            }
        }
    }
    Ok(summary)
}

/// Default index definition for a document kind.
pub fn builtin_schema(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Movie => include_str!("../../schemas/movies.json"),
        DocumentKind::Genre => include_str!("../../schemas/genres.json"),
        DocumentKind::Person => include_str!("../../schemas/persons.json"),
    }
}

/// Index definition from `path` if given, else the built-in one.
pub fn load_schema(kind: DocumentKind, path: Option<&Path>) -> Result<Value> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read index schema {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid index schema {}", path.display()))
        }
        None => serde_json::from_str(builtin_schema(kind))
            .with_context(|| format!("invalid built-in {kind} schema")),
    }
}

/// Create `index` unless it already exists. Returns whether it was created.
pub async fn ensure_index<S: SearchSink + ?Sized>(
    sink: &S,
    index: &str,
    schema: &Value,
) -> Result<bool, StoreError> {
    if sink.index_exists(index).await? {
        return Ok(false);
    }
    sink.index_create(index, schema).await?;
    tracing::info!(index, "index created");
    Ok(true)
}
