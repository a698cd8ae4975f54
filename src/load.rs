//! Load stage: bulk-index documents, then commit the watermark.
//!
//! The watermark only moves after every chunk of the batch was accepted.
//! Any failed chunk or rejected item holds the whole batch back so the next
//! cycle re-reads it from the previous watermark.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use search_sync_core::models::Document;

use crate::error::SyncError;
use crate::sink::{chunked_bulk, BulkItem, ChunkPolicy, SearchSink};
use crate::state::StateManager;

pub struct Loader {
    sink: Arc<dyn SearchSink>,
    state: Arc<StateManager>,
    entity: String,
    index: String,
    policy: ChunkPolicy,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadOutcome {
    pub indexed: usize,
    /// Watermark persisted by this load, if it moved.
    pub committed: Option<DateTime<Utc>>,
}

impl Loader {
    pub fn new(
        sink: Arc<dyn SearchSink>,
        state: Arc<StateManager>,
        entity: impl Into<String>,
        index: impl Into<String>,
        policy: ChunkPolicy,
    ) -> Self {
        Self {
            sink,
            state,
            entity: entity.into(),
            index: index.into(),
            policy,
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn items(&self, documents: &[Document]) -> Vec<BulkItem> {
        documents
            .iter()
            .filter_map(|doc| match doc.to_json() {
                Ok(body) => Some(BulkItem {
                    index: self.index.clone(),
                    id: doc.id().to_string(),
                    document: body,
                }),
                Err(e) => {
                    tracing::warn!(entity = %self.entity, id = %doc.id(), error = %e, "document not serialisable, skipped");
                    None
                }
            })
            .collect()
    }

    /// Index `documents`, then advance the watermark to `pending`.
    pub async fn load(
        &self,
        documents: &[Document],
        pending: Option<DateTime<Utc>>,
    ) -> Result<LoadOutcome, SyncError> {
        let mut outcome = LoadOutcome::default();
        if !documents.is_empty() {
            let items = self.items(documents);
            let summary = chunked_bulk(self.sink.as_ref(), &items, &self.policy).await?;
            if !summary.is_complete() {
                return Err(SyncError::PartialLoad {
                    index: self.index.clone(),
                    failures: summary.failures,
                });
            }
            outcome.indexed = summary.indexed;
            tracing::debug!(
                entity = %self.entity,
                index = %self.index,
                chunks = summary.chunks,
                indexed = summary.indexed,
                "batch indexed"
            );
        }
        if let Some(watermark) = pending {
            outcome.committed = self.commit(watermark).await?;
        }
        Ok(outcome)
    }

    /// Persist `watermark` if it is ahead of the stored one.
    pub async fn commit(&self, watermark: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, SyncError> {
        if self.state.advance(&self.entity, watermark).await? {
            Ok(Some(watermark))
        } else {
            Ok(None)
        }
    }
}
