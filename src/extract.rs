//! Extraction stage: pages changed rows of one monitored table.
//!
//! An [`ExtractionPass`] holds one change stream open for the duration of a
//! polling cycle and hands out batches until the stream is exhausted.
//! "Nothing changed" is reported as [`Extraction::NoWork`], never as an
//! empty batch, so callers cannot mistake it for a batch to commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use search_sync_core::models::ChangeRecord;

use crate::error::SyncError;
use crate::source::{ChangeFeed, ChangeStream};

pub struct Extractor {
    feed: Arc<dyn ChangeFeed>,
    table: String,
    batch_size: usize,
}

impl Extractor {
    pub fn new(feed: Arc<dyn ChangeFeed>, table: impl Into<String>, batch_size: usize) -> Self {
        Self {
            feed,
            table: table.into(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Open a pass over rows changed after `watermark`.
    pub async fn begin(&self, watermark: DateTime<Utc>) -> Result<ExtractionPass, SyncError> {
        let stream = self.feed.open_changes(&self.table, watermark).await?;
        tracing::debug!(table = %self.table, since = %watermark, "extraction pass opened");
        Ok(ExtractionPass {
            stream: Some(stream),
            batch_size: self.batch_size,
        })
    }
}

/// One page of changes, ordered by `(updated_at, id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub records: Vec<ChangeRecord>,
    /// The source has nothing beyond this batch.
    pub exhausted: bool,
}

impl ChangeBatch {
    /// Candidate watermark: the latest `updated_at` in the batch.
    pub fn max_updated_at(&self) -> Option<DateTime<Utc>> {
        self.records.iter().map(|r| r.updated_at).max()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    NoWork,
    Batch(ChangeBatch),
}

pub struct ExtractionPass {
    /// `None` once the stream has been drained and released.
    stream: Option<Box<dyn ChangeStream>>,
    batch_size: usize,
}

impl ExtractionPass {
    pub async fn next(&mut self) -> Result<Extraction, SyncError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Extraction::NoWork);
        };
        let records = stream.next_batch(self.batch_size).await?;
        if records.is_empty() {
            self.release().await;
            return Ok(Extraction::NoWork);
        }
        let exhausted = records.len() < self.batch_size;
        if exhausted {
            self.release().await;
        }
        Ok(Extraction::Batch(ChangeBatch { records, exhausted }))
    }

    /// Close the pass, releasing the stream if it is still open.
    pub async fn finish(mut self) {
        self.release().await;
    }

    async fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.close().await {
                tracing::warn!(error = %e, "failed to close change stream");
            }
        }
    }
}
