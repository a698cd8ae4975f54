//! Transform stage: combined rows to search documents.
//!
//! Wraps the pure [`search_sync_core::transform`] mapping and reports the
//! rows it had to skip. A malformed row never fails the batch.

use search_sync_core::models::{Document, SourceRow};
use search_sync_core::transform::{transform_batch, DataError};

pub struct Transformer {
    entity: String,
}

/// Documents produced from one batch and the rows that were skipped.
#[derive(Debug, Default)]
pub struct Transformed {
    pub documents: Vec<Document>,
    pub rejected: Vec<DataError>,
}

impl Transformer {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
        }
    }

    pub fn transform(&self, rows: Vec<SourceRow>) -> Transformed {
        let out = transform_batch(rows);
        for err in &out.rejected {
            tracing::warn!(entity = %self.entity, error = %err, "row skipped");
        }
        Transformed {
            documents: out.documents,
            rejected: out.rejected,
        }
    }
}
