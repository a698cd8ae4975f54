//! Enrichment stage: from changed rows to fully joined root rows.
//!
//! A change to a related row (a genre, a person) or to a junction row must
//! re-index every root document embedding it. The enricher maps the changed
//! ids to root ids according to the pipeline's [`Resolution`] and then loads
//! each root with its complete current relationship set.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use search_sync_core::models::{ChangeRecord, DocumentKind, SourceRow};

use crate::config::Resolution;
use crate::error::SyncError;
use crate::source::ChangeFeed;

pub struct Enricher {
    feed: Arc<dyn ChangeFeed>,
    /// Monitored table; the junction itself for [`Resolution::Junction`].
    table: String,
    resolution: Resolution,
    document: DocumentKind,
    batch_size: usize,
}

impl Enricher {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        table: impl Into<String>,
        resolution: Resolution,
        document: DocumentKind,
        batch_size: usize,
    ) -> Self {
        Self {
            feed,
            table: table.into(),
            resolution,
            document,
            batch_size: batch_size.max(1),
        }
    }

    /// Root ids affected by `records`, deduplicated, first occurrence first.
    pub async fn resolve(&self, records: &[ChangeRecord]) -> Result<Vec<Uuid>, SyncError> {
        let changed: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let mut roots = Vec::with_capacity(changed.len());
        match &self.resolution {
            Resolution::Root => roots = changed,
            Resolution::Related {
                junction,
                related_column,
                root_column,
            } => {
                for ids in changed.chunks(self.batch_size) {
                    roots.extend(
                        self.feed
                            .related_roots(junction, related_column, root_column, ids)
                            .await?,
                    );
                }
            }
            Resolution::Junction { root_column } => {
                for ids in changed.chunks(self.batch_size) {
                    roots.extend(self.feed.junction_roots(&self.table, root_column, ids).await?);
                }
            }
        }
        Ok(dedup(roots))
    }

    /// Load the combined rows for `roots`, in pages of the batch size.
    pub async fn combine(&self, roots: &[Uuid]) -> Result<Vec<SourceRow>, SyncError> {
        let mut rows = Vec::with_capacity(roots.len());
        for ids in roots.chunks(self.batch_size) {
            rows.extend(self.feed.load_rows(self.document, ids).await?);
        }
        Ok(rows)
    }

    pub async fn enrich(&self, records: &[ChangeRecord]) -> Result<Vec<SourceRow>, SyncError> {
        let roots = self.resolve(records).await?;
        if roots.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.combine(&roots).await?;
        tracing::debug!(
            changed = records.len(),
            roots = roots.len(),
            rows = rows.len(),
            "enriched"
        );
        Ok(rows)
    }
}

fn dedup(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
