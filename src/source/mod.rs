//! Relational source adapters.
//!
//! A [`ChangeFeed`] answers the four questions a pipeline asks of the
//! source database: what changed since a watermark, which root rows a set of
//! related rows touches (through a junction table or directly from one),
//! and what the fully joined root rows look like.
//!
//! | Backend | Type |
//! |---------|------|
//! | PostgreSQL | [`postgres::PostgresSource`] |
//! | In-memory fixture | [`memory::MemorySource`] |

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use search_sync_core::models::{ChangeRecord, DocumentKind, SourceRow};

use crate::adapter::Datastore;
use crate::error::StoreError;

/// Forward-only stream of `(id, updated_at)` pairs ordered by
/// `(updated_at, id)`.
#[async_trait]
pub trait ChangeStream: Send {
    /// Up to `size` further records. Fewer than `size` means the stream is
    /// exhausted; an empty vector means nothing was left.
    async fn next_batch(&mut self, size: usize) -> Result<Vec<ChangeRecord>, StoreError>;

    /// Release server-side resources.
    async fn close(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ChangeFeed: Datastore {
    /// Rows of `table` with `updated_at` strictly after `since`.
    async fn open_changes(
        &self,
        table: &str,
        since: DateTime<Utc>,
    ) -> Result<Box<dyn ChangeStream>, StoreError>;

    /// Root ids linked through `junction` to any of the related `ids`.
    async fn related_roots(
        &self,
        junction: &str,
        related_column: &str,
        root_column: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Root ids referenced by the junction rows `ids` themselves.
    async fn junction_roots(
        &self,
        junction: &str,
        root_column: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Fully joined rows for the given root ids. Missing ids are skipped.
    async fn load_rows(&self, kind: DocumentKind, ids: &[Uuid])
        -> Result<Vec<SourceRow>, StoreError>;
}
