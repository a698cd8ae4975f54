//! Decides which watermark may be persisted after each loaded batch.
//!
//! Changes arrive ordered by `(updated_at, id)`. When a batch ends in the
//! middle of a run of rows sharing one timestamp, persisting that timestamp
//! would skip the unseen rows of the run after a restart. The tracker
//! therefore commits only timestamps strictly below the last one seen, and
//! defers the last one until the stream is exhausted.

use chrono::{DateTime, Utc};

use crate::models::ChangeRecord;

#[derive(Debug, Clone, Default)]
pub struct WatermarkTracker {
    deferred: Option<DateTime<Utc>>,
}

impl WatermarkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fully loaded batch and return the watermark that is now safe
    /// to persist, if any.
    ///
    /// `exhausted` means the source had no rows beyond this batch.
    pub fn batch_loaded(
        &mut self,
        records: &[ChangeRecord],
        exhausted: bool,
    ) -> Option<DateTime<Utc>> {
        let Some(max) = records.iter().map(|r| r.updated_at).max() else {
            return self.finish();
        };
        if exhausted {
            self.deferred = None;
            return Some(max);
        }
        let safe = self
            .deferred
            .into_iter()
            .chain(records.iter().map(|r| r.updated_at))
            .filter(|t| *t < max)
            .max();
        self.deferred = Some(max);
        safe
    }

    /// The stream ended without a final non-empty batch: everything seen so
    /// far is complete.
    pub fn finish(&mut self) -> Option<DateTime<Utc>> {
        self.deferred.take()
    }

    pub fn deferred(&self) -> Option<DateTime<Utc>> {
        self.deferred
    }
}
