//! Pipeline runner.
//!
//! One [`Pipeline`] per configured entity. Each polling cycle opens an
//! extraction pass from the stored watermark and pushes every batch through
//! enrich → transform → load before pulling the next one:
//!
//! ```text
//! Initializing → Polling ⇄ Extracting → Enriching → Transforming → Loading
//!                   ↑                                                  │
//!                   └──────────────── watermark advance ───────────────┘
//! ```
//!
//! Transient store failures are retried inside the adapters. A failure that
//! survives the retry budget fails the cycle (the watermark stays put and
//! the next cycle starts over); a fatal one stops the pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use search_sync_core::watermark::WatermarkTracker;

use crate::enrich::Enricher;
use crate::error::SyncError;
use crate::extract::{Extraction, ExtractionPass, Extractor};
use crate::load::Loader;
use crate::state::StateManager;
use crate::transform::Transformer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Initializing,
    Polling,
    Extracting,
    Enriching,
    Transforming,
    Loading,
    Stopped,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Initializing => "initializing",
            PipelineState::Polling => "polling",
            PipelineState::Extracting => "extracting",
            PipelineState::Enriching => "enriching",
            PipelineState::Transforming => "transforming",
            PipelineState::Loading => "loading",
            PipelineState::Stopped => "stopped",
        }
    }
}

/// What one polling cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub batches: usize,
    pub changes: usize,
    pub indexed: usize,
    pub rejected: usize,
    /// Last watermark committed during the cycle.
    pub watermark: Option<DateTime<Utc>>,
}

pub struct Pipeline {
    name: String,
    state: Arc<StateManager>,
    extractor: Extractor,
    enricher: Enricher,
    transformer: Transformer,
    loader: Loader,
    poll_interval: Duration,
    max_failed_cycles: u32,
    phase: PipelineState,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        state: Arc<StateManager>,
        extractor: Extractor,
        enricher: Enricher,
        loader: Loader,
    ) -> Self {
        let name = name.into();
        Self {
            transformer: Transformer::new(name.clone()),
            name,
            state,
            extractor,
            enricher,
            loader,
            poll_interval: Duration::from_secs(5),
            max_failed_cycles: 0,
            phase: PipelineState::Initializing,
        }
    }

    /// Sleep between cycles and the consecutive-failure limit (0 = none).
    pub fn with_polling(mut self, poll_interval: Duration, max_failed_cycles: u32) -> Self {
        self.poll_interval = poll_interval;
        self.max_failed_cycles = max_failed_cycles;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> PipelineState {
        self.phase
    }

    fn enter(&mut self, phase: PipelineState) {
        if self.phase != phase {
            tracing::trace!(from = self.phase.as_str(), to = phase.as_str(), "state transition");
            self.phase = phase;
        }
    }

    /// Run until `shutdown` turns true, a fatal error occurs, or the
    /// failed-cycle limit is reached. Shutdown is honoured between cycles
    /// and between batches, never in the middle of a load.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
        self.enter(PipelineState::Initializing);
        tracing::info!(
            table = self.extractor.table(),
            index = self.loader.index(),
            "pipeline started"
        );
        if let Err(e) = self.state.ensure(&self.name).await {
            if e.is_fatal() {
                return Err(self.stop_fatally(e));
            }
            tracing::warn!(error = %e, "could not initialise state, will retry on first cycle");
        }

        let mut failed = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_cycle(&shutdown).await {
                Ok(report) => {
                    failed = 0;
                    if report.batches > 0 {
                        tracing::info!(
                            batches = report.batches,
                            changes = report.changes,
                            indexed = report.indexed,
                            rejected = report.rejected,
                            watermark = ?report.watermark,
                            "cycle complete"
                        );
                    } else {
                        tracing::debug!("no changes");
                    }
                }
                Err(e) if e.is_fatal() => return Err(self.stop_fatally(e)),
                Err(e) => {
                    failed += 1;
                    tracing::error!(
                        error = %e,
                        failed_cycles = failed,
                        "cycle failed, watermark not advanced"
                    );
                    if self.max_failed_cycles > 0 && failed >= self.max_failed_cycles {
                        tracing::error!(limit = self.max_failed_cycles, "too many failed cycles, pipeline stopped");
                        self.enter(PipelineState::Stopped);
                        return Err(e);
                    }
                }
            }

            self.enter(PipelineState::Polling);
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.enter(PipelineState::Stopped);
        tracing::info!("pipeline stopped");
        Ok(())
    }

    fn stop_fatally(&mut self, e: SyncError) -> SyncError {
        tracing::error!(error = %e, "fatal error, pipeline stopped");
        self.enter(PipelineState::Stopped);
        e
    }

    /// One polling cycle: drain every change since the stored watermark.
    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) -> Result<CycleReport, SyncError> {
        self.enter(PipelineState::Polling);
        let state = self.state.ensure(&self.name).await?;
        self.enter(PipelineState::Extracting);
        let mut pass = self.extractor.begin(state.watermark).await?;
        let result = self.drain(&mut pass, shutdown).await;
        pass.finish().await;
        self.enter(PipelineState::Polling);
        result
    }

    async fn drain(
        &mut self,
        pass: &mut ExtractionPass,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleReport, SyncError> {
        let mut tracker = WatermarkTracker::new();
        let mut report = CycleReport::default();
        loop {
            self.enter(PipelineState::Extracting);
            let batch = match pass.next().await? {
                Extraction::NoWork => {
                    if let Some(watermark) = tracker.finish() {
                        self.enter(PipelineState::Loading);
                        if let Some(committed) = self.loader.commit(watermark).await? {
                            report.watermark = Some(committed);
                        }
                    }
                    break;
                }
                Extraction::Batch(batch) => batch,
            };
            report.batches += 1;
            report.changes += batch.records.len();

            self.enter(PipelineState::Enriching);
            let rows = self.enricher.enrich(&batch.records).await?;

            self.enter(PipelineState::Transforming);
            let transformed = self.transformer.transform(rows);
            report.rejected += transformed.rejected.len();

            self.enter(PipelineState::Loading);
            let pending = tracker.batch_loaded(&batch.records, batch.exhausted);
            let outcome = self.loader.load(&transformed.documents, pending).await?;
            report.indexed += outcome.indexed;
            if outcome.committed.is_some() {
                report.watermark = outcome.committed;
            }

            if batch.exhausted {
                break;
            }
            if *shutdown.borrow() {
                tracing::info!("shutdown requested, ending pass after current batch");
                break;
            }
        }
        Ok(report)
    }
}
