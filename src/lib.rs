//! # Search Sync
//!
//! Incremental replication of a relational catalogue (PostgreSQL) into a
//! search index (Elasticsearch), with per-pipeline progress kept in a
//! key-value state store (Redis, or SQLite for single-node setups).
//!
//! Each pipeline watches one table, maps changed rows to the root documents
//! they affect, rebuilds those documents from the current relational state,
//! bulk-indexes them, and only then advances its watermark.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  changes  ┌──────────┐  rows  ┌───────────┐  docs  ┌──────────┐
//! │ PostgreSQL │──────────▶│ Extract  │──────▶│  Enrich   │──────▶│Transform │
//! └────────────┘           └──────────┘       └───────────┘       └────┬─────┘
//!                                                                      ▼
//!                          ┌──────────┐  watermark  ┌──────────┐  bulk ┌──────────┐
//!                          │  Redis   │◀────────────│   Load   │──────▶│ Elastic  │
//!                          └──────────┘             └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ssync init                    # create indices, initialise watermarks
//! ssync run                     # poll all pipelines until Ctrl-C
//! ssync run --pipeline genre --once
//! ssync status                  # show watermarks
//! ssync reset filmwork          # full re-index of one pipeline
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`backoff`] | Retry with exponential backoff |
//! | [`adapter`] | Datastore lifecycle and the reconnect/retry guard |
//! | [`source`] | Relational change feeds |
//! | [`sink`] | Search index sinks and chunked bulk loading |
//! | [`state`] | State stores and the watermark manager |
//! | [`extract`], [`enrich`], [`transform`], [`load`] | Pipeline stages |
//! | [`pipeline`] | Per-entity state machine |
//! | [`sync`] | Store wiring and CLI commands |
//! | [`db`], [`migrate`] | SQLite state database |

pub mod adapter;
pub mod backoff;
pub mod config;
pub mod db;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod load;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod state;
pub mod sync;
pub mod transform;
