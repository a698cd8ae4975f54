//! # search-sync core
//!
//! Pure logic shared by the `ssync` service: the row and document models,
//! the row → document transform, the backoff policy arithmetic, and the
//! watermark tracker that decides which timestamp is safe to persist after
//! each loaded batch.
//!
//! This crate performs no I/O and has no async runtime dependency. Every
//! datastore concern (PostgreSQL, Elasticsearch, Redis, SQLite) lives in the
//! `search-sync` crate.

pub mod backoff;
pub mod models;
pub mod transform;
pub mod watermark;
