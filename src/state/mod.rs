//! Persistent pipeline state.
//!
//! A [`StateStore`] is a byte-oriented key-value store. The
//! [`StateManager`] layers the per-pipeline [`SyncState`] on top of it: one
//! key per pipeline, JSON encoded, created lazily at the minimum watermark.
//!
//! | Backend | Type |
//! |---------|------|
//! | Redis | [`redis::RedisStore`] |
//! | SQLite | [`sqlite::SqliteStore`] |
//! | In-memory | [`memory::MemoryStore`] |

pub mod memory;
pub mod redis;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use search_sync_core::models::SyncState;

use crate::adapter::Datastore;
use crate::error::{StoreError, SyncError};

#[async_trait]
pub trait StateStore: Datastore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

pub struct StateManager {
    store: Arc<dyn StateStore>,
    prefix: String,
}

impl StateManager {
    pub fn new(store: Arc<dyn StateStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    fn key(&self, entity: &str) -> String {
        format!("{}{}", self.prefix, entity)
    }

    pub async fn exists(&self, entity: &str) -> Result<bool, SyncError> {
        Ok(self.store.exists(&self.key(entity)).await?)
    }

    /// Stored state, or `None` if this pipeline has never run.
    pub async fn get(&self, entity: &str) -> Result<Option<SyncState>, SyncError> {
        let Some(raw) = self.store.get(&self.key(entity)).await? else {
            return Ok(None);
        };
        let state: SyncState =
            serde_json::from_slice(&raw).map_err(|e| SyncError::CorruptState {
                entity: entity.to_string(),
                message: e.to_string(),
            })?;
        if state.entity_type != entity {
            return Err(SyncError::CorruptState {
                entity: entity.to_string(),
                message: format!("stored state belongs to '{}'", state.entity_type),
            });
        }
        Ok(Some(state))
    }

    /// Overwrite the stored watermark unconditionally.
    pub async fn set(&self, entity: &str, watermark: DateTime<Utc>) -> Result<(), SyncError> {
        let state = SyncState {
            entity_type: entity.to_string(),
            watermark,
        };
        let raw = serde_json::to_vec(&state).map_err(|e| SyncError::CorruptState {
            entity: entity.to_string(),
            message: e.to_string(),
        })?;
        self.store.set(&self.key(entity), &raw).await?;
        Ok(())
    }

    /// Stored state, initialising it at the minimum watermark on first use.
    pub async fn ensure(&self, entity: &str) -> Result<SyncState, SyncError> {
        if let Some(state) = self.get(entity).await? {
            return Ok(state);
        }
        let state = SyncState::initial(entity);
        self.set(entity, state.watermark).await?;
        tracing::info!(entity, watermark = %state.watermark, "initialised sync state");
        Ok(state)
    }

    /// Move the watermark forward. A watermark at or behind the stored one
    /// is ignored. Returns whether the state changed.
    pub async fn advance(&self, entity: &str, watermark: DateTime<Utc>) -> Result<bool, SyncError> {
        let current = self.ensure(entity).await?;
        if watermark <= current.watermark {
            tracing::debug!(entity, stored = %current.watermark, offered = %watermark, "watermark not advanced");
            return Ok(false);
        }
        self.set(entity, watermark).await?;
        tracing::debug!(entity, watermark = %watermark, "watermark advanced");
        Ok(true)
    }

    /// Put the pipeline back at the minimum watermark.
    pub async fn reset(&self, entity: &str) -> Result<(), SyncError> {
        self.set(entity, SyncState::initial(entity).watermark).await
    }
}
