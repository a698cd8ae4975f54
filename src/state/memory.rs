//! In-memory [`StateStore`]. State is lost when the process exits.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::adapter::{guarded, Datastore, Faults};
use crate::backoff::BackoffPolicy;
use crate::error::StoreError;

use super::StateStore;

const STORE: &str = "memory-state";

pub struct MemoryStore {
    policy: BackoffPolicy,
    faults: Faults,
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl MemoryStore {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            faults: Faults::default(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Stored bytes for `key`, bypassing the connection state.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    fn name(&self) -> &'static str {
        STORE
    }

    fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    async fn open(&self) -> Result<(), StoreError> {
        self.faults.open(STORE)
    }

    async fn is_connected(&self) -> bool {
        self.faults.is_connected()
    }

    async fn close(&self) {
        self.faults.close();
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        guarded(self, "get", move || async move {
            self.faults.check(STORE, "get")?;
            Ok(self.raw(key))
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        guarded(self, "set", move || async move {
            self.faults.check(STORE, "set")?;
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.insert(key.to_string(), value.to_vec());
            Ok(())
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        guarded(self, "exists", move || async move {
            self.faults.check(STORE, "exists")?;
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            Ok(entries.contains_key(key))
        })
        .await
    }
}
