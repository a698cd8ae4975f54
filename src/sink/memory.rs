//! In-memory [`SearchSink`] for tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::adapter::{guarded, Datastore, Faults};
use crate::backoff::BackoffPolicy;
use crate::error::StoreError;

use super::{BulkItem, BulkReport, ItemFailure, SearchSink};

const STORE: &str = "memory-sink";

pub struct MemorySink {
    policy: BackoffPolicy,
    faults: Faults,
    schemas: RwLock<HashMap<String, Value>>,
    docs: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    rejected_ids: RwLock<HashSet<String>>,
    calls: Mutex<Vec<usize>>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl MemorySink {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            faults: Faults::default(),
            schemas: RwLock::new(HashMap::new()),
            docs: RwLock::new(HashMap::new()),
            rejected_ids: RwLock::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Make the index reject these document ids with a 400.
    pub fn reject_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rejected = self.rejected_ids.write().unwrap_or_else(|e| e.into_inner());
        rejected.clear();
        rejected.extend(ids.into_iter().map(Into::into));
    }

    /// Sizes of the bulk requests that reached the index, in order.
    pub fn bulk_calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        docs.get(index)?.get(id).cloned()
    }

    pub fn count(&self, index: &str) -> usize {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        docs.get(index).map_or(0, BTreeMap::len)
    }

    /// Every document in `index`, ordered by id.
    pub fn documents(&self, index: &str) -> Vec<Value> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        docs.get(index)
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default()
    }

    fn apply(&self, items: &[BulkItem]) -> BulkReport {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(items.len());
        let rejected = self.rejected_ids.read().unwrap_or_else(|e| e.into_inner());
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        let mut report = BulkReport::default();
        for item in items {
            if rejected.contains(&item.id) {
                report.failures.push(ItemFailure {
                    id: item.id.clone(),
                    status: 400,
                    reason: "document rejected".into(),
                });
                continue;
            }
            docs.entry(item.index.clone())
                .or_default()
                .insert(item.id.clone(), item.document.clone());
            report.indexed += 1;
        }
        report
    }
}

#[async_trait]
impl Datastore for MemorySink {
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
impl SearchSink for MemorySink {
    async fn index_exists(&self, name: &str) -> Result<bool, StoreError> {
        guarded(self, "index_exists", move || async move {
            self.faults.check(STORE, "index_exists")?;
            let schemas = self.schemas.read().unwrap_or_else(|e| e.into_inner());
            Ok(schemas.contains_key(name))
        })
        .await
    }

    async fn index_create(&self, name: &str, schema: &Value) -> Result<(), StoreError> {
        guarded(self, "index_create", move || async move {
            self.faults.check(STORE, "index_create")?;
            let mut schemas = self.schemas.write().unwrap_or_else(|e| e.into_inner());
            schemas
                .entry(name.to_string())
                .or_insert_with(|| schema.clone());
            Ok(())
        })
        .await
    }

    async fn bulk(&self, items: &[BulkItem]) -> Result<BulkReport, StoreError> {
        if items.is_empty() {
            return Ok(BulkReport::default());
        }
        guarded(self, "bulk", move || async move {
            self.faults.check(STORE, "bulk")?;
            Ok(self.apply(items))
        })
        .await
    }
}
