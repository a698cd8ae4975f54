//! In-memory [`ChangeFeed`] for tests and fixture-driven dry runs.
//!
//! Tables are vectors of [`MemoryRow`]s keyed by table name, laid out like
//! the relational schema (`film_work`, `genre`, `person`, `genre_film_work`,
//! `person_film_work`). Joins for document rows are done by scanning.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use search_sync_core::models::{
    ChangeRecord, DocumentKind, FilmCredit, FilmworkRow, GenreRef, GenreRow, PersonCredit,
    PersonRow, SourceRow,
};

use crate::adapter::{guarded, Datastore, Faults};
use crate::backoff::BackoffPolicy;
use crate::error::StoreError;

use super::{ChangeFeed, ChangeStream};

const STORE: &str = "memory-source";

/// One table row: key, modification time, and any other columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRow {
    pub id: Uuid,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MemoryRow {
    pub fn new(id: Uuid, updated_at: DateTime<Utc>) -> Self {
        Self {
            id,
            updated_at,
            fields: Map::new(),
        }
    }

    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(column.to_string(), value.into());
        self
    }

    fn text(&self, column: &str) -> Option<String> {
        match self.fields.get(column)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    fn uuid(&self, column: &str) -> Option<Uuid> {
        self.fields.get(column)?.as_str()?.parse().ok()
    }
}

pub struct MemorySource {
    policy: BackoffPolicy,
    tables: RwLock<HashMap<String, Vec<MemoryRow>>>,
    faults: Faults,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl MemorySource {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            tables: RwLock::new(HashMap::new()),
            faults: Faults::default(),
        }
    }

    /// Load tables from a JSON object of `{"table": [rows...]}`.
    pub fn from_fixture(path: &Path, policy: BackoffPolicy) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixture {}", path.display()))?;
        let tables: HashMap<String, Vec<MemoryRow>> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse fixture {}", path.display()))?;
        let source = Self::new(policy);
        *source.tables.write().unwrap_or_else(|e| e.into_inner()) = tables;
        Ok(source)
    }

    /// Insert or replace a row by id.
    pub fn upsert(&self, table: &str, row: MemoryRow) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let rows = tables.entry(table.to_string()).or_default();
        match rows.iter_mut().find(|r| r.id == row.id) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    fn rows(&self, table: &str) -> Vec<MemoryRow> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(table).cloned().unwrap_or_default()
    }

    fn movie_rows(&self, ids: &[Uuid]) -> Vec<SourceRow> {
        let genres: HashMap<Uuid, MemoryRow> =
            self.rows("genre").into_iter().map(|r| (r.id, r)).collect();
        let persons: HashMap<Uuid, MemoryRow> =
            self.rows("person").into_iter().map(|r| (r.id, r)).collect();
        let genre_links = self.rows("genre_film_work");
        let person_links = self.rows("person_film_work");
        let films: HashMap<Uuid, MemoryRow> =
            self.rows("film_work").into_iter().map(|r| (r.id, r)).collect();

        ids.iter()
            .filter_map(|id| films.get(id))
            .map(|fw| {
                let genres = genre_links
                    .iter()
                    .filter(|l| l.uuid("film_work_id") == Some(fw.id))
                    .filter_map(|l| genres.get(&l.uuid("genre_id")?))
                    .map(|g| GenreRef {
                        id: g.id,
                        name: g.text("name").unwrap_or_default(),
                    })
                    .collect();
                let persons = person_links
                    .iter()
                    .filter(|l| l.uuid("film_work_id") == Some(fw.id))
                    .filter_map(|l| {
                        let p = persons.get(&l.uuid("person_id")?)?;
                        Some(PersonCredit {
                            id: p.id,
                            name: p.text("full_name").unwrap_or_default(),
                            role: l.text("role").unwrap_or_default(),
                        })
                    })
                    .collect();
                SourceRow::Filmwork(FilmworkRow {
                    id: fw.id,
                    title: fw.text("title").unwrap_or_default(),
                    description: fw.text("description"),
                    rating: fw.text("rating"),
                    kind: fw.text("type"),
                    genres,
                    persons,
                })
            })
            .collect()
    }

    fn genre_rows(&self, ids: &[Uuid]) -> Vec<SourceRow> {
        let genres: HashMap<Uuid, MemoryRow> =
            self.rows("genre").into_iter().map(|r| (r.id, r)).collect();
        ids.iter()
            .filter_map(|id| genres.get(id))
            .map(|g| {
                SourceRow::Genre(GenreRow {
                    id: g.id,
                    name: g.text("name").unwrap_or_default(),
                    description: g.text("description"),
                })
            })
            .collect()
    }

    fn person_rows(&self, ids: &[Uuid]) -> Vec<SourceRow> {
        let persons: HashMap<Uuid, MemoryRow> =
            self.rows("person").into_iter().map(|r| (r.id, r)).collect();
        let films: HashMap<Uuid, MemoryRow> =
            self.rows("film_work").into_iter().map(|r| (r.id, r)).collect();
        let links = self.rows("person_film_work");
        ids.iter()
            .filter_map(|id| persons.get(id))
            .map(|p| {
                let credits = links
                    .iter()
                    .filter(|l| l.uuid("person_id") == Some(p.id))
                    .filter_map(|l| {
                        let fw = films.get(&l.uuid("film_work_id")?)?;
                        Some(FilmCredit {
                            film_id: fw.id,
                            title: fw.text("title").unwrap_or_default(),
                            role: l.text("role").unwrap_or_default(),
                        })
                    })
                    .collect();
                SourceRow::Person(PersonRow {
                    id: p.id,
                    full_name: p.text("full_name").unwrap_or_default(),
                    credits,
                })
            })
            .collect()
    }

    fn roots(&self, table: &str, root_column: &str, keep: impl Fn(&MemoryRow) -> bool) -> Vec<Uuid> {
        let mut seen = HashSet::new();
        let mut out: Vec<Uuid> = self
            .rows(table)
            .iter()
            .filter(|r| keep(r))
            .filter_map(|r| r.uuid(root_column))
            .filter(|id| seen.insert(*id))
            .collect();
        out.sort();
        out
    }
}

#[async_trait]
impl Datastore for MemorySource {
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
impl ChangeFeed for MemorySource {
    async fn open_changes(
        &self,
        table: &str,
        since: DateTime<Utc>,
    ) -> Result<Box<dyn ChangeStream>, StoreError> {
        guarded(self, "open_changes", move || async move {
            self.faults.check(STORE, "open_changes")?;
            let mut records: Vec<ChangeRecord> = self
                .rows(table)
                .iter()
                .filter(|r| r.updated_at > since)
                .map(|r| ChangeRecord::new(r.id, r.updated_at))
                .collect();
            records.sort();
            Ok(Box::new(MemoryChangeStream {
                pending: records.into(),
            }) as Box<dyn ChangeStream>)
        })
        .await
    }

    async fn related_roots(
        &self,
        junction: &str,
        related_column: &str,
        root_column: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Uuid>, StoreError> {
        guarded(self, "related_roots", move || async move {
            self.faults.check(STORE, "related_roots")?;
            Ok(self.roots(junction, root_column, |r| {
                r.uuid(related_column).is_some_and(|id| ids.contains(&id))
            }))
        })
        .await
    }

    async fn junction_roots(
        &self,
        junction: &str,
        root_column: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Uuid>, StoreError> {
        guarded(self, "junction_roots", move || async move {
            self.faults.check(STORE, "junction_roots")?;
            Ok(self.roots(junction, root_column, |r| ids.contains(&r.id)))
        })
        .await
    }

    async fn load_rows(
        &self,
        kind: DocumentKind,
        ids: &[Uuid],
    ) -> Result<Vec<SourceRow>, StoreError> {
        guarded(self, "load_rows", move || async move {
            self.faults.check(STORE, "load_rows")?;
            Ok(match kind {
                DocumentKind::Movie => self.movie_rows(ids),
                DocumentKind::Genre => self.genre_rows(ids),
                DocumentKind::Person => self.person_rows(ids),
            })
        })
        .await
    }
}

struct MemoryChangeStream {
    pending: VecDeque<ChangeRecord>,
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
    async fn next_batch(&mut self, size: usize) -> Result<Vec<ChangeRecord>, StoreError> {
        let n = size.min(self.pending.len());
        Ok(self.pending.drain(..n).collect())
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
