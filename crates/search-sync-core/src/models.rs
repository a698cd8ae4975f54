//! Data models that flow through a sync pipeline.
//!
//! Rows come out of the relational source ([`SourceRow`]), are transformed
//! into search documents ([`Document`]), and the per-pipeline progress marker
//! is persisted as a [`SyncState`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Seconds from the Unix epoch to `0001-01-01T00:00:00Z`.
const MIN_WATERMARK_SECS: i64 = -62_135_596_800;

/// The watermark a pipeline starts from before its first successful load.
///
/// This is the earliest instant PostgreSQL `timestamptz` and every supported
/// state backend can represent, so every real row compares greater than it.
pub fn min_watermark() -> DateTime<Utc> {
    DateTime::from_timestamp(MIN_WATERMARK_SECS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Persisted progress of one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub entity_type: String,
    pub watermark: DateTime<Utc>,
}

impl SyncState {
    pub fn initial(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            watermark: min_watermark(),
        }
    }
}

/// A changed row as reported by the source: its key and modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChangeRecord {
    pub updated_at: DateTime<Utc>,
    pub id: Uuid,
}

impl ChangeRecord {
    pub fn new(id: Uuid, updated_at: DateTime<Utc>) -> Self {
        Self { updated_at, id }
    }
}

/// The document shape a pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Movie,
    Genre,
    Person,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Movie => "movie",
            DocumentKind::Genre => "genre",
            DocumentKind::Person => "person",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Participation of a person in a film work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Actor,
    Director,
    Writer,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "actor" => Ok(Role::Actor),
            "director" => Ok(Role::Director),
            "writer" => Ok(Role::Writer),
            other => Err(other.to_string()),
        }
    }
}

// ============ Source rows ============

/// Genre reference aggregated onto a film work row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenreRef {
    pub id: Uuid,
    pub name: String,
}

/// Person credit aggregated onto a film work row. `role` is kept raw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonCredit {
    pub id: Uuid,
    pub name: String,
    pub role: String,
}

/// Film work with its genres and credits already joined.
#[derive(Debug, Clone, PartialEq)]
pub struct FilmworkRow {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    /// Rating as text, exactly as the source stores it. Parsed during transform.
    pub rating: Option<String>,
    pub kind: Option<String>,
    pub genres: Vec<GenreRef>,
    pub persons: Vec<PersonCredit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenreRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

/// Film credit aggregated onto a person row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilmCredit {
    pub film_id: Uuid,
    pub title: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersonRow {
    pub id: Uuid,
    pub full_name: String,
    pub credits: Vec<FilmCredit>,
}

/// One combined source record, ready for transformation.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRow {
    Filmwork(FilmworkRow),
    Genre(GenreRow),
    Person(PersonRow),
}

impl SourceRow {
    pub fn id(&self) -> Uuid {
        match self {
            SourceRow::Filmwork(row) => row.id,
            SourceRow::Genre(row) => row.id,
            SourceRow::Person(row) => row.id,
        }
    }
}

// ============ Documents ============

/// `{id, name}` pair embedded in movie documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedRef {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovieDocument {
    pub id: Uuid,
    pub imdb_rating: Option<f64>,
    pub title: String,
    pub description: Option<String>,
    pub filmwork_type: Option<String>,
    pub genres_names: Vec<String>,
    pub genres: Vec<NamedRef>,
    pub directors_names: Vec<String>,
    pub actors_names: Vec<String>,
    pub writers_names: Vec<String>,
    pub directors: Vec<NamedRef>,
    pub actors: Vec<NamedRef>,
    pub writers: Vec<NamedRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenreDocument {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonFilm {
    pub id: Uuid,
    pub title: String,
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonDocument {
    pub id: Uuid,
    pub full_name: String,
    pub films: Vec<PersonFilm>,
}

/// A search document, keyed by the id of its root row.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Movie(MovieDocument),
    Genre(GenreDocument),
    Person(PersonDocument),
}

impl Document {
    pub fn id(&self) -> Uuid {
        match self {
            Document::Movie(doc) => doc.id,
            Document::Genre(doc) => doc.id,
            Document::Person(doc) => doc.id,
        }
    }

    pub fn kind(&self) -> DocumentKind {
        match self {
            Document::Movie(_) => DocumentKind::Movie,
            Document::Genre(_) => DocumentKind::Genre,
            Document::Person(_) => DocumentKind::Person,
        }
    }

    /// Document body as sent to the search index.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Document::Movie(doc) => serde_json::to_value(doc),
            Document::Genre(doc) => serde_json::to_value(doc),
            Document::Person(doc) => serde_json::to_value(doc),
        }
    }
}
