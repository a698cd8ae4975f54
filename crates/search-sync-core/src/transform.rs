//! Row → document transform.
//!
//! Pure and deterministic: the same [`SourceRow`] always yields the same
//! [`Document`]. Name lists are sorted, reference lists are deduplicated by
//! id, so re-loading an unchanged row produces a byte-identical document.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Document, FilmworkRow, GenreDocument, GenreRow, MovieDocument, NamedRef, PersonDocument,
    PersonFilm, PersonRow, Role, SourceRow,
};

/// A row that cannot be turned into a document.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("row {id}: rating {value:?} is not a number")]
    InvalidRating { id: Uuid, value: String },
    #[error("row {id}: empty {field}")]
    Empty { id: Uuid, field: &'static str },
}

/// Result of transforming a batch: documents plus the rows that were skipped.
#[derive(Debug, Default)]
pub struct TransformOutput {
    pub documents: Vec<Document>,
    pub rejected: Vec<DataError>,
}

pub fn transform_batch(rows: Vec<SourceRow>) -> TransformOutput {
    let mut out = TransformOutput::default();
    for row in rows {
        match transform(row) {
            Ok(doc) => out.documents.push(doc),
            Err(e) => out.rejected.push(e),
        }
    }
    out
}

pub fn transform(row: SourceRow) -> Result<Document, DataError> {
    match row {
        SourceRow::Filmwork(row) => movie(row).map(Document::Movie),
        SourceRow::Genre(row) => genre(row).map(Document::Genre),
        SourceRow::Person(row) => person(row).map(Document::Person),
    }
}

/// Parse a textual rating. Missing or blank means "no rating".
pub fn parse_rating(id: Uuid, raw: Option<&str>) -> Result<Option<f64>, DataError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(DataError::InvalidRating {
            id,
            value: raw.to_string(),
        }),
    }
}

fn non_empty(id: Uuid, field: &'static str, value: String) -> Result<String, DataError> {
    if value.trim().is_empty() {
        Err(DataError::Empty { id, field })
    } else {
        Ok(value)
    }
}

/// Dedupe by id, then order by name (id breaks ties).
fn refs(pairs: impl IntoIterator<Item = (Uuid, String)>) -> Vec<NamedRef> {
    let by_id: BTreeMap<Uuid, String> = pairs.into_iter().collect();
    let mut refs: Vec<NamedRef> = by_id
        .into_iter()
        .map(|(id, name)| NamedRef { id, name })
        .collect();
    refs.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    refs
}

fn names(refs: &[NamedRef]) -> Vec<String> {
    refs.iter().map(|r| r.name.clone()).collect()
}

fn movie(row: FilmworkRow) -> Result<MovieDocument, DataError> {
    let imdb_rating = parse_rating(row.id, row.rating.as_deref())?;
    let title = non_empty(row.id, "title", row.title)?;

    let genres = refs(row.genres.into_iter().map(|g| (g.id, g.name)));

    let mut by_role: BTreeMap<Role, Vec<(Uuid, String)>> = BTreeMap::new();
    for credit in row.persons {
        if let Ok(role) = credit.role.parse::<Role>() {
            by_role.entry(role).or_default().push((credit.id, credit.name));
        }
    }
    let mut take = |role| refs(by_role.remove(&role).unwrap_or_default());
    let actors = take(Role::Actor);
    let directors = take(Role::Director);
    let writers = take(Role::Writer);

    Ok(MovieDocument {
        id: row.id,
        imdb_rating,
        title,
        description: row.description,
        filmwork_type: row.kind,
        genres_names: names(&genres),
        genres,
        directors_names: names(&directors),
        actors_names: names(&actors),
        writers_names: names(&writers),
        directors,
        actors,
        writers,
    })
}

fn genre(row: GenreRow) -> Result<GenreDocument, DataError> {
    Ok(GenreDocument {
        id: row.id,
        name: non_empty(row.id, "name", row.name)?,
        description: row.description,
    })
}

fn person(row: PersonRow) -> Result<PersonDocument, DataError> {
    let full_name = non_empty(row.id, "full_name", row.full_name)?;

    let mut films: BTreeMap<Uuid, (String, BTreeSet<Role>)> = BTreeMap::new();
    for credit in row.credits {
        let Ok(role) = credit.role.parse::<Role>() else {
            continue;
        };
        films
            .entry(credit.film_id)
            .or_insert_with(|| (credit.title, BTreeSet::new()))
            .1
            .insert(role);
    }
    let mut films: Vec<PersonFilm> = films
        .into_iter()
        .map(|(id, (title, roles))| PersonFilm {
            id,
            title,
            roles: roles.into_iter().collect(),
        })
        .collect();
    films.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));

    Ok(PersonDocument {
        id: row.id,
        full_name,
        films,
    })
}
