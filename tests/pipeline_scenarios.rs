//! End-to-end pipeline behaviour on the in-memory stores.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use search_sync::adapter::Datastore;
use search_sync::config::{parse_config, validate, Config};
use search_sync::error::SyncError;
use search_sync::pipeline::{Pipeline, PipelineState};
use search_sync::sink::memory::MemorySink;
use search_sync::source::memory::{MemoryRow, MemorySource};
use search_sync::state::memory::MemoryStore;
use search_sync::state::{StateManager, StateStore};
use search_sync::sync::{build_pipeline, Stores};

const CONFIG: &str = r#"
[source]
backend = "memory"
extract_batch_size = 2

[sink]
backend = "memory"
load_batch_size = 2

[state]
backend = "memory"

[sync]
poll_interval_secs = 0.05

[backoff]
start_secs = 0.01
cap_secs = 0.05
max_attempts = 3
"#;

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

struct Harness {
    config: Config,
    source: Arc<MemorySource>,
    sink: Arc<MemorySink>,
    store: Arc<MemoryStore>,
    stores: Stores,
    state: Arc<StateManager>,
}

impl Harness {
    async fn new() -> Self {
        let config = parse_config(CONFIG).unwrap();
        validate(&config).unwrap();
        let policy = config.backoff.policy();
        let source = Arc::new(MemorySource::new(policy.clone()));
        let sink = Arc::new(MemorySink::new(policy.clone()));
        let store = Arc::new(MemoryStore::new(policy));
        let stores = Stores {
            source: source.clone(),
            sink: sink.clone(),
            state: store.clone(),
        };
        stores.connect().await.unwrap();
        let state = stores.state_manager(&config);
        seed(&source);
        Self {
            config,
            source,
            sink,
            store,
            stores,
            state,
        }
    }

    fn pipeline(&self, name: &str) -> Pipeline {
        let spec = self.config.sync.pipeline(name).unwrap();
        build_pipeline(&self.config, &self.stores, self.state.clone(), spec)
    }

    async fn cycle(&self, name: &str) -> Result<search_sync::pipeline::CycleReport, SyncError> {
        let (_tx, rx) = watch::channel(false);
        self.pipeline(name).run_cycle(&rx).await
    }

    async fn watermark(&self, name: &str) -> Option<DateTime<Utc>> {
        self.state.get(name).await.unwrap().map(|s| s.watermark)
    }

    fn movie(&self, n: u128) -> Value {
        self.sink.document("movies", &id(n).to_string()).unwrap()
    }
}

fn film(n: u128, at: i64, title: &str) -> MemoryRow {
    MemoryRow::new(id(n), ts(at))
        .with("title", title)
        .with("rating", "7.5")
        .with("type", "movie")
}

fn genre_link(link: u128, genre: u128, film: u128, at: i64) -> MemoryRow {
    MemoryRow::new(id(link), ts(at))
        .with("genre_id", id(genre).to_string())
        .with("film_work_id", id(film).to_string())
}

fn credit(link: u128, person: u128, film: u128, role: &str, at: i64) -> MemoryRow {
    MemoryRow::new(id(link), ts(at))
        .with("person_id", id(person).to_string())
        .with("film_work_id", id(film).to_string())
        .with("role", role)
}

/// Films 1-3, genres 10-11, persons 20-21.
fn seed(source: &MemorySource) {
    source.upsert("film_work", film(1, 1, "Solaris"));
    source.upsert("film_work", film(2, 2, "Stalker"));
    source.upsert("film_work", film(3, 3, "Mirror"));
    source.upsert("genre", MemoryRow::new(id(10), ts(1)).with("name", "Drama"));
    source.upsert("genre", MemoryRow::new(id(11), ts(2)).with("name", "Sci-Fi"));
    source.upsert("person", MemoryRow::new(id(20), ts(1)).with("full_name", "Andrei Tarkovsky"));
    source.upsert("person", MemoryRow::new(id(21), ts(2)).with("full_name", "Donatas Banionis"));
    source.upsert("genre_film_work", genre_link(100, 10, 1, 1));
    source.upsert("genre_film_work", genre_link(101, 11, 1, 1));
    source.upsert("genre_film_work", genre_link(102, 10, 2, 2));
    source.upsert("genre_film_work", genre_link(103, 10, 3, 3));
    source.upsert("person_film_work", credit(200, 20, 1, "director", 1));
    source.upsert("person_film_work", credit(201, 21, 1, "actor", 1));
    source.upsert("person_film_work", credit(202, 20, 2, "director", 2));
}

#[tokio::test]
async fn test_first_cycle_indexes_everything() {
    let h = Harness::new().await;
    let report = h.cycle("filmwork").await.unwrap();
    assert_eq!(report.changes, 3);
    assert_eq!(report.indexed, 3);
    assert_eq!(h.sink.count("movies"), 3);
    assert_eq!(h.watermark("filmwork").await, Some(ts(3)));

    let solaris = h.movie(1);
    assert_eq!(solaris["title"], "Solaris");
    assert_eq!(solaris["imdb_rating"], 7.5);
    assert_eq!(solaris["genres_names"], serde_json::json!(["Drama", "Sci-Fi"]));
    assert_eq!(solaris["directors_names"], serde_json::json!(["Andrei Tarkovsky"]));
    assert_eq!(solaris["actors_names"], serde_json::json!(["Donatas Banionis"]));
}

#[tokio::test]
async fn test_replaying_a_window_is_idempotent() {
    let h = Harness::new().await;
    h.cycle("filmwork").await.unwrap();
    let first = h.sink.documents("movies");

    // Crash before commit: the same window is extracted again.
    h.state.reset("filmwork").await.unwrap();
    h.cycle("filmwork").await.unwrap();
    assert_eq!(h.sink.documents("movies"), first);
    assert_eq!(h.sink.count("movies"), 3);
}

#[tokio::test]
async fn test_watermark_is_monotonic() {
    let h = Harness::new().await;
    let mut seen = Vec::new();
    for step in 0..4 {
        if step > 0 {
            h.source.upsert("film_work", film(step, 10 + step as i64, "Updated"));
        }
        h.cycle("filmwork").await.unwrap();
        seen.push(h.watermark("filmwork").await.unwrap());
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last().copied(), Some(ts(13)));
}

#[tokio::test]
async fn test_upsert_keeps_latest_values() {
    let h = Harness::new().await;
    h.cycle("filmwork").await.unwrap();
    h.source.upsert(
        "film_work",
        MemoryRow::new(id(2), ts(20)).with("title", "Stalker (restored)"),
    );
    h.cycle("filmwork").await.unwrap();
    let doc = h.movie(2);
    assert_eq!(doc["title"], "Stalker (restored)");
    assert_eq!(doc["imdb_rating"], Value::Null);
    assert_eq!(doc["filmwork_type"], Value::Null);
}

#[tokio::test]
async fn test_empty_change_set_does_no_work() {
    let h = Harness::new().await;
    h.cycle("filmwork").await.unwrap();
    let calls = h.sink.bulk_calls();
    let before = h.watermark("filmwork").await;

    let report = h.cycle("filmwork").await.unwrap();
    assert_eq!(report.batches, 0);
    assert_eq!(report.watermark, None);
    assert_eq!(h.sink.bulk_calls(), calls);
    assert_eq!(h.watermark("filmwork").await, before);
}

#[tokio::test]
async fn test_related_row_change_reindexes_root() {
    let h = Harness::new().await;
    h.cycle("filmwork").await.unwrap();
    h.cycle("genre").await.unwrap();

    h.source.upsert("genre", MemoryRow::new(id(10), ts(30)).with("name", "Melodrama"));
    let report = h.cycle("genre").await.unwrap();
    assert_eq!(report.changes, 1);
    assert_eq!(report.indexed, 3);
    for n in [1, 2, 3] {
        let names = h.movie(n)["genres_names"].clone();
        assert!(names.as_array().unwrap().contains(&Value::from("Melodrama")));
    }
    assert_eq!(h.watermark("genre").await, Some(ts(30)));
}

#[tokio::test]
async fn test_relinked_genre_reindexes_root() {
    let h = Harness::new().await;
    h.cycle("filmwork").await.unwrap();
    h.cycle("genre_film_work").await.unwrap();
    assert_eq!(h.movie(3)["genres_names"], serde_json::json!(["Drama"]));

    // Film 3 gains Sci-Fi; its own row is untouched.
    h.source.upsert("genre_film_work", genre_link(104, 11, 3, 40));
    let report = h.cycle("genre_film_work").await.unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(h.movie(3)["genres_names"], serde_json::json!(["Drama", "Sci-Fi"]));
    assert_eq!(h.watermark("filmwork").await, Some(ts(3)));
}

#[tokio::test]
async fn test_person_documents_collect_roles() {
    let h = Harness::new().await;
    h.cycle("persons").await.unwrap();
    let doc = h.sink.document("persons", &id(20).to_string()).unwrap();
    assert_eq!(doc["full_name"], "Andrei Tarkovsky");
    assert_eq!(doc["films"].as_array().unwrap().len(), 2);

    h.source.upsert("person_film_work", credit(203, 20, 3, "writer", 50));
    h.cycle("persons_roles").await.unwrap();
    let doc = h.sink.document("persons", &id(20).to_string()).unwrap();
    assert_eq!(doc["films"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_renamed_film_reaches_person_documents() {
    let h = Harness::new().await;
    let names: Vec<String> = h.config.sync.pipelines.iter().map(|p| p.name.clone()).collect();
    for name in &names {
        h.cycle(name).await.unwrap();
    }

    h.source.upsert("film_work", film(1, 60, "Solaris (1972)"));
    for name in &names {
        h.cycle(name).await.unwrap();
    }

    let person = h.sink.document("persons", &id(20).to_string()).unwrap();
    let films = person["films"].as_array().unwrap();
    let solaris = films
        .iter()
        .find(|f| f["id"] == Value::from(id(1).to_string()))
        .unwrap();
    assert_eq!(solaris["title"], "Solaris (1972)");
    assert_eq!(h.movie(1)["title"], "Solaris (1972)");
    assert_eq!(h.watermark("persons_films").await, Some(ts(60)));
    // Person rows themselves did not change.
    assert_eq!(h.watermark("persons").await, Some(ts(2)));
}

#[tokio::test(start_paused = true)]
async fn test_sink_outage_recovers_within_budget() {
    let h = Harness::new().await;
    h.sink.faults().drop_connection();
    h.sink.faults().refuse_opens(1);

    let report = h.cycle("filmwork").await.unwrap();
    assert_eq!(report.indexed, 3);
    assert!(h.sink.is_connected().await);
    assert_eq!(h.watermark("filmwork").await, Some(ts(3)));
}

#[tokio::test(start_paused = true)]
async fn test_sink_outage_beyond_budget_holds_watermark() {
    let h = Harness::new().await;
    h.sink.faults().drop_connection();
    h.sink.faults().refuse_opens(100);

    let err = h.cycle("filmwork").await.unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(h.sink.count("movies"), 0);
    assert_eq!(
        h.watermark("filmwork").await,
        Some(search_sync_core::models::min_watermark())
    );

    // The store comes back: the next cycle picks up the whole window.
    h.sink.faults().refuse_opens(0);
    h.cycle("filmwork").await.unwrap();
    assert_eq!(h.sink.count("movies"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_source_failures_are_absorbed() {
    let h = Harness::new().await;
    h.source.faults().fail_ops(2);
    let report = h.cycle("genres").await.unwrap();
    assert_eq!(report.indexed, 2);
}

#[tokio::test]
async fn test_runs_sharing_a_timestamp_survive_a_failed_batch() {
    let h = Harness::new().await;
    h.source.upsert("genre", MemoryRow::new(id(12), ts(2)).with("name", "Comedy"));
    h.source.upsert("genre", MemoryRow::new(id(13), ts(2)).with("name", "Horror"));
    h.source.upsert("genre", MemoryRow::new(id(14), ts(5)).with("name", "Western"));
    // Order: 10@1, 11@2 | 12@2, 13@2 | 14@5

    h.sink.reject_ids([id(13).to_string()]);
    let err = h.cycle("genres").await.unwrap_err();
    assert!(matches!(err, SyncError::PartialLoad { .. }));
    // Only the timestamp strictly below the open run is safe.
    assert_eq!(h.watermark("genres").await, Some(ts(1)));

    h.sink.reject_ids(Vec::<String>::new());
    h.cycle("genres").await.unwrap();
    assert_eq!(h.sink.count("genres"), 5);
    assert_eq!(h.watermark("genres").await, Some(ts(5)));
}

#[tokio::test]
async fn test_rejected_document_holds_whole_batch() {
    let h = Harness::new().await;
    h.sink.reject_ids([id(1).to_string()]);
    let err = h.cycle("filmwork").await.unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(
        h.watermark("filmwork").await,
        Some(search_sync_core::models::min_watermark())
    );
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_state_stops_only_that_pipeline() {
    let h = Harness::new().await;
    h.store.set("ssync:state:genre", b"{not json").await.unwrap();

    let (tx, rx) = watch::channel(false);
    let mut broken = h.pipeline("genre");
    let mut healthy = h.pipeline("filmwork");

    let err = broken.run(rx.clone()).await.unwrap_err();
    assert!(matches!(err, SyncError::CorruptState { .. }));
    assert_eq!(broken.phase(), PipelineState::Stopped);

    let task = tokio::spawn(async move {
        let result = healthy.run(rx).await;
        (result, healthy.phase())
    });
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(h.sink.count("movies"), 3);
    tx.send(true).unwrap();
    let (result, phase) = task.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(phase, PipelineState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_polling_picks_up_later_changes() {
    let h = Harness::new().await;
    let (tx, rx) = watch::channel(false);
    let mut pipeline = h.pipeline("genres");
    let task = tokio::spawn(async move { pipeline.run(rx).await });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(h.sink.count("genres"), 2);
    h.source.upsert("genre", MemoryRow::new(id(15), ts(60)).with("name", "Noir"));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(h.sink.count("genres"), 3);

    tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_cycle_limit_stops_pipeline() {
    let h = Harness::new().await;
    let mut config = h.config.clone();
    config.sync.max_failed_cycles = 2;
    h.sink.faults().drop_connection();
    h.sink.faults().refuse_opens(u32::MAX);

    let spec = config.sync.pipeline("genres").unwrap();
    let mut pipeline = build_pipeline(&config, &h.stores, h.state.clone(), spec);
    let (_tx, rx) = watch::channel(false);
    let err = pipeline.run(rx).await.unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(pipeline.phase(), PipelineState::Stopped);
}
