//! Service orchestration behind the CLI commands.
//!
//! Builds the three stores from configuration, wires one [`Pipeline`] per
//! configured entity and runs them as independent tasks. Pipelines share
//! the stores but never each other's state key, so a pipeline that stops on
//! a fatal error leaves its siblings running.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::adapter::Datastore;
use crate::config::{Config, PipelineConfig};
use crate::enrich::Enricher;
use crate::error::SyncError;
use crate::extract::Extractor;
use crate::load::Loader;
use crate::pipeline::Pipeline;
use crate::sink::elasticsearch::ElasticsearchSink;
use crate::sink::memory::MemorySink;
use crate::sink::{ensure_index, load_schema, ChunkPolicy, SearchSink};
use crate::source::memory::MemorySource;
use crate::source::postgres::PostgresSource;
use crate::source::ChangeFeed;
use crate::state::memory::MemoryStore;
use crate::state::redis::RedisStore;
use crate::state::sqlite::SqliteStore;
use crate::state::{StateManager, StateStore};

/// The adapters shared by every pipeline.
#[derive(Clone)]
pub struct Stores {
    pub source: Arc<dyn ChangeFeed>,
    pub sink: Arc<dyn SearchSink>,
    pub state: Arc<dyn StateStore>,
}

impl Stores {
    /// Construct (but do not connect) the configured backends.
    pub fn from_config(config: &Config) -> Result<Self> {
        let source_policy = config.backoff.with_override(&config.source.retry);
        let source: Arc<dyn ChangeFeed> = match config.source.backend.as_str() {
            "postgres" => {
                let Some(dsn) = config.source.dsn.as_deref() else {
                    bail!("source.dsn is not set");
                };
                Arc::new(PostgresSource::new(
                    dsn,
                    &config.source.schema,
                    config.source.pool_size,
                    source_policy,
                ))
            }
            "memory" => match &config.source.fixture {
                Some(path) => Arc::new(MemorySource::from_fixture(path, source_policy)?),
                None => Arc::new(MemorySource::new(source_policy)),
            },
            other => bail!("Unknown source backend: '{}'", other),
        };

        let sink_policy = config.backoff.with_override(&config.sink.retry);
        let sink: Arc<dyn SearchSink> = match config.sink.backend.as_str() {
            "elasticsearch" => {
                let Some(url) = config.sink.url.as_deref() else {
                    bail!("sink.url is not set");
                };
                Arc::new(ElasticsearchSink::new(
                    url,
                    Duration::from_secs(config.sink.timeout_secs),
                    sink_policy,
                ))
            }
            "memory" => Arc::new(MemorySink::new(sink_policy)),
            other => bail!("Unknown sink backend: '{}'", other),
        };

        let state_policy = config.backoff.with_override(&config.state.retry);
        let state: Arc<dyn StateStore> = match config.state.backend.as_str() {
            "redis" => {
                let Some(url) = config.state.url.as_deref() else {
                    bail!("state.url is not set");
                };
                Arc::new(RedisStore::new(url, state_policy)?)
            }
            "sqlite" => {
                let Some(path) = config.state.path.as_deref() else {
                    bail!("state.path is not set");
                };
                Arc::new(SqliteStore::new(path, state_policy))
            }
            "memory" => Arc::new(MemoryStore::new(state_policy)),
            other => bail!("Unknown state backend: '{}'", other),
        };

        Ok(Self {
            source,
            sink,
            state,
        })
    }

    pub async fn connect(&self) -> Result<(), SyncError> {
        self.source.connect().await?;
        self.sink.connect().await?;
        self.state.connect().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.source.close().await;
        self.sink.close().await;
        self.state.close().await;
    }

    pub fn state_manager(&self, config: &Config) -> Arc<StateManager> {
        Arc::new(StateManager::new(
            self.state.clone(),
            config.state.key_prefix.clone(),
        ))
    }
}

/// Wire the stages of one pipeline onto the shared stores.
pub fn build_pipeline(
    config: &Config,
    stores: &Stores,
    state: Arc<StateManager>,
    spec: &PipelineConfig,
) -> Pipeline {
    let extractor = Extractor::new(
        stores.source.clone(),
        &spec.table,
        config.source.extract_batch_size,
    );
    let enricher = Enricher::new(
        stores.source.clone(),
        &spec.table,
        spec.resolve.clone(),
        spec.document,
        config.source.extract_batch_size,
    );
    let loader = Loader::new(
        stores.sink.clone(),
        state.clone(),
        &spec.name,
        &spec.index,
        ChunkPolicy {
            chunk_size: config.sink.load_batch_size,
            raise_on_error: config.sink.raise_on_chunk_error,
        },
    );
    Pipeline::new(&spec.name, state, extractor, enricher, loader)
        .with_polling(config.sync.poll_interval(), config.sync.max_failed_cycles)
}

/// Pipelines named in `only`, or all of them when `only` is empty.
pub fn select_pipelines<'a>(config: &'a Config, only: &[String]) -> Result<Vec<&'a PipelineConfig>> {
    if only.is_empty() {
        return Ok(config.sync.pipelines.iter().collect());
    }
    only.iter()
        .map(|name| match config.sync.pipeline(name) {
            Some(p) => Ok(p),
            None => bail!(
                "Unknown pipeline: '{}'. Configured: {}",
                name,
                pipeline_names(config)
            ),
        })
        .collect()
}

fn pipeline_names(config: &Config) -> String {
    config
        .sync
        .pipelines
        .iter()
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// `ssync run`: run the selected pipelines concurrently.
///
/// With `once`, every pipeline runs a single cycle and the call returns.
/// Otherwise pipelines poll until Ctrl-C. Fails if any pipeline stopped on
/// an error (in `once` mode: on a fatal error).
pub async fn run_sync(config: &Config, only: &[String], once: bool) -> Result<()> {
    let selected = select_pipelines(config, only)?;
    let stores = Stores::from_config(config)?;
    stores.connect().await?;
    let state = stores.state_manager(config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    for spec in selected {
        let mut pipeline = build_pipeline(config, &stores, state.clone(), spec);
        let shutdown = shutdown_rx.clone();
        let span = tracing::info_span!("pipeline", entity = %spec.name);
        tasks.spawn(
            async move {
                let result = if once {
                    pipeline.run_cycle(&shutdown).await.map(|report| {
                        tracing::info!(
                            batches = report.batches,
                            indexed = report.indexed,
                            rejected = report.rejected,
                            watermark = ?report.watermark,
                            "cycle complete"
                        );
                    })
                } else {
                    pipeline.run(shutdown).await
                };
                (pipeline.name().to_string(), result)
            }
            .instrument(span),
        );
    }

    let mut stopped = Vec::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut signalled = once;
    loop {
        tokio::select! {
            signal = &mut ctrl_c, if !signalled => {
                signalled = true;
                match signal {
                    Ok(()) => {
                        tracing::info!("shutdown requested, waiting for pipelines to finish their batch");
                        let _ = shutdown_tx.send(true);
                    }
                    Err(e) => tracing::warn!("cannot listen for Ctrl-C: {e}"),
                }
            }
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok((_, Ok(())))) => {}
                Some(Ok((name, Err(e)))) => {
                    if once && !e.is_fatal() {
                        tracing::error!(pipeline = %name, error = %e, "cycle failed, watermark not advanced");
                    } else {
                        stopped.push(name);
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "pipeline task panicked");
                    stopped.push("<panicked>".to_string());
                }
            }
        }
    }

    stores.close().await;
    if !stopped.is_empty() {
        bail!("pipeline(s) stopped on error: {}", stopped.join(", "));
    }
    Ok(())
}

/// `ssync init`: create missing indices and initialise every watermark.
pub async fn run_init(config: &Config) -> Result<()> {
    let stores = Stores::from_config(config)?;
    stores.sink.connect().await?;
    stores.state.connect().await?;
    let state = stores.state_manager(config);

    let mut seen = HashSet::new();
    for spec in &config.sync.pipelines {
        if !seen.insert(spec.index.as_str()) {
            continue;
        }
        let override_path = config
            .sink
            .indices
            .get(&spec.index)
            .and_then(|i| i.schema.as_deref());
        let schema = load_schema(spec.document, override_path)?;
        let created = ensure_index(stores.sink.as_ref(), &spec.index, &schema).await?;
        println!(
            "index {:<20} {}",
            spec.index,
            if created { "created" } else { "exists" }
        );
    }
    for spec in &config.sync.pipelines {
        let current = state.ensure(&spec.name).await?;
        println!("state {:<20} {}", spec.name, current.watermark.to_rfc3339());
    }

    stores.sink.close().await;
    stores.state.close().await;
    println!("Initialized successfully.");
    Ok(())
}

/// `ssync status`: one line per pipeline with its stored watermark.
pub async fn run_status(config: &Config) -> Result<()> {
    let stores = Stores::from_config(config)?;
    stores.state.connect().await?;
    let state = stores.state_manager(config);

    println!("{:<20} {:<20} {:<12} WATERMARK", "PIPELINE", "TABLE", "INDEX");
    for spec in &config.sync.pipelines {
        let watermark = match state.get(&spec.name).await {
            Ok(Some(s)) => s.watermark.to_rfc3339(),
            Ok(None) => "(not initialised)".to_string(),
            Err(SyncError::CorruptState { message, .. }) => format!("CORRUPT: {message}"),
            Err(e) => return Err(e.into()),
        };
        println!(
            "{:<20} {:<20} {:<12} {}",
            spec.name, spec.table, spec.index, watermark
        );
    }
    stores.state.close().await;
    Ok(())
}

/// `ssync reset <pipeline>`: rewind a watermark to the minimum.
pub async fn run_reset(config: &Config, name: &str) -> Result<()> {
    if config.sync.pipeline(name).is_none() {
        bail!(
            "Unknown pipeline: '{}'. Configured: {}",
            name,
            pipeline_names(config)
        );
    }
    let stores = Stores::from_config(config)?;
    stores.state.connect().await?;
    stores.state_manager(config).reset(name).await?;
    stores.state.close().await;
    println!("Pipeline '{}' reset; it will re-index everything on its next cycle.", name);
    Ok(())
}

/// `ssync check`: one connection attempt and liveness probe per store.
pub async fn run_check(config: &Config) -> Result<()> {
    let stores = Stores::from_config(config)?;
    let results = [
        ("source", &config.source.backend, probe(stores.source.as_ref()).await),
        ("sink", &config.sink.backend, probe(stores.sink.as_ref()).await),
        ("state", &config.state.backend, probe(stores.state.as_ref()).await),
    ];

    println!("{:<8} {:<14} STATUS", "STORE", "BACKEND");
    let mut failed = 0;
    for (role, backend, result) in results {
        let status = match result {
            Ok(()) => "OK".to_string(),
            Err(reason) => {
                failed += 1;
                format!("UNREACHABLE ({reason})")
            }
        };
        println!("{:<8} {:<14} {}", role, backend, status);
    }
    if failed > 0 {
        bail!("{failed} store(s) unreachable");
    }
    Ok(())
}

async fn probe<D: Datastore + ?Sized>(store: &D) -> Result<(), String> {
    let result = match store.open().await {
        Ok(()) if store.is_connected().await => Ok(()),
        Ok(()) => Err("liveness check failed".to_string()),
        Err(e) => Err(e.to_string()),
    };
    store.close().await;
    result
}
