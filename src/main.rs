//! # Search Sync CLI (`ssync`)
//!
//! Keeps search indices in step with the relational catalogue.
//!
//! ## Usage
//!
//! ```bash
//! ssync --config ./config/ssync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ssync init` | Create missing indices and initialise pipeline state |
//! | `ssync run` | Run pipelines until Ctrl-C (`--once` for a single cycle) |
//! | `ssync status` | Show each pipeline's watermark |
//! | `ssync reset <pipeline>` | Rewind a pipeline to a full re-index |
//! | `ssync check` | Probe the source, sink and state store |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use search_sync::{config, logging, sync};

/// Search Sync: incremental PostgreSQL to Elasticsearch replication.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ssync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ssync",
    about = "Incrementally replicate a relational catalogue into search indices",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ssync.toml")]
    config: PathBuf,

    /// Log at debug level regardless of configuration.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create each configured index if absent and initialise watermarks.
    ///
    /// Idempotent: existing indices and watermarks are left untouched.
    Init,

    /// Run pipelines concurrently.
    ///
    /// Each pipeline polls its table, re-indexes affected documents and
    /// advances its watermark. Stops on Ctrl-C after in-flight batches.
    Run {
        /// Only run these pipelines (repeatable). Defaults to all.
        #[arg(long = "pipeline", value_name = "NAME")]
        pipelines: Vec<String>,

        /// Run a single cycle per pipeline and exit.
        #[arg(long)]
        once: bool,
    },

    /// Show each pipeline's table, index and stored watermark.
    Status,

    /// Rewind a pipeline's watermark to the minimum.
    ///
    /// The next cycle re-indexes every row of the pipeline's table.
    Reset {
        /// Pipeline name as configured.
        pipeline: String,
    },

    /// Check that the source, sink and state store are reachable.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging, cli.verbose)?;

    match cli.command {
        Commands::Init => sync::run_init(&cfg).await?,
        Commands::Run { pipelines, once } => sync::run_sync(&cfg, &pipelines, once).await?,
        Commands::Status => sync::run_status(&cfg).await?,
        Commands::Reset { pipeline } => sync::run_reset(&cfg, &pipeline).await?,
        Commands::Check => sync::run_check(&cfg).await?,
    }

    Ok(())
}
