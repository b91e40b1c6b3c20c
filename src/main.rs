//! # Doc Spider CLI (`spider`)
//!
//! Thin command layer over the `doc_spider` library.
//!
//! ## Usage
//!
//! ```bash
//! spider --config ./config/spider.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `spider init` | Create the SQLite ledger and its tables |
//! | `spider register <manifest>` | Register storage objects from a JSON-lines manifest |
//! | `spider run` | Fetch, extract, chunk and index eligible files |
//! | `spider requeue` | Reset every `error` file to `new` |
//! | `spider status` | Print the number of files per status |
//! | `spider wait-ready` | Block until the database and the vector index are usable |
//! | `spider recreate-collection` | Drop and recreate the vector index collection |
//!
//! Logs go to stderr; set `RUST_LOG` to change verbosity.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use doc_spider::config::{self, Config};
use doc_spider::index::{VectorIndex, WeaviateIndex};
use doc_spider::ledger::Ledger;
use doc_spider::pipeline::{Pipeline, Stage};
use doc_spider::register::{self, RegisterPolicy};
use doc_spider::stats::RunStats;
use doc_spider::{db, migrate, readiness};

/// Doc Spider: resumable document ingestion into a vector index.
#[derive(Parser)]
#[command(name = "spider", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/spider.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the ledger database. Safe to run repeatedly.
    Init,

    /// Register storage objects listed in a JSON-lines manifest.
    Register {
        manifest: PathBuf,

        /// Stop at the first id that is already registered.
        #[arg(long)]
        fail_on_duplicate: bool,
    },

    /// Process eligible files.
    Run {
        /// `fetch`, `index` or `all`.
        #[arg(long, default_value = "all")]
        stage: Stage,

        /// Requeue errored files before the run.
        #[arg(long)]
        retry_errors: bool,
    },

    /// Reset every errored file to `new`.
    Requeue,

    /// Print per-status file counts.
    Status,

    /// Wait until the database and vector index accept work.
    WaitReady,

    /// Drop and recreate the vector index collection.
    RecreateCollection,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doc_spider=info,spider=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Register {
            manifest,
            fail_on_duplicate,
        } => {
            let policy = if fail_on_duplicate {
                RegisterPolicy::Fail
            } else {
                RegisterPolicy::Skip
            };
            let ledger = open_ledger(&cfg).await?;
            let mut stats = RunStats::new();
            let summary = register::register_manifest(
                &ledger,
                &manifest,
                &cfg.storage.download_dir,
                policy,
                &mut stats,
            )
            .await?;
            println!(
                "Registered {} files ({} already present).",
                summary.inserted, summary.skipped
            );
        }
        Commands::Run {
            stage,
            retry_errors,
        } => {
            let ledger = open_ledger(&cfg).await?;
            let index = WeaviateIndex::new(&cfg.index)?;
            index
                .ensure_collection()
                .await
                .context("Failed to prepare vector index collection")?;
            let mut pipeline = Pipeline::new(&cfg, ledger, &index)?;
            pipeline.run(stage, retry_errors).await?;
        }
        Commands::Requeue => {
            let ledger = open_ledger(&cfg).await?;
            let n = ledger.requeue_errors().await?;
            println!("Requeued {} files.", n);
        }
        Commands::Status => {
            let ledger = open_ledger(&cfg).await?;
            let counts = ledger.count_by_status().await?;
            for (status, n) in &counts {
                println!("{:<12} {}", status, n);
            }
            println!("{:<12} {}", "total", counts.values().sum::<i64>());
        }
        Commands::WaitReady => {
            let ledger = open_ledger(&cfg).await?;
            readiness::await_db_ready(
                ledger.pool(),
                Duration::from_secs(cfg.readiness.db_interval_secs),
            )
            .await;
            let index = WeaviateIndex::new(&cfg.index)?;
            index.ensure_collection().await?;
            let probe_id = uuid::Uuid::new_v4().to_string();
            readiness::await_ready(
                &index,
                &probe_id,
                Duration::from_secs(cfg.readiness.interval_secs),
            )
            .await?;
            println!("Ready.");
        }
        Commands::RecreateCollection => {
            let index = WeaviateIndex::new(&cfg.index)?;
            index.delete_collection().await?;
            index.ensure_collection().await?;
            println!("Collection '{}' recreated.", cfg.index.collection);
        }
    }

    Ok(())
}

/// Connect to the ledger database, creating tables if needed.
async fn open_ledger(cfg: &Config) -> Result<Ledger> {
    let pool = db::connect(cfg).await?;
    migrate::migrate_pool(&pool).await?;
    Ok(Ledger::new(pool, cfg.db.page_size))
}
