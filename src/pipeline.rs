//! Ingestion orchestration.
//!
//! One run walks a single streamed cursor over the ledger and carries each
//! eligible record forward, one at a time, as far as the requested stage
//! allows:
//!
//! ```text
//! new ──fetch──▶ downloaded ──extract + .txt──▶ parsed ──chunk + write──▶ done
//!  └───────────────────┴──────────── any failure ───────────┴──▶ error
//! ```
//!
//! Every record is claimed before it is touched. Failures that only concern
//! the current file mark it `error` and the run moves on; failures of the
//! ledger itself (see [`SpiderError::is_fatal_for_file`]) end the run.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::chunk::Chunker;
use crate::config::Config;
use crate::error::SpiderError;
use crate::extract::ExtractorRegistry;
use crate::fetch::ContentFetcher;
use crate::index::VectorIndex;
use crate::ledger::Ledger;
use crate::models::{EntryMetadata, FileRecord, Status};
use crate::readiness;
use crate::stats::RunStats;
use crate::writer::IndexWriter;

/// How far a run carries records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    /// `new → downloaded` only.
    Fetch,
    /// `downloaded → parsed → done` only.
    Index,
    #[default]
    All,
}

impl Stage {
    fn fetches(self) -> bool {
        matches!(self, Stage::Fetch | Stage::All)
    }

    fn indexes(self) -> bool {
        matches!(self, Stage::Index | Stage::All)
    }

    /// Statuses a run at this stage picks up.
    pub fn eligible(self) -> Vec<Status> {
        let mut statuses = Vec::new();
        if self.fetches() {
            statuses.push(Status::New);
        }
        if self.indexes() {
            statuses.extend([Status::Downloaded, Status::Parsed]);
        }
        statuses
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fetch" => Ok(Stage::Fetch),
            "index" => Ok(Stage::Index),
            "all" => Ok(Stage::All),
            other => Err(format!("unknown stage '{}': expected fetch, index or all", other)),
        }
    }
}

pub struct Pipeline<'a> {
    config: &'a Config,
    ledger: Ledger,
    index: &'a dyn VectorIndex,
    fetcher: ContentFetcher,
    extractors: ExtractorRegistry,
    chunker: Chunker,
    sites: HashMap<String, String>,
    stats: RunStats,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, ledger: Ledger, index: &'a dyn VectorIndex) -> Result<Self> {
        Ok(Self {
            config,
            ledger,
            index,
            fetcher: ContentFetcher::new(&config.storage)?,
            extractors: ExtractorRegistry::with_defaults(&config.parsing),
            chunker: Chunker::new(&config.chunking)?,
            sites: HashMap::new(),
            stats: RunStats::new(),
        })
    }

    /// Replace the extractor registry.
    pub fn with_extractors(mut self, extractors: ExtractorRegistry) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Process every eligible record once. Returns the statistics of this
    /// run, which are also logged.
    pub async fn run(&mut self, stage: Stage, retry_errors: bool) -> Result<RunStats> {
        self.stats = RunStats::new();
        info!(?stage, "run started");
        readiness::await_db_ready(
            self.ledger.pool(),
            Duration::from_secs(self.config.readiness.db_interval_secs),
        )
        .await;

        if stage.indexes() {
            let probe_id = uuid::Uuid::new_v4().to_string();
            readiness::await_ready(
                self.index,
                &probe_id,
                Duration::from_secs(self.config.readiness.interval_secs),
            )
            .await
            .context("Vector index readiness probe failed")?;
        }

        if retry_errors || self.config.pipeline.retry_errors {
            let requeued = self.ledger.requeue_errors().await?;
            info!(requeued, "errored files requeued");
            self.stats.incr(&["pipeline", "requeued"], requeued as i64);
        }

        self.sites = self.ledger.site_names().await?;

        let ledger = self.ledger.clone();
        let mut cursor = ledger.list_eligible(&stage.eligible());
        while let Some(record) = cursor.next().await? {
            self.stats.incr(&["pipeline", "seen"], 1);
            match self.process(&record, stage).await {
                Ok(Some(status)) => {
                    if status == Status::Done {
                        self.stats.incr(&["pipeline", "done"], 1);
                    }
                }
                Ok(None) => {
                    self.stats.incr(&["pipeline", "skipped_claimed"], 1);
                }
                Err(e) if e.is_fatal_for_file() => {
                    error!(file = %record.name, id = %record.id, error = %e, "file failed");
                    self.stats.incr(&["pipeline", "failed"], 1);
                    self.stats.set(&["file", &record.name, "error"], 1);
                    self.ledger
                        .advance(&record.id, Status::Error)
                        .await
                        .with_context(|| format!("Failed to mark {} as error", record.id))?;
                }
                Err(e) => {
                    if let Err(release_err) = self
                        .ledger
                        .release(&record.id, &self.config.pipeline.worker_id)
                        .await
                    {
                        warn!(id = %record.id, error = %release_err, "could not release claim");
                    }
                    return Err(e).with_context(|| format!("Run aborted at {}", record.id));
                }
            }
        }

        info!("{}", self.stats.render());
        info!("run finished");
        Ok(self.stats.clone())
    }

    /// Carry one record as far as `stage` allows. `Ok(None)` means another
    /// worker holds the record.
    async fn process(
        &mut self,
        record: &FileRecord,
        stage: Stage,
    ) -> std::result::Result<Option<Status>, SpiderError> {
        let mut status = record.status;
        if !self.claim(record, status).await? {
            return Ok(None);
        }

        if status == Status::New && stage.fetches() {
            let size = self
                .fetcher
                .fetch(&record.link, &record.target_path)
                .await?;
            self.stats.incr(&["fs", "downloaded"], 1);
            self.stats.set(&["file", &record.name, "downloaded_bytes"], size as i64);
            status = self.advance(record, Status::Downloaded).await?;
            if stage.indexes() && !self.claim(record, status).await? {
                return Ok(Some(status));
            }
        }

        if !stage.indexes() {
            return Ok(Some(status));
        }

        let text = match status {
            Status::Downloaded => {
                let text = self.extractors.extract(record, &mut self.stats).await?;
                let text_path = record.text_path();
                tokio::fs::write(&text_path, &text).await?;
                self.stats.incr(&["fs", "written"], text.len() as i64);
                status = self.advance(record, Status::Parsed).await?;
                if !self.claim(record, status).await? {
                    return Ok(Some(status));
                }
                text
            }
            Status::Parsed => self.resume_text(record).await?,
            _ => return Ok(Some(status)),
        };

        self.index_text(record, &text).await?;
        status = self.advance(record, Status::Done).await?;
        Ok(Some(status))
    }

    /// Text of a record resumed at `parsed`: the `.txt` sibling when present,
    /// otherwise a fresh extraction from the downloaded file.
    async fn resume_text(&mut self, record: &FileRecord) -> std::result::Result<String, SpiderError> {
        let text_path = record.text_path();
        match tokio::fs::read_to_string(&text_path).await {
            Ok(text) => {
                info!(file = %record.name, "resuming from extracted text");
                Ok(text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(file = %record.name, path = %text_path.display(), "extracted text missing, re-extracting");
                let text = self.extractors.extract(record, &mut self.stats).await?;
                tokio::fs::write(&text_path, &text).await?;
                self.stats.incr(&["fs", "written"], text.len() as i64);
                Ok(text)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn index_text(&mut self, record: &FileRecord, text: &str) -> std::result::Result<(), SpiderError> {
        let chunks = self.chunker.split_with_stats(text, &mut self.stats);
        let metadata = EntryMetadata::for_file(
            record,
            self.sites.get(&record.site_id).cloned(),
            self.fetcher.url_for(&record.link),
        );
        let writer = IndexWriter::new(self.index, &self.config.index);
        let outcome = writer
            .write_batch(
                &chunks,
                &metadata,
                self.config.chunking.min_chunk_size,
                &mut self.stats,
            )
            .await?;
        self.stats.set(
            &["file", &record.name, "vectordb_inserted"],
            outcome.inserted as i64,
        );
        Ok(())
    }

    async fn claim(&self, record: &FileRecord, expected: Status) -> std::result::Result<bool, SpiderError> {
        let claimed = self
            .ledger
            .claim(
                &record.id,
                expected,
                &self.config.pipeline.worker_id,
                self.config.pipeline.lease_secs,
            )
            .await?;
        if !claimed {
            info!(file = %record.name, id = %record.id, "held by another worker, skipping");
        }
        Ok(claimed)
    }

    async fn advance(&self, record: &FileRecord, to: Status) -> std::result::Result<Status, SpiderError> {
        self.ledger.advance(&record.id, to).await?;
        info!(file = %record.name, status = %to, "status advanced");
        Ok(to)
    }
}
