//! TOML configuration.
//!
//! The whole configuration is parsed once at process start by [`load_config`]
//! and handed to each component by reference. Nothing in the crate reads
//! settings from global state.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that overrides `index.api_key`.
pub const INDEX_API_KEY_ENV: &str = "SPIDER_INDEX_API_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub parsing: ParsingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Rows fetched per page when streaming eligible file records.
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page_size() -> i64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Prefix joined with a file's storage link to build its download URL.
    pub base_url: String,
    pub download_dir: PathBuf,
    #[serde(default = "default_storage_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

fn default_storage_timeout() -> u64 {
    60
}
fn default_block_size() -> usize {
    8192
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParsingConfig {
    /// Binary used to extract text from legacy `.doc` files.
    #[serde(default = "default_antiword")]
    pub antiword_bin: String,
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self {
            antiword_bin: default_antiword(),
        }
    }
}

fn default_antiword() -> String {
    "antiword".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap")]
    pub overlap_chars: usize,
    #[serde(default = "default_separators")]
    pub separators: Vec<String>,
    /// Chunks shorter than this are not written to the index.
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_bucket_granularity")]
    pub bucket_granularity: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap(),
            separators: default_separators(),
            min_chunk_size: default_min_chunk_size(),
            bucket_granularity: default_bucket_granularity(),
        }
    }
}

fn default_max_chars() -> usize {
    500
}
fn default_overlap() -> usize {
    100
}
fn default_separators() -> Vec<String> {
    vec!["\n\n".to_string()]
}
fn default_min_chunk_size() -> usize {
    100
}
fn default_bucket_granularity() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default)]
    pub vectorizer_endpoint: Option<String>,
    #[serde(default)]
    pub vectorizer_model: Option<String>,
    /// A batch reporting more errors than this fails as a whole.
    #[serde(default = "default_max_batch_errors")]
    pub max_batch_errors: usize,
    /// Derive entry ids from `(object_id, chunk ordinal)` so re-runs overwrite.
    #[serde(default)]
    pub deterministic_ids: bool,
    #[serde(default = "default_index_timeout")]
    pub timeout_secs: u64,
}

fn default_collection() -> String {
    "Catsearch".to_string()
}
fn default_max_batch_errors() -> usize {
    1
}
fn default_index_timeout() -> u64 {
    60
}

impl IndexConfig {
    /// API key, with the environment taking precedence over the file.
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var(INDEX_API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key.clone().filter(|k| !k.is_empty()))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReadinessConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_interval")]
    pub db_interval_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            db_interval_secs: default_interval(),
        }
    }
}

fn default_interval() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Reset `error` records to `new` before a run.
    #[serde(default)]
    pub retry_errors: bool,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_errors: false,
            lease_secs: default_lease_secs(),
            worker_id: default_worker_id(),
        }
    }
}

fn default_lease_secs() -> i64 {
    3600
}
fn default_worker_id() -> String {
    format!("spider-{}", std::process::id())
}

impl Config {
    /// Parse and validate a configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.db.page_size < 1 {
            anyhow::bail!("db.page_size must be >= 1");
        }
        if self.storage.block_size == 0 {
            anyhow::bail!("storage.block_size must be > 0");
        }
        if self.chunking.max_chars == 0 {
            anyhow::bail!("chunking.max_chars must be > 0");
        }
        if self.chunking.overlap_chars >= self.chunking.max_chars {
            anyhow::bail!(
                "chunking.overlap_chars ({}) must be smaller than chunking.max_chars ({})",
                self.chunking.overlap_chars,
                self.chunking.max_chars
            );
        }
        if self.chunking.bucket_granularity == 0 {
            anyhow::bail!("chunking.bucket_granularity must be > 0");
        }
        if self.index.collection.trim().is_empty() {
            anyhow::bail!("index.collection must not be empty");
        }
        if self.readiness.interval_secs == 0 || self.readiness.db_interval_secs == 0 {
            anyhow::bail!("readiness intervals must be > 0");
        }
        if self.pipeline.lease_secs < 1 {
            anyhow::bail!("pipeline.lease_secs must be >= 1");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_toml(&content)
}
