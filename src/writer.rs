//! Vector index writer.
//!
//! Admits chunks by minimum length, attaches the shared parent metadata and
//! the chunk ordinal, and submits everything for one source object as a
//! single batch. A batch whose error count exceeds the configured threshold
//! fails as a whole with [`SpiderError::BatchWrite`].
//!
//! Ordinals are 1-based positions in the chunker's output, so they stay
//! stable when short chunks in between are skipped.

use tracing::{error, info};
use uuid::Uuid;

use crate::config::IndexConfig;
use crate::error::{Result, SpiderError};
use crate::index::VectorIndex;
use crate::models::{EntryMetadata, IndexRecord};
use crate::stats::RunStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub inserted: usize,
    pub skipped: usize,
    /// Characters in skipped chunks.
    pub skipped_bytes: usize,
}

/// Stable entry id for chunk `ordinal` of `object_id`.
pub fn entry_id(object_id: &str, ordinal: i64) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", object_id, ordinal).as_bytes(),
    )
    .to_string()
}

pub struct IndexWriter<'a> {
    index: &'a dyn VectorIndex,
    max_batch_errors: usize,
    deterministic_ids: bool,
}

impl<'a> IndexWriter<'a> {
    pub fn new(index: &'a dyn VectorIndex, config: &IndexConfig) -> Self {
        Self {
            index,
            max_batch_errors: config.max_batch_errors,
            deterministic_ids: config.deterministic_ids,
        }
    }

    /// Admit, annotate and submit `chunks`.
    ///
    /// Updates `vectordb.{inserted,skipped,skipped_bytes}` in `stats`.
    pub async fn write_batch(
        &self,
        chunks: &[String],
        metadata: &EntryMetadata,
        min_chunk_size: usize,
        stats: &mut RunStats,
    ) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        let mut records = Vec::with_capacity(chunks.len());

        for (i, chunk) in chunks.iter().enumerate() {
            let len = chunk.chars().count();
            if len < min_chunk_size {
                outcome.skipped += 1;
                outcome.skipped_bytes += len;
                continue;
            }
            let ordinal = i as i64 + 1;
            records.push(IndexRecord {
                id: self
                    .deterministic_ids
                    .then(|| entry_id(&metadata.object_id, ordinal)),
                content: chunk.clone(),
                chunk_id: ordinal,
                metadata: metadata.clone(),
            });
        }

        stats.incr(&["vectordb", "skipped"], outcome.skipped as i64);
        stats.incr(&["vectordb", "skipped_bytes"], outcome.skipped_bytes as i64);

        if records.is_empty() {
            info!(object = %metadata.object_id, skipped = outcome.skipped, "nothing to index");
            return Ok(outcome);
        }

        info!(object = %metadata.object_id, count = records.len(), "inserting into vector index");
        let batch = self.index.insert_batch(&records).await?;
        if batch.errors.len() > self.max_batch_errors {
            error!(
                object = %metadata.object_id,
                errors = batch.errors.len(),
                first = batch.errors.first().map(String::as_str).unwrap_or(""),
                "batch insert errors"
            );
            return Err(SpiderError::BatchWrite {
                errors: batch.errors.len(),
                allowed: self.max_batch_errors,
            });
        }

        outcome.inserted = batch.inserted;
        stats.incr(&["vectordb", "inserted"], outcome.inserted as i64);
        Ok(outcome)
    }
}
