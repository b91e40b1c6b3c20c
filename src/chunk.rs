//! Recursive separator-based text chunker.
//!
//! Splits extracted text into passages of at most `max_size` characters.
//! Separators are tried in priority order (paragraph breaks first); pieces
//! that still exceed the limit are split again with the remaining
//! separators, and hard character cuts are the last resort. Adjacent
//! passages share up to `overlap` characters of context.
//!
//! Sizes are counted in `char`s, never bytes, so multi-byte text is never
//! cut inside a code point. Output depends only on the input text and the
//! parameters.
//!
//! The chunker does not filter anything. Short chunks are only tallied here;
//! dropping them is the index writer's job.

use std::collections::VecDeque;
use thiserror::Error;

use crate::config::ChunkingConfig;
use crate::stats::RunStats;

#[derive(Error, Debug, PartialEq)]
pub enum ChunkError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Split `text` into ordered chunks.
pub fn chunk_text(
    text: &str,
    max_size: usize,
    overlap: usize,
    separators: &[String],
) -> Result<Vec<String>, ChunkError> {
    if max_size == 0 {
        return Err(ChunkError::InvalidConfig("max_size must be > 0".to_string()));
    }
    if overlap >= max_size {
        return Err(ChunkError::InvalidConfig(format!(
            "overlap ({}) must be smaller than max_size ({})",
            overlap, max_size
        )));
    }
    let mut out = Vec::new();
    split_recursive(text, separators, max_size, overlap, &mut out);
    Ok(out)
}

/// Round `len` down to a multiple of `granularity`.
pub fn size_bucket(len: usize, granularity: usize) -> usize {
    if granularity == 0 {
        return len;
    }
    (len / granularity) * granularity
}

/// Chunker bound to one configuration, with statistics collection.
#[derive(Debug, Clone)]
pub struct Chunker {
    max_size: usize,
    overlap: usize,
    separators: Vec<String>,
    min_chunk_size: usize,
    bucket_granularity: usize,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Result<Self, ChunkError> {
        if config.bucket_granularity == 0 {
            return Err(ChunkError::InvalidConfig(
                "bucket_granularity must be > 0".to_string(),
            ));
        }
        // Validate once up front so `split` cannot fail later.
        chunk_text("", config.max_chars, config.overlap_chars, &config.separators)?;
        Ok(Self {
            max_size: config.max_chars,
            overlap: config.overlap_chars,
            separators: config.separators.clone(),
            min_chunk_size: config.min_chunk_size,
            bucket_granularity: config.bucket_granularity,
        })
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        split_recursive(text, &self.separators, self.max_size, self.overlap, &mut out);
        out
    }

    /// Split and tally chunk sizes under `chunk.*` in `stats`.
    pub fn split_with_stats(&self, text: &str, stats: &mut RunStats) -> Vec<String> {
        let chunks = self.split(text);
        for chunk in &chunks {
            let len = char_len(chunk);
            let bucket = size_bucket(len, self.bucket_granularity);
            stats.incr(&["chunk", "total"], 1);
            stats.incr(&["chunk", "size", &format!("{:05}", bucket)], 1);
            if len < self.min_chunk_size {
                stats.incr(&["chunk", "below_min"], 1);
                stats.incr(&["chunk", "below_min_chars"], len as i64);
            }
        }
        chunks
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// First separator (in priority order) present in `text`, with the
/// lower-priority separators left for recursion. An empty separator means
/// "cut anywhere" and yields `None`, as does finding none at all.
fn pick_separator<'s>(text: &str, separators: &'s [String]) -> Option<(&'s str, &'s [String])> {
    for (i, sep) in separators.iter().enumerate() {
        if sep.is_empty() {
            return None;
        }
        if text.contains(sep.as_str()) {
            return Some((sep.as_str(), &separators[i + 1..]));
        }
    }
    None
}

fn split_recursive(
    text: &str,
    separators: &[String],
    max_size: usize,
    overlap: usize,
    out: &mut Vec<String>,
) {
    let Some((sep, rest)) = pick_separator(text, separators) else {
        hard_split(text, max_size, overlap, out);
        return;
    };

    let mut fitting: Vec<&str> = Vec::new();
    for piece in text.split(sep).filter(|p| !p.trim().is_empty()) {
        if char_len(piece) <= max_size {
            fitting.push(piece);
        } else {
            if !fitting.is_empty() {
                merge_pieces(&fitting, sep, max_size, overlap, out);
                fitting.clear();
            }
            split_recursive(piece, rest, max_size, overlap, out);
        }
    }
    if !fitting.is_empty() {
        merge_pieces(&fitting, sep, max_size, overlap, out);
    }
}

/// Greedily pack pieces into chunks, carrying trailing pieces forward while
/// they fit inside `overlap`.
fn merge_pieces(pieces: &[&str], sep: &str, max_size: usize, overlap: usize, out: &mut Vec<String>) {
    let sep_len = char_len(sep);
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for piece in pieces {
        let len = char_len(piece);
        let joined_extra = if window.is_empty() { 0 } else { sep_len };
        if total + len + joined_extra > max_size && !window.is_empty() {
            push_joined(&window, sep, out);
            loop {
                let extra = if window.is_empty() { 0 } else { sep_len };
                let must_shrink = total > overlap || (total + len + extra > max_size && total > 0);
                if !must_shrink {
                    break;
                }
                let sep_part = if window.len() > 1 { sep_len } else { 0 };
                match window.pop_front() {
                    Some(front) => total = total.saturating_sub(char_len(front) + sep_part),
                    None => break,
                }
            }
        }
        if !window.is_empty() {
            total += sep_len;
        }
        window.push_back(piece);
        total += len;
    }
    push_joined(&window, sep, out);
}

fn push_joined(window: &VecDeque<&str>, sep: &str, out: &mut Vec<String>) {
    let joined = window.iter().copied().collect::<Vec<_>>().join(sep);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

/// Fixed-width character windows advancing by `max_size - overlap`.
fn hard_split(text: &str, max_size: usize, overlap: usize, out: &mut Vec<String>) {
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let n_chars = bounds.len() - 1;
    let step = max_size - overlap;

    let mut start = 0usize;
    loop {
        let end = (start + max_size).min(n_chars);
        let piece = text[bounds[start]..bounds[end]].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        if end >= n_chars {
            break;
        }
        start += step;
    }
}
