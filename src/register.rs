//! Registration of storage objects from a JSON-lines manifest.
//!
//! Each non-blank line is one [`FileDescriptor`]. The record's
//! `target_path` is fixed here, once, as `{download_dir}/{name}`. Site names
//! carried by descriptors are upserted into the site directory.

use anyhow::{Context, Result};
use std::path::{Component, Path};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::error::SpiderError;
use crate::ledger::Ledger;
use crate::models::FileDescriptor;
use crate::stats::RunStats;

/// What to do when a descriptor's id is already registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterPolicy {
    /// Abort on the first duplicate.
    Fail,
    /// Leave the existing record untouched and continue.
    #[default]
    Skip,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSummary {
    pub inserted: usize,
    pub skipped: usize,
}

/// Whether `name` is one normal path component, so that joining it onto the
/// download directory cannot leave that directory.
fn is_plain_file_name(name: &str) -> bool {
    if name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == name
    )
}

/// Register one descriptor under `download_dir`. Returns `false` when it was
/// skipped as a duplicate.
pub async fn register_one(
    ledger: &Ledger,
    desc: &FileDescriptor,
    download_dir: &Path,
    policy: RegisterPolicy,
) -> crate::error::Result<bool> {
    if !is_plain_file_name(&desc.name) {
        return Err(SpiderError::InvalidName(desc.name.clone()));
    }
    if let Some(site_name) = &desc.site_name {
        ledger.upsert_site(&desc.site_id, site_name).await?;
    }
    let target_path = download_dir.join(&desc.name);
    match ledger.register(desc, &target_path).await {
        Ok(()) => Ok(true),
        Err(SpiderError::Conflict(id)) if policy == RegisterPolicy::Skip => {
            warn!(id = %id, "already registered, skipping");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

pub async fn register_manifest(
    ledger: &Ledger,
    manifest: &Path,
    download_dir: &Path,
    policy: RegisterPolicy,
    stats: &mut RunStats,
) -> Result<RegisterSummary> {
    let file = tokio::fs::File::open(manifest)
        .await
        .with_context(|| format!("Failed to open manifest: {}", manifest.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut summary = RegisterSummary::default();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let desc: FileDescriptor = serde_json::from_str(line).with_context(|| {
            format!("{}:{}: invalid file descriptor", manifest.display(), line_no)
        })?;

        if register_one(ledger, &desc, download_dir, policy)
            .await
            .with_context(|| format!("{}:{}: registration failed", manifest.display(), line_no))?
        {
            summary.inserted += 1;
            stats.incr(&["register", "inserted"], 1);
        } else {
            summary.skipped += 1;
            stats.incr(&["register", "skipped"], 1);
        }
    }

    info!(
        manifest = %manifest.display(),
        inserted = summary.inserted,
        skipped = summary.skipped,
        "manifest registered"
    );
    Ok(summary)
}
