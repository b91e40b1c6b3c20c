//! Content fetcher.
//!
//! Materializes a file's bytes from the upstream file store at its
//! registered `target_path`. Bodies are streamed to disk through a bounded
//! buffer, so memory use does not grow with file size. A non-success
//! response is a [`SpiderError::Transfer`] and is never retried here.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{Result, SpiderError};

/// Join a storage base URL and a relative link with exactly one `/`.
pub fn make_storage_url(base: &str, link: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        link.trim_start_matches('/')
    )
}

pub struct ContentFetcher {
    client: reqwest::Client,
    base_url: String,
    download_dir: PathBuf,
    block_size: usize,
    dir_ready: OnceCell<()>,
}

impl ContentFetcher {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            download_dir: config.download_dir.clone(),
            block_size: config.block_size,
            dir_ready: OnceCell::new(),
        })
    }

    pub fn url_for(&self, link: &str) -> String {
        make_storage_url(&self.base_url, link)
    }

    /// Download `link` into `dest`, returning the number of bytes written.
    ///
    /// The body lands in `{dest}.part` first and is renamed into place once
    /// complete, so an interrupted transfer never leaves a truncated file at
    /// `dest`.
    pub async fn fetch(&self, link: &str, dest: &Path) -> Result<u64> {
        self.ensure_dirs(dest).await?;

        let url = self.url_for(link);
        let transfer_err = |reason: String| SpiderError::Transfer {
            url: url.clone(),
            reason,
        };

        info!(url = %url, dest = %dest.display(), "downloading");
        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transfer_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(transfer_err(format!("HTTP {}", status)));
        }

        let part = part_path(dest);
        let result = match stream_to(&mut response, &url, &part, self.block_size).await {
            Ok(written) => tokio::fs::rename(&part, dest)
                .await
                .map(|_| written)
                .map_err(SpiderError::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(written) => {
                debug!(url = %url, bytes = written, "download complete");
                Ok(written)
            }
            Err(e) => {
                discard_part(&part).await;
                Err(e)
            }
        }
    }

    async fn ensure_dirs(&self, dest: &Path) -> Result<()> {
        self.dir_ready
            .get_or_try_init(|| async {
                tokio::fs::create_dir_all(&self.download_dir).await?;
                Ok::<_, SpiderError>(())
            })
            .await?;
        // Target paths are normally directly under the download dir.
        if let Some(parent) = dest.parent() {
            if parent != self.download_dir {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}

/// Copy the response body into `part` through a `block_size` buffer.
async fn stream_to(
    response: &mut reqwest::Response,
    url: &str,
    part: &Path,
    block_size: usize,
) -> Result<u64> {
    let file = tokio::fs::File::create(part).await?;
    let mut writer = tokio::io::BufWriter::with_capacity(block_size, file);
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.map_err(|e| SpiderError::Transfer {
        url: url.to_string(),
        reason: e.to_string(),
    })? {
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    writer.flush().await?;
    Ok(written)
}

async fn discard_part(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %part.display(), error = %e, "could not remove partial download"),
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut os = dest.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}
