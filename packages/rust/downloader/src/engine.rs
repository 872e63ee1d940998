//! Concurrent, skip-if-present PDF downloader.
//!
//! Every link maps to one file name inside the period directory. A name is
//! claimed before any work is spawned, so two workers never race on the same
//! file; a name whose file already exists is skipped without touching the
//! network. Bodies stream into `<name>.part` and are renamed into place once
//! complete.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, instrument, warn};
use url::Url;

use domharvest_shared::http::{browser_client, ensure_success, network_error};
use domharvest_shared::{
    AppConfig, HarvestError, PublicationLink, Result, RetryPolicy, SERVER_ERROR_STATUSES,
};

/// Name used when a URL has no usable final path segment.
const FALLBACK_FILE_NAME: &str = "arquivo.pdf";

const PART_SUFFIX: &str = ".part";

// ---------------------------------------------------------------------------
// DownloadReport
// ---------------------------------------------------------------------------

/// Summary of a completed download batch.
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    /// Files fetched in this batch.
    pub downloaded: Vec<PathBuf>,
    /// Files already on disk (or claimed by an earlier link of the batch).
    pub skipped: Vec<PathBuf>,
    /// Links that failed (URL, reason).
    pub failed: Vec<(String, String)>,
    /// Bytes written by this batch.
    pub bytes: u64,
    /// Wall time of the batch.
    pub duration: Duration,
}

/// What happened to a single link.
enum Outcome {
    Downloaded { path: PathBuf, bytes: u64 },
    Skipped(PathBuf),
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Worker pool size.
    pub concurrency: usize,
    /// Timeout for one download, body included.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Sent as `Referer` so the portal serves the file.
    pub referer: Option<String>,
}

impl From<&AppConfig> for DownloadOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.http.concurrency,
            timeout: Duration::from_secs(config.http.download_timeout_secs),
            retry: config.http.retry_policy(SERVER_ERROR_STATUSES),
            referer: config.portal.portal_url().ok().map(|u| u.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Downloader
// ---------------------------------------------------------------------------

/// Materializes publication links as local files.
pub struct Downloader {
    client: Client,
    opts: DownloadOptions,
}

impl Downloader {
    /// Create a downloader whose client impersonates a browser.
    pub fn new(opts: DownloadOptions) -> Result<Self> {
        if opts.concurrency == 0 {
            return Err(HarvestError::config("download concurrency must be greater than 0"));
        }
        let client = browser_client(opts.referer.as_deref(), opts.timeout)?;
        Ok(Self { client, opts })
    }

    /// Ensure every link exists as a file in `period_dir`.
    ///
    /// Only a directory that cannot be created is an error; per-link
    /// failures are collected in the report.
    #[instrument(skip_all, fields(dir = %period_dir.display(), links = links.len()))]
    pub async fn download(
        &self,
        period_dir: &Path,
        links: &[PublicationLink],
    ) -> Result<DownloadReport> {
        let start_time = std::time::Instant::now();

        tokio::fs::create_dir_all(period_dir)
            .await
            .map_err(|e| HarvestError::io(period_dir, e))?;

        let claimed = Arc::new(Mutex::new(HashSet::<String>::new()));
        let semaphore = Arc::new(Semaphore::new(self.opts.concurrency));
        let mut report = DownloadReport::default();
        let mut handles = Vec::new();

        info!(concurrency = self.opts.concurrency, "starting downloads");

        for link in links {
            let name = file_name_for(link.as_str());
            let dest = period_dir.join(&name);

            // Claim the name; a later link mapping to the same file is a skip.
            if !claimed.lock().await.insert(name.clone()) {
                debug!(%link, %name, "file name already claimed in this batch");
                report.skipped.push(dest);
                continue;
            }

            let client = self.client.clone();
            let retry = self.opts.retry.clone();
            let sem = semaphore.clone();
            let url = link.to_string();

            handles.push(tokio::spawn(async move {
                let outcome = match sem.acquire().await {
                    Ok(_permit) => fetch_if_missing(&client, &retry, &url, &dest).await,
                    Err(_) => Err(HarvestError::validation("download pool closed")),
                };
                (url, outcome)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((_, Ok(Outcome::Downloaded { path, bytes }))) => {
                    report.bytes += bytes;
                    report.downloaded.push(path);
                }
                Ok((_, Ok(Outcome::Skipped(path)))) => report.skipped.push(path),
                Ok((url, Err(e))) => {
                    warn!(%url, error = %e, "download failed");
                    report.failed.push((url, e.to_string()));
                }
                Err(e) => report.failed.push(("task".into(), e.to_string())),
            }
        }

        report.duration = start_time.elapsed();

        info!(
            downloaded = report.downloaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            bytes = report.bytes,
            duration_ms = report.duration.as_millis(),
            "downloads completed"
        );

        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

async fn fetch_if_missing(
    client: &Client,
    retry: &RetryPolicy,
    url: &str,
    dest: &Path,
) -> Result<Outcome> {
    if tokio::fs::try_exists(dest)
        .await
        .map_err(|e| HarvestError::io(dest, e))?
    {
        debug!(path = %dest.display(), "already downloaded");
        return Ok(Outcome::Skipped(dest.to_path_buf()));
    }

    let part = part_path(dest);
    let bytes = retry
        .run(url, || stream_to_file(client, url, &part))
        .await?;

    tokio::fs::rename(&part, dest)
        .await
        .map_err(|e| HarvestError::io(dest, e))?;

    debug!(%url, path = %dest.display(), bytes, "downloaded");
    Ok(Outcome::Downloaded {
        path: dest.to_path_buf(),
        bytes,
    })
}

/// One attempt: stream the body of `url` into `part`, chunk by chunk.
async fn stream_to_file(client: &Client, url: &str, part: &Path) -> Result<u64> {
    remove_stale(part).await?;

    let result = async {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| network_error(url, e))?;
        let mut response = ensure_success(url, response)?;

        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| HarvestError::io(part, e))?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(|e| network_error(url, e))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| HarvestError::io(part, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| HarvestError::io(part, e))?;
        Ok(written)
    }
    .await;

    if result.is_err() {
        let _ = remove_stale(part).await;
    }
    result
}

async fn remove_stale(part: &Path) -> Result<()> {
    match tokio::fs::remove_file(part).await {
        Ok(()) => {
            debug!(path = %part.display(), "removed partial file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HarvestError::io(part, e)),
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Local file name for a link: the last URL path segment, with `.pdf`
/// appended when it does not already end that way.
pub fn file_name_for(link: &str) -> String {
    let segment = Url::parse(link)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .unwrap_or_else(|| {
            link.split(['?', '#'])
                .next()
                .and_then(|path| path.rsplit('/').next())
                .unwrap_or_default()
                .to_string()
        });

    let segment = segment.trim();
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
        return FALLBACK_FILE_NAME.to_string();
    }
    if segment.to_ascii_lowercase().ends_with(".pdf") {
        segment.to_string()
    } else {
        format!("{segment}.pdf")
    }
}
