//! Publish downloaded gazettes to the anonymous file host.
//!
//! Every `*.pdf` directly inside a period directory is uploaded once; the
//! period's ledger remembers what was sent. Per-file failures (too large,
//! terminal status, retries exhausted) are collected, never raised.

pub mod ledger;
pub mod upload;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, instrument, warn};

use domharvest_shared::{
    AppConfig, HarvestError, LedgerEntry, Result, RetryPolicy, UPLOAD_RETRY_STATUSES,
};

pub use ledger::{CsvLedger, LEDGER_FILE_NAME, Ledger, read_entries};
pub use upload::{UploadClient, Uploaded};

// ---------------------------------------------------------------------------
// PublishReport
// ---------------------------------------------------------------------------

/// Summary of a publish pass over one period directory.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    /// Files uploaded in this pass, as written to the ledger.
    pub sent: Vec<LedgerEntry>,
    /// Files already in the ledger, with their recorded URL.
    pub skipped: Vec<(PathBuf, String)>,
    /// Files that could not be published (path, reason).
    pub failed: Vec<(PathBuf, String)>,
    /// Files uploaded in this pass whose ledger row could not be written,
    /// with the reason. Their URLs are live but the next pass will not know.
    pub unrecorded: Vec<(LedgerEntry, String)>,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub host_url: String,
    /// Ask for a hard-to-guess URL.
    pub secret: bool,
    /// Retention window requested from the host.
    pub expires_hours: Option<u32>,
    /// Files larger than this are rejected locally.
    pub max_bytes: u64,
    /// Upload files even when the ledger already has them.
    pub force: bool,
    pub concurrency: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl From<&AppConfig> for PublishOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            host_url: config.upload.host_url.clone(),
            secret: config.upload.secret,
            expires_hours: config.upload.expires_hours,
            max_bytes: config.upload.max_bytes,
            force: false,
            concurrency: config.http.concurrency,
            timeout: Duration::from_secs(config.http.upload_timeout_secs),
            retry: config.http.retry_policy(UPLOAD_RETRY_STATUSES),
        }
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

pub struct Publisher {
    uploader: UploadClient,
    opts: PublishOptions,
}

impl Publisher {
    pub fn new(opts: PublishOptions) -> Result<Self> {
        if opts.concurrency == 0 {
            return Err(HarvestError::config("upload concurrency must be greater than 0"));
        }
        let uploader = UploadClient::new(
            opts.host_url.clone(),
            opts.secret,
            opts.expires_hours,
            opts.timeout,
        )?;
        Ok(Self { uploader, opts })
    }

    /// Upload every unpublished PDF of `period_dir` and record it in the ledger.
    ///
    /// Errors only when the directory or its ledger cannot be read.
    #[instrument(skip_all, fields(dir = %period_dir.display(), force = self.opts.force))]
    pub async fn publish(&self, period_dir: &Path) -> Result<PublishReport> {
        let start_time = std::time::Instant::now();
        let mut report = PublishReport::default();

        let files = list_pdfs(period_dir).await?;
        if files.is_empty() {
            info!("nothing to publish");
            return Ok(report);
        }

        let ledger = Arc::new(Mutex::new(CsvLedger::open(period_dir.join(LEDGER_FILE_NAME))?));
        let semaphore = Arc::new(Semaphore::new(self.opts.concurrency));
        let mut handles = Vec::new();

        info!(files = files.len(), "starting uploads");

        // Skip and size decisions are made here, one file at a time, before any
        // worker runs; workers only ever see files nobody else will touch.
        for (path, bytes) in files {
            if !self.opts.force {
                if let Some(url) = ledger.lock().await.lookup(&path) {
                    debug!(path = %path.display(), %url, "already published");
                    report.skipped.push((path, url.to_string()));
                    continue;
                }
            }

            if bytes > self.opts.max_bytes {
                let reason = format!(
                    "file is {bytes} bytes, above the {} byte upload limit",
                    self.opts.max_bytes
                );
                warn!(path = %path.display(), %reason, "rejected before upload");
                report.failed.push((path, reason));
                continue;
            }

            let uploader = self.uploader.clone();
            let retry = self.opts.retry.clone();
            let ledger = ledger.clone();
            let sem = semaphore.clone();

            handles.push(tokio::spawn(async move {
                let outcome = match sem.acquire().await {
                    Ok(_permit) => upload_and_record(&uploader, &retry, &ledger, &path, bytes).await,
                    Err(_) => Err(HarvestError::validation("upload pool closed")),
                };
                (path, outcome)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((_, Ok(UploadOutcome::Recorded(entry)))) => report.sent.push(entry),
                Ok((path, Ok(UploadOutcome::Unrecorded(entry, reason)))) => {
                    warn!(path = %path.display(), url = %entry.url, %reason, "ledger write failed");
                    report.unrecorded.push((entry, reason));
                }
                Ok((path, Err(e))) => {
                    warn!(path = %path.display(), error = %e, "upload failed");
                    report.failed.push((path, e.to_string()));
                }
                Err(e) => report.failed.push((PathBuf::from("task"), e.to_string())),
            }
        }

        // Workers finish in any order; keep the report in file order.
        report.sent.sort_by(|a, b| a.path.cmp(&b.path));
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));
        report.unrecorded.sort_by(|a, b| a.0.path.cmp(&b.0.path));
        report.duration = start_time.elapsed();

        info!(
            sent = report.sent.len(),
            unrecorded = report.unrecorded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            duration_ms = report.duration.as_millis(),
            "uploads completed"
        );

        Ok(report)
    }
}

/// What became of a file the host accepted.
enum UploadOutcome {
    Recorded(LedgerEntry),
    /// The ledger append failed (reason attached).
    Unrecorded(LedgerEntry, String),
}

/// Upload one file and append it to `ledger`. `Err` means the upload failed.
async fn upload_and_record<L: Ledger>(
    uploader: &UploadClient,
    retry: &RetryPolicy,
    ledger: &Mutex<L>,
    path: &Path,
    bytes: u64,
) -> Result<UploadOutcome> {
    let label = path.display().to_string();
    let uploaded = retry.run(&label, || uploader.upload(path, bytes)).await?;

    let entry = LedgerEntry {
        path: path.to_path_buf(),
        url: uploaded.url,
        token: uploaded.token,
        bytes,
        uploaded_at: Local::now().fixed_offset(),
    };

    if let Err(e) = ledger.lock().await.append(&entry) {
        let reason = format!("uploaded to {} but ledger write failed: {e}", entry.url);
        return Ok(UploadOutcome::Unrecorded(entry, reason));
    }

    info!(path = %path.display(), url = %entry.url, "published");
    Ok(UploadOutcome::Recorded(entry))
}

/// Absolute paths and sizes of the `*.pdf` files directly inside `dir`, sorted.
async fn list_pdfs(dir: &Path) -> Result<Vec<(PathBuf, u64)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "period directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(HarvestError::io(dir, e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| HarvestError::io(dir, e))? {
        let path = entry.path();
        let is_pdf = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if !is_pdf {
            continue;
        }
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| HarvestError::io(&path, e))?;
        if !meta.is_file() {
            continue;
        }
        let absolute = tokio::fs::canonicalize(&path)
            .await
            .map_err(|e| HarvestError::io(&path, e))?;
        files.push((absolute, meta.len()));
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options(server: &MockServer) -> PublishOptions {
        PublishOptions {
            host_url: server.uri(),
            secret: false,
            expires_hours: None,
            max_bytes: domharvest_shared::MAX_UPLOAD_BYTES,
            force: false,
            concurrency: 2,
            timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                retry_statuses: UPLOAD_RETRY_STATUSES.to_vec(),
            },
        }
    }

    fn ok(url: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("X-Token", "tok")
            .set_body_string(format!("{url}\n"))
    }

    fn period_dir(files: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for name in files {
            std::fs::write(dir.path().join(name), b"%PDF-1.4 test").unwrap();
        }
        dir
    }

    fn ledger_rows(dir: &Path) -> Vec<LedgerEntry> {
        read_entries(&dir.join(LEDGER_FILE_NAME)).unwrap()
    }

    #[tokio::test]
    async fn second_pass_skips_ledgered_files() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ok("https://0x0.st/a.pdf"))
            .expect(2)
            .mount(&server)
            .await;
        let dir = period_dir(&["a.pdf", "b.PDF", "notes.txt"]);
        let publisher = Publisher::new(options(&server)).unwrap();

        let first = publisher.publish(dir.path()).await.unwrap();
        assert_eq!(first.sent.len(), 2);
        assert!(first.failed.is_empty());
        assert_eq!(first.sent[0].token.as_deref(), Some("tok"));
        assert!(first.sent.iter().all(|e| e.path.is_absolute()));

        let second = publisher.publish(dir.path()).await.unwrap();
        assert!(second.sent.is_empty());
        assert_eq!(second.skipped.len(), 2);
        assert_eq!(second.skipped[0].1, "https://0x0.st/a.pdf");
        assert_eq!(ledger_rows(dir.path()).len(), 2);
    }

    #[tokio::test]
    async fn force_appends_a_second_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok("https://0x0.st/first.pdf"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ok("https://0x0.st/second.pdf"))
            .mount(&server)
            .await;
        let dir = period_dir(&["a.pdf"]);

        Publisher::new(options(&server)).unwrap().publish(dir.path()).await.unwrap();
        let forced = Publisher::new(PublishOptions {
            force: true,
            ..options(&server)
        })
        .unwrap()
        .publish(dir.path())
        .await
        .unwrap();

        assert_eq!(forced.sent.len(), 1);
        let rows = ledger_rows(dir.path());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].path, rows[1].path);

        let ledger = CsvLedger::open(dir.path().join(LEDGER_FILE_NAME)).unwrap();
        assert_eq!(ledger.lookup(&rows[0].path), Some("https://0x0.st/second.pdf"));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_without_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok("https://0x0.st/x.pdf"))
            .expect(0)
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let big = std::fs::File::create(dir.path().join("big.pdf")).unwrap();
        big.set_len(600 * 1024 * 1024).unwrap();

        let report = Publisher::new(options(&server)).unwrap().publish(dir.path()).await.unwrap();

        assert!(report.sent.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("limit"));
        assert!(ledger_rows(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn client_errors_are_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(413))
            .expect(1)
            .mount(&server)
            .await;
        let dir = period_dir(&["a.pdf"]);

        let report = Publisher::new(options(&server)).unwrap().publish(dir.path()).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("413"));
        assert!(!dir.path().join(LEDGER_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn rate_limits_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ok("https://0x0.st/a.pdf"))
            .expect(1)
            .mount(&server)
            .await;
        let dir = period_dir(&["a.pdf"]);

        let report = Publisher::new(options(&server)).unwrap().publish(dir.path()).await.unwrap();

        assert_eq!(report.sent.len(), 1);
        assert_eq!(report.sent[0].url, "https://0x0.st/a.pdf");
    }

    /// Ledger whose writes always fail.
    struct ReadOnlyLedger;

    impl Ledger for ReadOnlyLedger {
        fn lookup(&self, _path: &Path) -> Option<&str> {
            None
        }

        fn append(&mut self, _entry: &LedgerEntry) -> Result<()> {
            Err(HarvestError::Storage("disk full".into()))
        }
    }

    #[tokio::test]
    async fn ledger_failure_keeps_the_uploaded_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ok("https://0x0.st/a.pdf"))
            .expect(1)
            .mount(&server)
            .await;
        let dir = period_dir(&["a.pdf"]);
        let file = dir.path().join("a.pdf");
        let opts = options(&server);
        let uploader = UploadClient::new(opts.host_url.clone(), false, None, opts.timeout).unwrap();

        let outcome = upload_and_record(&uploader, &opts.retry, &Mutex::new(ReadOnlyLedger), &file, 13)
            .await
            .unwrap();

        let UploadOutcome::Unrecorded(entry, reason) = outcome else {
            panic!("expected an unrecorded upload");
        };
        assert_eq!(entry.url, "https://0x0.st/a.pdf");
        assert_eq!(entry.path, file);
        assert!(reason.contains("disk full"), "{reason}");
    }

    #[tokio::test]
    async fn missing_directory_publishes_nothing() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let report = Publisher::new(options(&server))
            .unwrap()
            .publish(&dir.path().join("2031-01"))
            .await
            .unwrap();
        assert!(report.sent.is_empty() && report.failed.is_empty());
    }
}
