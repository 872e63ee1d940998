//! End-to-end collection run: period → discover → download → publish → persist.
//!
//! Stages run strictly in sequence. Only a discovery failure or a catalog
//! failure ends the run as [`RunOutcome::Failed`]; per-item problems are
//! collected and the run carries on with whatever succeeded.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};

use domharvest_discovery::{Availability, DiscoveryOptions, LinkDiscoverer};
use domharvest_downloader::{DownloadOptions, Downloader};
use domharvest_publisher::{PublishOptions, PublishReport, Publisher};
use domharvest_shared::{AppConfig, NewPublication, Period, Result, RunId};
use domharvest_storage::Catalog;

use crate::records::build_records;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// Every stage ran, but some items failed.
    PartialFailure,
    /// Discovery or persistence failed.
    Failed,
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Discovering,
    Downloading,
    Publishing,
    Persisting,
    Done(RunOutcome),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Discovering => f.write_str("discovering links"),
            Self::Downloading => f.write_str("downloading"),
            Self::Publishing => f.write_str("publishing"),
            Self::Persisting => f.write_str("saving to catalog"),
            Self::Done(outcome) => write!(f, "done ({outcome:?})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Runtime configuration for a run, resolved from [`AppConfig`] and flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root holding one `YYYY-MM` directory per period.
    pub data_dir: PathBuf,
    /// Catalog database file.
    pub database: PathBuf,
    pub discovery: DiscoveryOptions,
    pub download: DownloadOptions,
    pub publish: PublishOptions,
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            data_dir: config.paths.data_dir.clone(),
            database: config.paths.database.clone(),
            discovery: DiscoveryOptions::from(config),
            download: DownloadOptions::from(config),
            publish: PublishOptions::from(config),
        }
    }
}

impl RunConfig {
    pub fn period_dir(&self, period: Period) -> PathBuf {
        self.data_dir.join(period.dir_name())
    }

    /// Apply one worker pool size to downloads and uploads.
    pub fn set_concurrency(&mut self, concurrency: usize) {
        self.download.concurrency = concurrency;
        self.publish.concurrency = concurrency;
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// One item that did not make it through a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Stage the failure happened in.
    pub stage: RunState,
    /// URL or file path.
    pub item: String,
    pub reason: String,
}

/// Structured account of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub period: Period,
    pub outcome: RunOutcome,
    /// `None` when discovery never completed.
    pub availability: Option<Availability>,
    pub discovered: usize,
    pub downloaded: usize,
    pub download_skipped: usize,
    pub uploaded: usize,
    pub upload_skipped: usize,
    /// Records submitted to the catalog.
    pub persisted: usize,
    pub failures: Vec<ItemFailure>,
    /// Records that could not be saved because the catalog failed.
    pub unsaved: Vec<NewPublication>,
    /// The fatal error, for failed runs.
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl RunSummary {
    fn new(run_id: RunId, period: Period) -> Self {
        Self {
            run_id,
            period,
            outcome: RunOutcome::Success,
            availability: None,
            discovered: 0,
            downloaded: 0,
            download_skipped: 0,
            uploaded: 0,
            upload_skipped: 0,
            persisted: 0,
            failures: Vec::new(),
            unsaved: Vec::new(),
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    fn fail_item(&mut self, stage: RunState, item: impl Into<String>, reason: impl Into<String>) {
        self.failures.push(ItemFailure {
            stage,
            item: item.into(),
            reason: reason.into(),
        });
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called on every state transition.
    fn state_changed(&self, state: RunState);
    /// Called once with the final summary.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn state_changed(&self, _state: RunState) {}
    fn done(&self, _summary: &RunSummary) {}
}

struct Tracker<'a> {
    state: RunState,
    progress: &'a dyn ProgressReporter,
}

impl Tracker<'_> {
    fn advance(&mut self, next: RunState) {
        info!(from = %self.state, to = %next, "run state");
        self.state = next;
        self.progress.state_changed(next);
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Run the full pipeline for `period`.
///
/// Returns `Err` only when the stages cannot be set up (bad configuration);
/// every failure after that is described by the returned summary.
#[instrument(skip_all, fields(run_id = tracing::field::Empty, period = %period))]
pub async fn run(
    period: Period,
    config: &RunConfig,
    progress: &dyn ProgressReporter,
) -> Result<RunSummary> {
    let start = Instant::now();
    let run_id = RunId::new();
    tracing::Span::current().record("run_id", tracing::field::display(&run_id));

    let discoverer = LinkDiscoverer::new(config.discovery.clone())?;
    let downloader = Downloader::new(config.download.clone())?;
    let publisher = Publisher::new(config.publish.clone())?;

    let mut summary = RunSummary::new(run_id, period);
    let mut tracker = Tracker {
        state: RunState::Idle,
        progress,
    };
    info!(run_id = %summary.run_id, "starting run");

    // --- Discovery ---
    tracker.advance(RunState::Discovering);
    let discovery = match discoverer.discover(period).await {
        Ok(discovery) => discovery,
        Err(e) => {
            error!(error = %e, "discovery failed");
            summary.error = Some(format!("discovery failed: {e}"));
            return Ok(finish(summary, RunOutcome::Failed, &mut tracker, start));
        }
    };
    if let Availability::Unavailable { reason } = &discovery.availability {
        warn!(%reason, "portal availability not confirmed, continuing with API results");
    }
    summary.discovered = discovery.links.len();
    summary.availability = Some(discovery.availability);

    // --- Download ---
    tracker.advance(RunState::Downloading);
    let period_dir = config.period_dir(period);
    match downloader.download(&period_dir, &discovery.links).await {
        Ok(report) => {
            summary.downloaded = report.downloaded.len();
            summary.download_skipped = report.skipped.len();
            for (url, reason) in report.failed {
                summary.fail_item(RunState::Downloading, url, reason);
            }
        }
        Err(e) => summary.fail_item(
            RunState::Downloading,
            period_dir.display().to_string(),
            e.to_string(),
        ),
    }

    // --- Publish ---
    tracker.advance(RunState::Publishing);
    let report = match publisher.publish(&period_dir).await {
        Ok(report) => report,
        Err(e) => {
            summary.fail_item(
                RunState::Publishing,
                period_dir.display().to_string(),
                e.to_string(),
            );
            PublishReport::default()
        }
    };
    summary.uploaded = report.sent.len() + report.unrecorded.len();
    summary.upload_skipped = report.skipped.len();
    for (path, reason) in &report.failed {
        summary.fail_item(RunState::Publishing, path.display().to_string(), reason.clone());
    }
    for (entry, reason) in &report.unrecorded {
        summary.fail_item(RunState::Publishing, entry.path.display().to_string(), reason.clone());
    }

    // --- Persist ---
    tracker.advance(RunState::Persisting);
    // Files whose ledger row failed are live on the host; catalog them anyway.
    let published = report
        .sent
        .iter()
        .chain(report.unrecorded.iter().map(|(entry, _)| entry))
        .map(|entry| (entry.path.as_path(), entry.url.as_str()))
        .chain(report.skipped.iter().map(|(path, url)| (path.as_path(), url.as_str())));
    let (records, undated) = build_records(published);
    for (path, reason) in undated {
        summary.fail_item(RunState::Persisting, path.display().to_string(), reason);
    }

    match persist(&config.database, &records).await {
        Ok(submitted) => summary.persisted = submitted,
        Err(e) => {
            error!(error = %e, unsaved = records.len(), "catalog unavailable");
            summary.error = Some(format!("persistence failed: {e}"));
            summary.unsaved = records;
            return Ok(finish(summary, RunOutcome::Failed, &mut tracker, start));
        }
    }

    let outcome = if summary.failures.is_empty() {
        RunOutcome::Success
    } else {
        RunOutcome::PartialFailure
    };
    Ok(finish(summary, outcome, &mut tracker, start))
}

async fn persist(database: &Path, records: &[NewPublication]) -> Result<usize> {
    let catalog = Catalog::open(database).await?;
    catalog.save(records).await
}

fn finish(
    mut summary: RunSummary,
    outcome: RunOutcome,
    tracker: &mut Tracker<'_>,
    start: Instant,
) -> RunSummary {
    summary.outcome = outcome;
    summary.elapsed = start.elapsed();
    tracker.advance(RunState::Done(outcome));

    info!(
        run_id = %summary.run_id,
        outcome = ?summary.outcome,
        discovered = summary.discovered,
        downloaded = summary.downloaded,
        uploaded = summary.uploaded,
        persisted = summary.persisted,
        failures = summary.failures.len(),
        elapsed_ms = summary.elapsed.as_millis(),
        "run finished"
    );

    tracker.progress.done(&summary);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::NaiveDate;
    use domharvest_publisher::{LEDGER_FILE_NAME, read_entries};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const PDF: &[u8] = b"%PDF-1.4\n%%EOF\n";
    const FILES: [&str; 3] = ["dom_20220701.pdf", "dom_20220705.pdf", "dom_20220719.pdf"];

    #[derive(Default)]
    struct RecordingProgress {
        states: Mutex<Vec<RunState>>,
    }

    impl ProgressReporter for RecordingProgress {
        fn state_changed(&self, state: RunState) {
            self.states.lock().unwrap().push(state);
        }
        fn done(&self, _summary: &RunSummary) {}
    }

    fn july() -> Period {
        Period::new(2022, 7).unwrap()
    }

    /// Portal serving the fixture API payload and the three PDFs.
    async fn portal(missing: Option<&str>) -> MockServer {
        let server = MockServer::start().await;
        let body = std::fs::read_to_string("../../../fixtures/api/dom-2022-07.json")
            .expect("read api fixture");
        Mock::given(method("GET"))
            .and(path("/api/dom/data/07/2022"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
        for name in FILES {
            let response = if Some(name) == missing {
                ResponseTemplate::new(404)
            } else {
                ResponseTemplate::new(200).set_body_bytes(PDF)
            };
            Mock::given(method("GET"))
                .and(path(format!("/dom/arquivos/{name}")))
                .respond_with(response)
                .expect(1)
                .mount(&server)
                .await;
        }
        server
    }

    /// Upload host answering with a URL derived from the uploaded file name.
    async fn host(expected_uploads: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(|req: &Request| {
                let body = String::from_utf8_lossy(&req.body);
                let name = body
                    .split("filename=\"")
                    .nth(1)
                    .and_then(|rest| rest.split('"').next())
                    .unwrap_or("unknown")
                    .to_string();
                ResponseTemplate::new(200)
                    .insert_header("X-Token", "tok")
                    .set_body_string(format!("https://0x0.st/{name}\n"))
            })
            .expect(expected_uploads)
            .mount(&server)
            .await;
        server
    }

    fn run_config(portal: &MockServer, host: &MockServer, dir: &TempDir) -> RunConfig {
        let mut app = AppConfig::default();
        app.portal.base_url = portal.uri();
        app.paths.data_dir = dir.path().join("data");
        app.paths.database = dir.path().join("data").join("domharvest.db");
        app.upload.host_url = host.uri();
        app.http.max_attempts = 1;
        app.http.timeout_secs = 5;
        app.http.download_timeout_secs = 5;
        app.http.upload_timeout_secs = 5;
        RunConfig::from(&app)
    }

    #[tokio::test]
    async fn full_run_is_idempotent() {
        let portal = portal(None).await;
        let host = host(3).await;
        let dir = TempDir::new().unwrap();
        let config = run_config(&portal, &host, &dir);
        let progress = RecordingProgress::default();

        let summary = run(july(), &config, &progress).await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::Success, "{:?}", summary.failures);
        assert_eq!(summary.discovered, 3);
        assert_eq!(summary.downloaded, 3);
        assert_eq!(summary.uploaded, 3);
        assert_eq!(summary.persisted, 3);
        assert_eq!(
            *progress.states.lock().unwrap(),
            vec![
                RunState::Discovering,
                RunState::Downloading,
                RunState::Publishing,
                RunState::Persisting,
                RunState::Done(RunOutcome::Success),
            ]
        );

        let period_dir = config.period_dir(july());
        assert_eq!(read_entries(&period_dir.join(LEDGER_FILE_NAME)).unwrap().len(), 3);

        let catalog = Catalog::open(&config.database).await.unwrap();
        let records = catalog.list_by_period(july()).await.unwrap();
        let dates: Vec<NaiveDate> = records.iter().map(|r| r.date).collect();
        assert_eq!(
            dates,
            [1, 5, 19].map(|d| NaiveDate::from_ymd_opt(2022, 7, d).unwrap())
        );
        assert_eq!(records[0].link, "https://0x0.st/dom_20220701.pdf");

        // Nothing is fetched or uploaded again; the mock expectations hold.
        let again = run(july(), &config, &SilentProgress).await.unwrap();
        assert_eq!(again.outcome, RunOutcome::Success);
        assert_eq!(again.downloaded, 0);
        assert_eq!(again.download_skipped, 3);
        assert_eq!(again.upload_skipped, 3);
        assert_eq!(catalog.list_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn discovery_failure_fails_the_run() {
        let portal = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&portal)
            .await;
        let host = host(0).await;
        let dir = TempDir::new().unwrap();
        let config = run_config(&portal, &host, &dir);
        let progress = RecordingProgress::default();

        let summary = run(july(), &config, &progress).await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::Failed);
        assert!(summary.error.as_deref().unwrap().contains("500"));
        assert_eq!(
            *progress.states.lock().unwrap(),
            vec![RunState::Discovering, RunState::Done(RunOutcome::Failed)]
        );
        assert!(!config.period_dir(july()).exists());
    }

    #[tokio::test]
    async fn failed_download_is_a_partial_failure() {
        let portal = portal(Some("dom_20220705.pdf")).await;
        let host = host(2).await;
        let dir = TempDir::new().unwrap();
        let config = run_config(&portal, &host, &dir);

        let summary = run(july(), &config, &SilentProgress).await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::PartialFailure);
        assert_eq!(summary.downloaded, 2);
        assert_eq!(summary.uploaded, 2);
        assert_eq!(summary.persisted, 2);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].stage, RunState::Downloading);
        assert!(summary.failures[0].item.ends_with("dom_20220705.pdf"));
    }

    #[tokio::test]
    async fn catalog_failure_reports_unsaved_records() {
        let portal = portal(None).await;
        let host = host(3).await;
        let dir = TempDir::new().unwrap();
        let mut config = run_config(&portal, &host, &dir);
        // A directory cannot be opened as a database.
        config.database = dir.path().to_path_buf();

        let summary = run(july(), &config, &SilentProgress).await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::Failed);
        assert_eq!(summary.uploaded, 3);
        assert_eq!(summary.unsaved.len(), 3);
        assert!(summary.error.as_deref().unwrap().starts_with("persistence failed"));
    }
}
