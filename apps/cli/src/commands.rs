//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use domharvest_core::{ProgressReporter, RunConfig, RunOutcome, RunState, RunSummary};
use domharvest_discovery::LinkDiscoverer;
use domharvest_downloader::Downloader;
use domharvest_publisher::Publisher;
use domharvest_shared::{AppConfig, Period, init_config, load_config, load_config_from};
use domharvest_storage::Catalog;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// domharvest: collect, publish and catalog the monthly municipal gazette.
#[derive(Parser)]
#[command(
    name = "domharvest",
    version,
    about = "Collect a month of municipal gazette PDFs, publish them and catalog the links.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.domharvest/domharvest.toml.
    #[arg(long, global = true, env = "DOMHARVEST_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Discover, download, publish and catalog one period.
    Run {
        #[command(flatten)]
        period: PeriodArgs,
        #[command(flatten)]
        browser: BrowserArgs,
        #[command(flatten)]
        pool: PoolArgs,
        #[command(flatten)]
        upload: UploadArgs,
    },

    /// Print the PDF links published for a period.
    Discover {
        #[command(flatten)]
        period: PeriodArgs,
        #[command(flatten)]
        browser: BrowserArgs,
    },

    /// Discover and download a period without publishing.
    Download {
        #[command(flatten)]
        period: PeriodArgs,
        #[command(flatten)]
        browser: BrowserArgs,
        #[command(flatten)]
        pool: PoolArgs,
    },

    /// Upload the downloaded files of a period and update its ledger.
    Publish {
        #[command(flatten)]
        period: PeriodArgs,
        #[command(flatten)]
        pool: PoolArgs,
        #[command(flatten)]
        upload: UploadArgs,
    },

    /// List cataloged publications.
    List {
        /// Only show publications dated within this month (YYYY-MM).
        #[arg(long)]
        period: Option<Period>,
    },

    /// Delete every cataloged publication.
    Purge {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct PeriodArgs {
    /// Month to collect (YYYY-MM). Defaults to the previous month.
    #[arg(short, long)]
    pub period: Option<Period>,
}

impl PeriodArgs {
    fn resolve(&self) -> Period {
        self.period
            .unwrap_or_else(|| Period::previous_month(chrono::Local::now().date_naive()))
    }
}

#[derive(Args, Debug, Clone)]
pub(crate) struct BrowserArgs {
    /// Skip the browser session even if a WebDriver endpoint is configured.
    #[arg(long)]
    pub no_browser: bool,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct PoolArgs {
    /// Parallel downloads/uploads.
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub concurrency: Option<u16>,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct UploadArgs {
    /// Upload files even if the ledger already lists them.
    #[arg(long)]
    pub force: bool,

    /// Request hard-to-guess URLs.
    #[arg(long)]
    pub secret: bool,

    /// Retention window in hours.
    #[arg(long, value_name = "HOURS")]
    pub expires: Option<u32>,
}

impl BrowserArgs {
    fn apply(&self, config: &mut RunConfig) {
        if self.no_browser {
            config.discovery.use_browser = false;
        }
    }
}

impl PoolArgs {
    fn apply(&self, config: &mut RunConfig) {
        if let Some(n) = self.concurrency {
            config.set_concurrency(usize::from(n));
        }
    }
}

impl UploadArgs {
    fn apply(&self, config: &mut RunConfig) {
        config.publish.force = self.force;
        config.publish.secret |= self.secret;
        if self.expires.is_some() {
            config.publish.expires_hours = self.expires;
        }
    }
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "domharvest=info",
        1 => "domharvest=debug",
        _ => "domharvest=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
        command => {
            let config = resolve_config(config_path)?;
            match command {
                Command::Run {
                    period,
                    browser,
                    pool,
                    upload,
                } => {
                    let mut run_config = RunConfig::from(&config);
                    browser.apply(&mut run_config);
                    pool.apply(&mut run_config);
                    upload.apply(&mut run_config);
                    cmd_run(period.resolve(), &run_config).await
                }
                Command::Discover { period, browser } => {
                    let mut run_config = RunConfig::from(&config);
                    browser.apply(&mut run_config);
                    cmd_discover(period.resolve(), &run_config).await
                }
                Command::Download {
                    period,
                    browser,
                    pool,
                } => {
                    let mut run_config = RunConfig::from(&config);
                    browser.apply(&mut run_config);
                    pool.apply(&mut run_config);
                    cmd_download(period.resolve(), &run_config).await
                }
                Command::Publish {
                    period,
                    pool,
                    upload,
                } => {
                    let mut run_config = RunConfig::from(&config);
                    pool.apply(&mut run_config);
                    upload.apply(&mut run_config);
                    cmd_publish(period.resolve(), &run_config).await
                }
                Command::List { period } => cmd_list(&config, period).await,
                Command::Purge { yes } => cmd_purge(&config, yes).await,
                Command::Config { .. } => Ok(()),
            }
        }
    }
}

fn resolve_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(&path)?,
        None => load_config()?,
    };
    Ok(config)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(period: Period, config: &RunConfig) -> Result<()> {
    info!(%period, "starting collection run");

    let reporter = CliProgress::new();
    let summary = domharvest_core::run(period, config, &reporter).await?;
    print_summary(&summary);

    match summary.outcome {
        RunOutcome::Failed => Err(eyre!(
            "run {} failed: {}",
            summary.run_id,
            summary.error.as_deref().unwrap_or("unknown error")
        )),
        RunOutcome::Success | RunOutcome::PartialFailure => Ok(()),
    }
}

async fn cmd_discover(period: Period, config: &RunConfig) -> Result<()> {
    let discovery = LinkDiscoverer::new(config.discovery.clone())?
        .discover(period)
        .await?;

    for link in &discovery.links {
        println!("{link}");
    }
    eprintln!();
    eprintln!("  Period:     {period}");
    eprintln!("  Links:      {}", discovery.links.len());
    eprintln!("  Resolved:   {}", discovery.resolved);
    eprintln!("  Portal:     {:?}", discovery.availability);
    Ok(())
}

async fn cmd_download(period: Period, config: &RunConfig) -> Result<()> {
    let discovery = LinkDiscoverer::new(config.discovery.clone())?
        .discover(period)
        .await?;
    let dir = config.period_dir(period);
    let report = Downloader::new(config.download.clone())?
        .download(&dir, &discovery.links)
        .await?;

    println!();
    println!("  Directory:  {}", dir.display());
    println!("  Discovered: {}", discovery.links.len());
    println!("  Downloaded: {}", report.downloaded.len());
    println!("  Skipped:    {}", report.skipped.len());
    println!("  Failed:     {}", report.failed.len());
    for (url, reason) in &report.failed {
        println!("    {url}: {reason}");
    }
    println!();
    Ok(())
}

async fn cmd_publish(period: Period, config: &RunConfig) -> Result<()> {
    let dir = config.period_dir(period);
    let report = Publisher::new(config.publish.clone())?.publish(&dir).await?;

    println!();
    for entry in &report.sent {
        println!("  sent     {} -> {}", entry.path.display(), entry.url);
    }
    for (path, url) in &report.skipped {
        println!("  skipped  {} -> {url}", path.display());
    }
    for (entry, reason) in &report.unrecorded {
        println!("  sent     {} -> {} ({reason})", entry.path.display(), entry.url);
    }
    for (path, reason) in &report.failed {
        println!("  failed   {}: {reason}", path.display());
    }
    println!();
    println!(
        "  Sent: {}  Unrecorded: {}  Skipped: {}  Failed: {}",
        report.sent.len(),
        report.unrecorded.len(),
        report.skipped.len(),
        report.failed.len()
    );
    println!();
    Ok(())
}

async fn cmd_list(config: &AppConfig, period: Option<Period>) -> Result<()> {
    let catalog = Catalog::open_readonly(&config.paths.database).await?;
    let records = match period {
        Some(period) => catalog.list_by_period(period).await?,
        None => catalog.list_all().await?,
    };

    if records.is_empty() {
        println!("No publications cataloged.");
        return Ok(());
    }
    for record in &records {
        println!("{:>6}  {}  {}", record.id, record.date, record.link);
    }
    Ok(())
}

async fn cmd_purge(config: &AppConfig, yes: bool) -> Result<()> {
    if !yes {
        return Err(eyre!("refusing to purge the catalog without --yes"));
    }
    let catalog = Catalog::open(&config.paths.database).await?;
    let report = catalog.delete_all().await?;

    for link in &report.links {
        println!("  removed  {link}");
    }
    println!("  {} publication(s) removed", report.removed);
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<PathBuf>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("  Run:        {}", summary.run_id);
    println!("  Period:     {}", summary.period);
    println!("  Outcome:    {:?}", summary.outcome);
    if let Some(availability) = &summary.availability {
        println!("  Portal:     {availability:?}");
    }
    println!("  Discovered: {}", summary.discovered);
    println!(
        "  Downloaded: {} ({} already present)",
        summary.downloaded, summary.download_skipped
    );
    println!(
        "  Uploaded:   {} ({} already published)",
        summary.uploaded, summary.upload_skipped
    );
    println!("  Persisted:  {}", summary.persisted);
    if !summary.failures.is_empty() {
        println!("  Failures:");
        for failure in &summary.failures {
            println!("    [{}] {}: {}", failure.stage, failure.item, failure.reason);
        }
    }
    if !summary.unsaved.is_empty() {
        println!("  Unsaved records:");
        for record in &summary.unsaved {
            println!("    {}  {}", record.date, record.link);
        }
    }
    println!("  Time:       {:.1}s", summary.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn state_changed(&self, state: RunState) {
        self.spinner.set_message(state.to_string());
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_override_config() {
        let cli = Cli::try_parse_from([
            "domharvest",
            "run",
            "--period",
            "2022-07",
            "--force",
            "--expires",
            "24",
            "--no-browser",
            "--concurrency",
            "2",
        ])
        .unwrap();

        let Command::Run {
            period,
            browser,
            pool,
            upload,
        } = cli.command
        else {
            panic!("expected run command");
        };

        let mut config = AppConfig::default();
        config.browser.webdriver_url = Some("http://localhost:9515".into());
        let mut run_config = RunConfig::from(&config);
        browser.apply(&mut run_config);
        pool.apply(&mut run_config);
        upload.apply(&mut run_config);

        assert_eq!(period.resolve(), Period::new(2022, 7).unwrap());
        assert!(!run_config.discovery.use_browser);
        assert!(run_config.publish.force);
        assert_eq!(run_config.publish.expires_hours, Some(24));
        assert_eq!(run_config.download.concurrency, 2);
        assert_eq!(run_config.publish.concurrency, 2);
    }

    #[test]
    fn invalid_period_is_rejected() {
        assert!(Cli::try_parse_from(["domharvest", "list", "--period", "2022-13"]).is_err());
        assert!(Cli::try_parse_from(["domharvest", "run", "--concurrency", "0"]).is_err());
    }

    #[test]
    fn period_defaults_to_previous_month() {
        let args = PeriodArgs { period: None };
        let today = chrono::Local::now().date_naive();
        assert_eq!(args.resolve(), Period::previous_month(today));
    }
}
