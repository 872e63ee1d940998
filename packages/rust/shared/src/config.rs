//! Application configuration for domharvest.
//!
//! User config lives at `~/.domharvest/domharvest.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{HarvestError, Result};
use crate::retry::RetryPolicy;
use crate::types::Period;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "domharvest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".domharvest";

/// Largest file the anonymous host accepts (512 MiB).
pub const MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Config structs (matching domharvest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Gazette portal and its data API.
    #[serde(default)]
    pub portal: PortalConfig,

    /// Local data layout.
    #[serde(default)]
    pub paths: PathsConfig,

    /// HTTP timeouts, concurrency and retry budget.
    #[serde(default)]
    pub http: HttpConfig,

    /// Anonymous upload host.
    #[serde(default)]
    pub upload: UploadConfig,

    /// WebDriver endpoint for the browser session.
    #[serde(default)]
    pub browser: BrowserConfig,
}

/// `[portal]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Site origin, e.g. `https://www.natal.rn.gov.br`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path of the human-facing gazette page.
    #[serde(default = "default_portal_path")]
    pub portal_path: String,

    /// Path prefix of the data-table API (`{api_path}/{MM}/{YYYY}`).
    #[serde(default = "default_api_path")]
    pub api_path: String,

    /// Keep API hrefs without ".pdf" so the browser can resolve them.
    #[serde(default)]
    pub accept_indirect_links: bool,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            portal_path: default_portal_path(),
            api_path: default_api_path(),
            accept_indirect_links: false,
        }
    }
}

impl PortalConfig {
    /// Parsed site origin.
    pub fn base(&self) -> Result<Url> {
        Url::parse(&self.base_url)
            .map_err(|e| HarvestError::config(format!("invalid portal base_url '{}': {e}", self.base_url)))
    }

    /// URL of the gazette page loaded for the availability check.
    pub fn portal_url(&self) -> Result<Url> {
        self.base()?
            .join(&self.portal_path)
            .map_err(|e| HarvestError::config(format!("invalid portal_path: {e}")))
    }

    /// Discovery API URL for a period: `{api_path}/{MM}/{YYYY}`.
    pub fn api_url(&self, period: Period) -> Result<Url> {
        let path = format!(
            "{}/{:02}/{:04}",
            self.api_path.trim_end_matches('/'),
            period.month(),
            period.year()
        );
        self.base()?
            .join(&path)
            .map_err(|e| HarvestError::config(format!("invalid api_path: {e}")))
    }
}

fn default_base_url() -> String {
    "https://www.natal.rn.gov.br".into()
}
fn default_portal_path() -> String {
    "/dom".into()
}
fn default_api_path() -> String {
    "/api/dom/data".into()
}

/// `[paths]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root holding one `YYYY-MM` directory per period.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// libSQL database file for the catalog.
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: default_database(),
        }
    }
}

impl PathsConfig {
    /// Directory holding the artifacts and ledger of a period.
    pub fn period_dir(&self, period: Period) -> PathBuf {
        self.data_dir.join(period.dir_name())
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_database() -> PathBuf {
    PathBuf::from("data/domharvest.db")
}

/// `[http]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Timeout for discovery API calls.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Timeout for a single PDF download.
    #[serde(default = "default_transfer_timeout")]
    pub download_timeout_secs: u64,

    /// Timeout for a single upload.
    #[serde(default = "default_transfer_timeout")]
    pub upload_timeout_secs: u64,

    /// Worker pool size for downloads and uploads.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Total attempts per request, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff between attempts.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            download_timeout_secs: default_transfer_timeout(),
            upload_timeout_secs: default_transfer_timeout(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl HttpConfig {
    /// Retry policy retrying connection failures and the given statuses.
    pub fn retry_policy(&self, retry_statuses: &[u16]) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            retry_statuses: retry_statuses.to_vec(),
        }
    }
}

fn default_timeout() -> u64 {
    60
}
fn default_transfer_timeout() -> u64 {
    120
}
fn default_concurrency() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    10_000
}

/// `[upload]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Anonymous host endpoint (multipart `POST /`).
    #[serde(default = "default_host_url")]
    pub host_url: String,

    /// Ask the host for a hard-to-guess URL.
    #[serde(default)]
    pub secret: bool,

    /// Maximum retention window in hours.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_hours: Option<u32>,

    /// Files above this size are rejected before any network call.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            host_url: default_host_url(),
            secret: false,
            expires_hours: None,
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_host_url() -> String {
    "https://0x0.st".into()
}
fn default_max_bytes() -> u64 {
    MAX_UPLOAD_BYTES
}

/// `[browser]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// WebDriver endpoint (e.g. `http://localhost:9515` for chromedriver).
    /// No endpoint means no browser session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webdriver_url: Option<String>,

    /// Run Chrome headless.
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Bound on waiting for an opened link to finish loading.
    #[serde(default = "default_page_timeout")]
    pub page_timeout_secs: u64,

    /// Bound on waiting for the portal page during the availability check.
    #[serde(default = "default_portal_timeout")]
    pub portal_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: None,
            headless: true,
            page_timeout_secs: default_page_timeout(),
            portal_timeout_secs: default_portal_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_page_timeout() -> u64 {
    15
}
fn default_portal_timeout() -> u64 {
    20
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.domharvest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| HarvestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.domharvest/domharvest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| HarvestError::config(format!("failed to parse {}: {e}", path.display())))?;

    if config.http.concurrency == 0 {
        return Err(HarvestError::config("http.concurrency must be greater than 0"));
    }
    config.portal.base()?;

    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| HarvestError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| HarvestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| HarvestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("base_url"));
        assert!(toml_str.contains("https://0x0.st"));
        assert!(!toml_str.contains("webdriver_url"));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let toml_str = r#"
[upload]
secret = true
expires_hours = 24

[browser]
webdriver_url = "http://localhost:9515"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert!(config.upload.secret);
        assert_eq!(config.upload.expires_hours, Some(24));
        assert_eq!(config.upload.max_bytes, MAX_UPLOAD_BYTES);
        assert_eq!(config.browser.webdriver_url.as_deref(), Some("http://localhost:9515"));
        assert_eq!(config.http.max_attempts, 5);
        assert_eq!(config.paths.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn api_url_pads_month() {
        let portal = PortalConfig::default();
        let url = portal.api_url(Period::new(2022, 7).unwrap()).unwrap();
        assert_eq!(url.as_str(), "https://www.natal.rn.gov.br/api/dom/data/07/2022");
        assert_eq!(
            portal.portal_url().unwrap().as_str(),
            "https://www.natal.rn.gov.br/dom"
        );
    }

    #[test]
    fn period_dir_uses_data_root() {
        let paths = PathsConfig::default();
        let dir = paths.period_dir(Period::new(2022, 7).unwrap());
        assert_eq!(dir, PathBuf::from("data/2022-07"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let dir = std::env::temp_dir().join(format!("dh_cfg_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[http]\nconcurrency = 0\n").unwrap();

        let err = load_config_from(&path).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }
}
