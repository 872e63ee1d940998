//! Shared types, error model, configuration and HTTP plumbing for domharvest.
//!
//! This crate is the foundation depended on by all other domharvest crates.
//! It provides:
//! - [`HarvestError`] — the unified error type
//! - Domain types ([`Period`], [`PublicationLink`], [`LedgerEntry`], [`PublicationRecord`])
//! - Configuration ([`AppConfig`] and its sections, config loading)
//! - [`RetryPolicy`] and the HTTP client builders used by every stage

pub mod config;
pub mod error;
pub mod http;
pub mod retry;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BrowserConfig, HttpConfig, MAX_UPLOAD_BYTES, PathsConfig, PortalConfig,
    UploadConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{HarvestError, Result};
pub use retry::{RetryPolicy, SERVER_ERROR_STATUSES, UPLOAD_RETRY_STATUSES};
pub use types::{
    LedgerEntry, NewPublication, Period, PublicationLink, PublicationRecord, RunId, mentions_pdf,
};
