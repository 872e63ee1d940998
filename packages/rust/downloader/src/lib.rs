//! Idempotent gazette downloads.
//!
//! This crate provides:
//! - [`Downloader`] — bounded worker pool that materializes links into a period directory
//! - [`DownloadReport`] — per-link outcome of a batch
//! - [`file_name_for`] — the local name a link is stored under

pub mod engine;

pub use engine::{DownloadOptions, DownloadReport, Downloader, file_name_for};
