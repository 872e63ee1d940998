//! Run orchestration for domharvest.
//!
//! This crate ties together discovery, download, publishing and the catalog
//! into one collection run per period (see [`pipeline::run`]).

pub mod pipeline;
pub mod records;

pub use pipeline::{
    ItemFailure, ProgressReporter, RunConfig, RunOutcome, RunState, RunSummary, SilentProgress,
    run,
};
pub use records::{build_records, date_from_file_name, publication_date};
