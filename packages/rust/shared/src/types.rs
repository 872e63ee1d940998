//! Core domain types for a gazette collection run.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HarvestError, Result};

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one pipeline run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Period
// ---------------------------------------------------------------------------

/// A (year, month) bucket identifying one collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    /// Build a period, rejecting months outside `1..=12`.
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(HarvestError::validation(format!(
                "month must be between 1 and 12, got {month}"
            )));
        }
        if !(1..=9999).contains(&year) {
            return Err(HarvestError::validation(format!(
                "year must have four digits, got {year}"
            )));
        }
        Ok(Self { year, month })
    }

    /// The month before the one containing `today`.
    pub fn previous_month(today: NaiveDate) -> Self {
        let (year, month) = match today.month() {
            1 => (today.year() - 1, 12),
            m => (today.year(), m - 1),
        };
        Self { year, month }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Directory name for this period: `YYYY-MM`.
    pub fn dir_name(&self) -> String {
        self.to_string()
    }

    /// First calendar day of the period.
    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// First calendar day of the following period (exclusive upper bound).
    pub fn next_first_day(&self) -> NaiveDate {
        let (year, month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MAX)
    }

    /// Whether `date` falls within this calendar month.
    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        let (year, month) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| HarvestError::validation(format!("expected YYYY-MM, got '{s}'")))?;
        let year: i32 = year
            .parse()
            .map_err(|_| HarvestError::validation(format!("invalid year in '{s}'")))?;
        let month: u32 = month
            .parse()
            .map_err(|_| HarvestError::validation(format!("invalid month in '{s}'")))?;
        Self::new(year, month)
    }
}

// ---------------------------------------------------------------------------
// PublicationLink
// ---------------------------------------------------------------------------

/// A remote URL believed to reference a gazette PDF.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicationLink(pub String);

impl PublicationLink {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the URL mentions a `.pdf` resource (case-insensitive).
    pub fn looks_like_pdf(&self) -> bool {
        mentions_pdf(&self.0)
    }
}

impl fmt::Display for PublicationLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PublicationLink {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PublicationLink {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Case-insensitive `.pdf` substring test shared by discovery and resolution.
pub fn mentions_pdf(s: &str) -> bool {
    s.to_ascii_lowercase().contains(".pdf")
}

// ---------------------------------------------------------------------------
// LedgerEntry
// ---------------------------------------------------------------------------

/// One successful upload recorded in a period ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    /// Absolute path of the uploaded local file.
    pub path: PathBuf,
    /// Public URL returned by the host.
    pub url: String,
    /// Deletion token from the `X-Token` header, if the host sent one.
    pub token: Option<String>,
    /// File size in bytes at upload time.
    pub bytes: u64,
    /// Local upload time with offset.
    pub uploaded_at: DateTime<FixedOffset>,
}

// ---------------------------------------------------------------------------
// Publication records
// ---------------------------------------------------------------------------

/// A (date, link) pair submitted to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPublication {
    pub date: NaiveDate,
    pub link: String,
}

/// A publication persisted in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationRecord {
    /// Auto-incremented identifier.
    pub id: i64,
    /// Publication date.
    pub date: NaiveDate,
    /// Public URL (unique across the catalog).
    pub link: String,
}
