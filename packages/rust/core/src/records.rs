//! Catalog records for published files.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

use domharvest_shared::{HarvestError, NewPublication, Result};

/// Gazette file names carry their edition date: `dom_20220701.pdf`.
static DATE_IN_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)dom_(\d{4})(\d{2})(\d{2})").expect("date pattern"));

/// Edition date embedded in a file name, if it is a real calendar date.
pub fn date_from_file_name(name: &str) -> Option<NaiveDate> {
    let caps = DATE_IN_NAME.captures(name)?;
    let year = caps[1].parse().ok()?;
    let month = caps[2].parse().ok()?;
    let day = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Publication date of a local file: from its name, else its mtime (UTC).
pub fn publication_date(path: &Path) -> Result<NaiveDate> {
    if let Some(date) = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(date_from_file_name)
    {
        return Ok(date);
    }

    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| HarvestError::io(path, e))?;
    Ok(DateTime::<Utc>::from(modified).date_naive())
}

/// Build catalog records for `(path, url)` pairs.
///
/// Files whose date cannot be determined come back as `(path, reason)`.
pub fn build_records<'a>(
    published: impl IntoIterator<Item = (&'a Path, &'a str)>,
) -> (Vec<NewPublication>, Vec<(PathBuf, String)>) {
    let mut records = Vec::new();
    let mut failures = Vec::new();
    for (path, url) in published {
        match publication_date(path) {
            Ok(date) => records.push(NewPublication {
                date,
                link: url.to_string(),
            }),
            Err(e) => failures.push((path.to_path_buf(), e.to_string())),
        }
    }
    (records, failures)
}
