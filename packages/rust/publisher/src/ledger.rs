//! Per-period upload ledger.
//!
//! The ledger is an append-only CSV log (`uploads_0x0.csv`) with columns
//! `arquivo,url,x_token,bytes,data_hora`. It doubles as the idempotency index:
//! a file is published if any row names its absolute path.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use domharvest_shared::{HarvestError, LedgerEntry, Result};

/// Ledger file name inside each period directory.
pub const LEDGER_FILE_NAME: &str = "uploads_0x0.csv";

/// Lookup-and-append view of an upload log.
pub trait Ledger {
    /// Most recent public URL recorded for `path`.
    fn lookup(&self, path: &Path) -> Option<&str>;

    /// Record a successful upload.
    fn append(&mut self, entry: &LedgerEntry) -> Result<()>;
}

/// One CSV row, in column order.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerRow {
    arquivo: String,
    url: String,
    x_token: String,
    bytes: u64,
    data_hora: String,
}

impl From<&LedgerEntry> for LedgerRow {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            arquivo: entry.path.display().to_string(),
            url: entry.url.clone(),
            x_token: entry.token.clone().unwrap_or_default(),
            bytes: entry.bytes,
            data_hora: entry.uploaded_at.to_rfc3339_opts(SecondsFormat::Secs, false),
        }
    }
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = HarvestError;

    fn try_from(row: LedgerRow) -> Result<Self> {
        let uploaded_at = DateTime::parse_from_rfc3339(&row.data_hora).map_err(|e| {
            HarvestError::parse(format!("bad data_hora '{}' in ledger: {e}", row.data_hora))
        })?;
        Ok(Self {
            path: PathBuf::from(row.arquivo),
            url: row.url,
            token: Some(row.x_token).filter(|t| !t.is_empty()),
            bytes: row.bytes,
            uploaded_at,
        })
    }
}

// ---------------------------------------------------------------------------
// CsvLedger
// ---------------------------------------------------------------------------

/// [`Ledger`] backed by a CSV file, with the path → URL index held in memory.
#[derive(Debug)]
pub struct CsvLedger {
    path: PathBuf,
    urls: HashMap<PathBuf, String>,
    rows: usize,
}

impl CsvLedger {
    /// Load the ledger at `path`; a missing file is an empty ledger.
    ///
    /// Only `arquivo` and `url` are needed for lookups. Rows without them (a
    /// line cut short by an interrupted write, say) are skipped with a warning
    /// so one bad line does not lock the whole period.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut urls = HashMap::new();
        let mut rows = 0;

        if path.exists() {
            let mut reader = csv::ReaderBuilder::new()
                .flexible(true)
                .from_path(&path)
                .map_err(|e| csv_error(&path, e))?;
            let headers = reader.headers().map_err(|e| csv_error(&path, e))?.clone();
            let column = |name: &str, fallback: usize| {
                headers.iter().position(|h| h.trim() == name).unwrap_or(fallback)
            };
            let (file_col, url_col) = (column("arquivo", 0), column("url", 1));

            for (index, record) in reader.records().enumerate() {
                let record = match record {
                    Ok(record) => record,
                    Err(e) if e.is_io_error() => return Err(csv_error(&path, e)),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping undecodable ledger row");
                        continue;
                    }
                };
                let file = record.get(file_col).map(str::trim).unwrap_or_default();
                let url = record.get(url_col).map(str::trim).unwrap_or_default();
                if file.is_empty() || url.is_empty() {
                    warn!(path = %path.display(), row = index + 1, "skipping incomplete ledger row");
                    continue;
                }
                // Later rows win: a forced re-upload supersedes the earlier URL.
                urls.insert(PathBuf::from(file), url.to_string());
                rows += 1;
            }
        }

        debug!(path = %path.display(), rows, files = urls.len(), "ledger loaded");
        Ok(Self { path, urls, rows })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Usable rows in the file, history included.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

impl Ledger for CsvLedger {
    fn lookup(&self, path: &Path) -> Option<&str> {
        self.urls.get(path).map(String::as_str)
    }

    fn append(&mut self, entry: &LedgerEntry) -> Result<()> {
        let is_new = std::fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| HarvestError::io(&self.path, e))?;
        if !is_new && !ends_with_newline(&mut file).map_err(|e| HarvestError::io(&self.path, e))? {
            // Close off a row left unterminated by an interrupted write.
            file.write_all(b"\n").map_err(|e| HarvestError::io(&self.path, e))?;
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        writer
            .serialize(LedgerRow::from(entry))
            .map_err(|e| csv_error(&self.path, e))?;
        writer.flush().map_err(|e| HarvestError::io(&self.path, e))?;

        self.urls.insert(entry.path.clone(), entry.url.clone());
        self.rows += 1;
        Ok(())
    }
}

/// Read every row of the ledger at `path`, oldest first.
pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path).map_err(|e| csv_error(path, e))?;
    reader
        .deserialize::<LedgerRow>()
        .map(|row| row.map_err(|e| csv_error(path, e)).and_then(LedgerEntry::try_from))
        .collect()
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn csv_error(path: &Path, err: csv::Error) -> HarvestError {
    HarvestError::parse(format!("ledger {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use tempfile::TempDir;

    fn entry(path: &str, url: &str, token: Option<&str>) -> LedgerEntry {
        let offset = FixedOffset::west_opt(3 * 3600).unwrap();
        LedgerEntry {
            path: PathBuf::from(path),
            url: url.into(),
            token: token.map(String::from),
            bytes: 1234,
            uploaded_at: DateTime::parse_from_rfc3339("2022-08-01T10:15:00-03:00")
                .unwrap()
                .with_timezone(&offset),
        }
    }

    #[test]
    fn header_is_written_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);

        let mut ledger = CsvLedger::open(&path).unwrap();
        ledger.append(&entry("/d/a.pdf", "https://0x0.st/a.pdf", Some("tok"))).unwrap();
        ledger.append(&entry("/d/b.pdf", "https://0x0.st/b.pdf", None)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "arquivo,url,x_token,bytes,data_hora");
        assert_eq!(
            lines[1],
            "/d/a.pdf,https://0x0.st/a.pdf,tok,1234,2022-08-01T10:15:00-03:00"
        );
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn reopened_ledger_finds_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        CsvLedger::open(&path)
            .unwrap()
            .append(&entry("/d/a.pdf", "https://0x0.st/a.pdf", None))
            .unwrap();

        let ledger = CsvLedger::open(&path).unwrap();
        assert_eq!(ledger.lookup(Path::new("/d/a.pdf")), Some("https://0x0.st/a.pdf"));
        assert_eq!(ledger.lookup(Path::new("/d/b.pdf")), None);
        assert_eq!(ledger.rows(), 1);
    }

    #[test]
    fn latest_row_wins_and_history_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        let mut ledger = CsvLedger::open(&path).unwrap();
        ledger.append(&entry("/d/a.pdf", "https://0x0.st/old.pdf", None)).unwrap();
        ledger.append(&entry("/d/a.pdf", "https://0x0.st/new.pdf", Some("t2"))).unwrap();

        let ledger = CsvLedger::open(&path).unwrap();
        assert_eq!(ledger.lookup(Path::new("/d/a.pdf")), Some("https://0x0.st/new.pdf"));

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].token, None);
        assert_eq!(entries[1].token.as_deref(), Some("t2"));
        assert_eq!(entries[1].uploaded_at.offset().local_minus_utc(), -3 * 3600);
    }

    #[test]
    fn truncated_row_does_not_hide_the_rest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        std::fs::write(
            &path,
            "arquivo,url,x_token,bytes,data_hora\n\
             /d/a.pdf,https://0x0.st/a.pdf,tok,1234,2022-08-01T10:15:00-03:00\n\
             /d/b.pdf,https://0x0",
        )
        .unwrap();

        let mut ledger = CsvLedger::open(&path).unwrap();
        assert_eq!(ledger.lookup(Path::new("/d/a.pdf")), Some("https://0x0.st/a.pdf"));
        assert_eq!(ledger.lookup(Path::new("/d/b.pdf")), Some("https://0x0"));
        assert_eq!(ledger.rows(), 2);

        ledger.append(&entry("/d/c.pdf", "https://0x0.st/c.pdf", None)).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("\n/d/c.pdf,https://0x0.st/c.pdf,,1234,2022-08-01T10:15:00-03:00\n"));

        let reopened = CsvLedger::open(&path).unwrap();
        assert_eq!(reopened.lookup(Path::new("/d/c.pdf")), Some("https://0x0.st/c.pdf"));
        assert_eq!(reopened.rows(), 3);
    }

    #[test]
    fn rows_without_a_url_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        std::fs::write(
            &path,
            "arquivo,url,x_token,bytes,data_hora\n/d/a.pdf\n/d/b.pdf,https://0x0.st/b.pdf,,oops,x\n",
        )
        .unwrap();

        let ledger = CsvLedger::open(&path).unwrap();
        assert_eq!(ledger.lookup(Path::new("/d/a.pdf")), None);
        assert_eq!(ledger.lookup(Path::new("/d/b.pdf")), Some("https://0x0.st/b.pdf"));
        assert_eq!(ledger.rows(), 1);
    }

    #[test]
    fn strict_reading_rejects_bad_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        std::fs::write(&path, "arquivo,url,x_token,bytes,data_hora\n/d/a.pdf,u,,not-a-number,x\n")
            .unwrap();
        assert!(read_entries(&path).is_err());
        assert_eq!(CsvLedger::open(&path).unwrap().rows(), 1);
    }
}
