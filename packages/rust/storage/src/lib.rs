//! libSQL catalog of published gazettes (offline mode).
//!
//! The [`Catalog`] owns the `publicacoes` table: one row per public link,
//! with the publication date. The `link` column is unique in the schema, so
//! saving a link twice keeps the first row untouched.
//!
//! **Access rules:**
//! - pipeline runs and `purge`: read-write via [`Catalog::open`]
//! - `list`: read-only via [`Catalog::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::NaiveDate;
use domharvest_shared::{HarvestError, NewPublication, Period, PublicationRecord, Result};
use libsql::{Connection, Database, params};

/// Storage format of the `data` column.
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Result of [`Catalog::delete_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Rows deleted.
    pub removed: usize,
    /// Links of the deleted rows.
    pub links: Vec<String>,
}

/// Primary catalog handle wrapping a libSQL database.
pub struct Catalog {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Catalog {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let catalog = Self {
            db,
            conn,
            readonly: false,
        };
        catalog.run_migrations().await?;
        Ok(catalog)
    }

    /// Open an existing database at `path` without write access.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(HarvestError::Storage(format!(
                "catalog {} does not exist",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    HarvestError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(HarvestError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Publication operations
    // -----------------------------------------------------------------------

    /// Insert each record unless its link is already stored.
    ///
    /// Returns the number of records submitted. All inserts share one
    /// transaction: on error nothing from this call is stored.
    pub async fn save(&self, records: &[NewPublication]) -> Result<usize> {
        self.check_writable()?;
        if records.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let mut inserted = 0u64;
        for record in records {
            let date = record.date.format(DATE_FORMAT).to_string();
            inserted += tx
                .execute(
                    "INSERT INTO publicacoes (data, link) VALUES (?1, ?2)
                     ON CONFLICT(link) DO NOTHING",
                    params![date, record.link.as_str()],
                )
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        tracing::debug!(submitted = records.len(), inserted, "publications saved");
        Ok(records.len())
    }

    /// Every record, most recently inserted first.
    pub async fn list_all(&self) -> Result<Vec<PublicationRecord>> {
        let rows = self
            .conn
            .query(
                "SELECT id, data, link FROM publicacoes ORDER BY id DESC",
                params![],
            )
            .await
            .map_err(storage_err)?;
        collect_records(rows).await
    }

    /// Records dated within `period`, by date then id.
    pub async fn list_by_period(&self, period: Period) -> Result<Vec<PublicationRecord>> {
        let from = period.first_day().format(DATE_FORMAT).to_string();
        let until = period.next_first_day().format(DATE_FORMAT).to_string();
        let rows = self
            .conn
            .query(
                "SELECT id, data, link FROM publicacoes
                 WHERE data >= ?1 AND data < ?2
                 ORDER BY data, id",
                params![from, until],
            )
            .await
            .map_err(storage_err)?;
        collect_records(rows).await
    }

    /// Remove every record and report what was removed.
    pub async fn delete_all(&self) -> Result<PurgeReport> {
        self.check_writable()?;
        let mut rows = self
            .conn
            .query("DELETE FROM publicacoes RETURNING link", params![])
            .await
            .map_err(storage_err)?;

        let mut links = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            links.push(row.get::<String>(0).map_err(storage_err)?);
        }

        tracing::info!(removed = links.len(), "catalog purged");
        Ok(PurgeReport {
            removed: links.len(),
            links,
        })
    }
}

async fn collect_records(mut rows: libsql::Rows) -> Result<Vec<PublicationRecord>> {
    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(storage_err)? {
        results.push(row_to_record(&row)?);
    }
    Ok(results)
}

/// Convert a database row to a [`PublicationRecord`].
fn row_to_record(row: &libsql::Row) -> Result<PublicationRecord> {
    let data: String = row.get(1).map_err(storage_err)?;
    Ok(PublicationRecord {
        id: row.get::<i64>(0).map_err(storage_err)?,
        date: NaiveDate::parse_from_str(&data, DATE_FORMAT)
            .map_err(|e| HarvestError::Storage(format!("invalid date '{data}': {e}")))?,
        link: row.get::<String>(2).map_err(storage_err)?,
    })
}

fn storage_err(e: libsql::Error) -> HarvestError {
    HarvestError::Storage(e.to_string())
}
