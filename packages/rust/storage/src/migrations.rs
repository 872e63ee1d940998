//! SQL migration definitions for the domharvest catalog.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: publicacoes",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Published gazettes; one row per public link
CREATE TABLE IF NOT EXISTS publicacoes (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    data TEXT NOT NULL,
    link TEXT NOT NULL UNIQUE
);

CREATE INDEX IF NOT EXISTS idx_publicacoes_data ON publicacoes(data);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
