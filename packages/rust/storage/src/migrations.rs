//! SQL migration definitions for the cache index database.
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
        description: "Initial schema: cache_entries",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per saved cache archive
CREATE TABLE IF NOT EXISTS cache_entries (
    key           TEXT PRIMARY KEY,
    bucket        TEXT NOT NULL,
    archive_path  TEXT NOT NULL,
    size_bytes    INTEGER NOT NULL,
    created_ms    INTEGER NOT NULL,
    last_used_ms  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_last_used ON cache_entries(last_used_ms);
CREATE INDEX IF NOT EXISTS idx_cache_entries_bucket ON cache_entries(bucket);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
