//! libSQL-backed cache index.
//!
//! The [`Storage`] struct wraps a local libSQL database that records every
//! cache archive the cache manager has saved: its key, bucket, size and
//! when it was created and last restored. Eviction reads it to find expired
//! and least-recently-used entries.

mod migrations;

use std::path::{Path, PathBuf};

use bookship_shared::{BookshipError, Result};
use chrono::{DateTime, TimeZone, Utc};
use libsql::{Connection, Database, Row, params};

/// A single row of the cache index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryRecord {
    /// Rendered cache key (`{os}-{bucket}-{hash}`).
    pub key: String,
    pub bucket: String,
    /// Archive location on disk.
    pub archive_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BookshipError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| BookshipError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| BookshipError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
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
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        BookshipError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
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

    // -----------------------------------------------------------------------
    // Cache entry operations
    // -----------------------------------------------------------------------

    /// Record a saved archive. Re-recording a key replaces the row.
    pub async fn upsert_entry(&self, entry: &CacheEntryRecord) -> Result<()> {
        let path = entry.archive_path.to_string_lossy().to_string();
        self.conn
            .execute(
                "INSERT INTO cache_entries (key, bucket, archive_path, size_bytes, created_ms, last_used_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key) DO UPDATE SET
                   bucket = excluded.bucket,
                   archive_path = excluded.archive_path,
                   size_bytes = excluded.size_bytes,
                   created_ms = excluded.created_ms,
                   last_used_ms = excluded.last_used_ms",
                params![
                    entry.key.as_str(),
                    entry.bucket.as_str(),
                    path.as_str(),
                    entry.size_bytes as i64,
                    entry.created_at.timestamp_millis(),
                    entry.last_used_at.timestamp_millis()
                ],
            )
            .await
            .map_err(|e| BookshipError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Look up an entry by key.
    pub async fn get_entry(&self, key: &str) -> Result<Option<CacheEntryRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT key, bucket, archive_path, size_bytes, created_ms, last_used_ms
                 FROM cache_entries WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(|e| BookshipError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(BookshipError::Storage(e.to_string())),
        }
    }

    /// Mark an entry as just used.
    pub async fn touch_entry(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE cache_entries SET last_used_ms = ?1 WHERE key = ?2",
                params![at.timestamp_millis(), key],
            )
            .await
            .map_err(|e| BookshipError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Remove an entry from the index. The archive itself is not touched.
    pub async fn delete_entry(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
            .await
            .map_err(|e| BookshipError::Storage(e.to_string()))?;
        Ok(())
    }

    /// All entries, least recently used first.
    pub async fn list_entries(&self) -> Result<Vec<CacheEntryRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT key, bucket, archive_path, size_bytes, created_ms, last_used_ms
                 FROM cache_entries ORDER BY last_used_ms ASC, key ASC",
                params![],
            )
            .await
            .map_err(|e| BookshipError::Storage(e.to_string()))?;

        let mut entries = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => entries.push(row_to_entry(&row)?),
                Ok(None) => break,
                Err(e) => return Err(BookshipError::Storage(e.to_string())),
            }
        }
        Ok(entries)
    }
}

fn row_to_entry(row: &Row) -> Result<CacheEntryRecord> {
    let storage_err = |e: libsql::Error| BookshipError::Storage(e.to_string());

    let size: i64 = row.get(3).map_err(storage_err)?;
    let created_ms: i64 = row.get(4).map_err(storage_err)?;
    let used_ms: i64 = row.get(5).map_err(storage_err)?;
    let archive_path: String = row.get(2).map_err(storage_err)?;

    Ok(CacheEntryRecord {
        key: row.get(0).map_err(storage_err)?,
        bucket: row.get(1).map_err(storage_err)?,
        archive_path: PathBuf::from(archive_path),
        size_bytes: size.max(0) as u64,
        created_at: millis_to_datetime(created_ms)?,
        last_used_at: millis_to_datetime(used_ms)?,
    })
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| BookshipError::Storage(format!("invalid timestamp {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("bs_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn entry(key: &str, size: u64, used: DateTime<Utc>) -> CacheEntryRecord {
        CacheEntryRecord {
            key: key.into(),
            bucket: "registry".into(),
            archive_path: PathBuf::from(format!("/tmp/{key}.tar.gz")),
            size_bytes: size,
            created_at: used,
            last_used_at: used,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("bs_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn entry_roundtrip() {
        let storage = test_storage().await;
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let record = entry("Linux-registry-abc", 2048, now);

        storage.upsert_entry(&record).await.expect("upsert");
        let found = storage.get_entry("Linux-registry-abc").await.unwrap();
        assert_eq!(found, Some(record));

        assert!(storage.get_entry("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_orders_by_last_use() {
        let storage = test_storage().await;
        let base = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();

        storage.upsert_entry(&entry("a", 10, base)).await.unwrap();
        storage
            .upsert_entry(&entry("b", 20, base - Duration::hours(2)))
            .await
            .unwrap();
        storage
            .upsert_entry(&entry("c", 30, base - Duration::hours(1)))
            .await
            .unwrap();

        let keys: Vec<_> = storage
            .list_entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["b", "c", "a"]);
        let sizes: u64 = storage
            .list_entries()
            .await
            .unwrap()
            .iter()
            .map(|e| e.size_bytes)
            .sum();
        assert_eq!(sizes, 60);

        // Touching "b" makes it the most recent
        storage
            .touch_entry("b", base + Duration::hours(1))
            .await
            .unwrap();
        let last = storage.list_entries().await.unwrap().pop().unwrap();
        assert_eq!(last.key, "b");
    }

    #[tokio::test]
    async fn delete_entry_removes_row() {
        let storage = test_storage().await;
        storage
            .upsert_entry(&entry("gone", 5, Utc::now()))
            .await
            .unwrap();
        storage.delete_entry("gone").await.unwrap();
        assert!(storage.get_entry("gone").await.unwrap().is_none());
        assert!(storage.list_entries().await.unwrap().is_empty());
    }
}
