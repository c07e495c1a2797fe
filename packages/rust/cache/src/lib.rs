//! Dependency and build caches keyed by the lock file.
//!
//! Each bucket (registry, index, build target) is archived under a key of
//! the form `{os}-{bucket}-{lockfile-hash}`. Keys are immutable: once saved,
//! later saves for the same key are no-ops. A libSQL index tracks archive
//! sizes and last use so old and oversized caches get evicted.

mod archive;
mod lock;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use bookship_shared::{
    BookshipError, CacheConfig, CacheKey, Result, default_cache_root, expand_path,
};
use bookship_storage::{CacheEntryRecord, Storage};

use crate::lock::CacheLock;

const ARCHIVE_DIR: &str = "archives";
const INDEX_DB: &str = "index.db";

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Outcome of a save request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// A new archive was written.
    Saved { size_bytes: u64 },
    /// The key already exists; nothing was written.
    AlreadyExists,
    /// The bucket path does not exist; nothing to save.
    SourceMissing,
}

/// Cache storage seen by the pipeline.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Materialize the archive for `key` at `path`. Returns `false` on a miss.
    async fn restore(&self, key: &CacheKey, path: &Path) -> Result<bool>;

    /// Persist the contents of `path` under `key`.
    async fn save(&self, key: &CacheKey, path: &Path) -> Result<SaveOutcome>;
}

// ---------------------------------------------------------------------------
// Buckets and keys
// ---------------------------------------------------------------------------

/// A named directory that is cached as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheBucket {
    pub name: String,
    pub path: PathBuf,
}

/// Resolve the configured buckets against the workspace.
pub fn resolve_buckets(config: &CacheConfig, workspace: &Path) -> Vec<CacheBucket> {
    config
        .buckets
        .iter()
        .map(|b| CacheBucket {
            name: b.name.clone(),
            path: expand_path(&b.path, workspace),
        })
        .collect()
}

/// Derive one key per bucket from the lock file.
///
/// Returns `None` when the lock file does not exist; without it there is
/// nothing stable to key on and the run proceeds uncached.
pub fn derive_keys(
    os: &str,
    lockfile: &Path,
    buckets: &[CacheBucket],
) -> Result<Option<Vec<(CacheBucket, CacheKey)>>> {
    let contents = match std::fs::read(lockfile) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(lockfile = %lockfile.display(), "lock file not found, caching disabled");
            return Ok(None);
        }
        Err(e) => return Err(BookshipError::io(lockfile, e)),
    };

    Ok(Some(
        buckets
            .iter()
            .map(|b| (b.clone(), CacheKey::derive(os, &b.name, &contents)))
            .collect(),
    ))
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

/// Limits enforced after every save.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// Entries not used for this long are removed.
    pub max_age: Duration,
    /// Least recently used entries are removed until the total fits.
    pub max_total_bytes: u64,
}

impl From<&CacheConfig> for EvictionPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_age: Duration::days(i64::from(config.max_age_days)),
            max_total_bytes: config.max_total_mb.saturating_mul(1024 * 1024),
        }
    }
}

/// What a prune pass removed.
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub freed_bytes: u64,
}

// ---------------------------------------------------------------------------
// LocalCache
// ---------------------------------------------------------------------------

/// Filesystem cache rooted at a directory, indexed by libSQL.
pub struct LocalCache {
    root: PathBuf,
    storage: Storage,
    policy: EvictionPolicy,
}

impl LocalCache {
    /// Open (or create) a cache at `root`.
    pub async fn open(root: &Path, policy: EvictionPolicy) -> Result<Self> {
        let archives = root.join(ARCHIVE_DIR);
        std::fs::create_dir_all(&archives).map_err(|e| BookshipError::io(&archives, e))?;

        let storage = Storage::open(&root.join(INDEX_DB)).await?;
        Ok(Self {
            root: root.to_path_buf(),
            storage,
            policy,
        })
    }

    /// Open the cache described by `config`, defaulting to the platform cache dir.
    pub async fn from_config(config: &CacheConfig, workspace: &Path) -> Result<Self> {
        let root = match &config.root {
            Some(raw) => expand_path(raw, workspace),
            None => default_cache_root()?,
        };
        Self::open(&root, EvictionPolicy::from(config)).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn archive_path(&self, key: &str) -> PathBuf {
        self.root.join(ARCHIVE_DIR).join(format!("{key}.tar.gz"))
    }

    /// All index entries, least recently used first.
    pub async fn entries(&self) -> Result<Vec<CacheEntryRecord>> {
        let _lock = CacheLock::shared(&self.root).await?;
        self.storage.list_entries().await
    }

    /// Apply the eviction policy.
    pub async fn prune(&self) -> Result<PruneReport> {
        let _lock = CacheLock::exclusive(&self.root).await?;
        self.prune_locked().await
    }

    async fn prune_locked(&self) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        let cutoff = Utc::now() - self.policy.max_age;

        let mut live = Vec::new();
        for entry in self.storage.list_entries().await? {
            if entry.last_used_at < cutoff {
                debug!(key = %entry.key, "evicting expired cache entry");
                self.remove_entry(&entry, &mut report).await?;
            } else {
                live.push(entry);
            }
        }

        // `live` is already least-recently-used first
        let mut total: u64 = live.iter().map(|e| e.size_bytes).sum();
        for entry in &live {
            if total <= self.policy.max_total_bytes {
                break;
            }
            debug!(key = %entry.key, size = entry.size_bytes, "evicting cache entry over budget");
            total = total.saturating_sub(entry.size_bytes);
            self.remove_entry(entry, &mut report).await?;
        }

        if !report.removed.is_empty() {
            info!(
                removed = report.removed.len(),
                freed_bytes = report.freed_bytes,
                "cache pruned"
            );
        }
        Ok(report)
    }

    async fn remove_entry(&self, entry: &CacheEntryRecord, report: &mut PruneReport) -> Result<()> {
        match std::fs::remove_file(&entry.archive_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BookshipError::io(&entry.archive_path, e)),
        }
        self.storage.delete_entry(&entry.key).await?;
        report.removed.push(entry.key.clone());
        report.freed_bytes += entry.size_bytes;
        Ok(())
    }

    /// Forget an entry whose archive cannot be used, so the next save rewrites it.
    async fn drop_entry(&self, entry: &CacheEntryRecord) -> Result<()> {
        match std::fs::remove_file(&entry.archive_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(archive = %entry.archive_path.display(), error = %e, "failed to remove broken archive"),
        }
        self.storage.delete_entry(&entry.key).await
    }
}

// ---------------------------------------------------------------------------
// Temp archive
// ---------------------------------------------------------------------------

/// Archive being written under a temp name.
///
/// Dropped before `persist` (error or cancellation), the temp file is
/// removed. A pack still running on its blocking thread sees `abandoned`
/// when it finishes and removes the file itself.
struct PendingArchive {
    path: PathBuf,
    abandoned: Arc<AtomicBool>,
    persisted: bool,
}

impl PendingArchive {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            abandoned: Arc::new(AtomicBool::new(false)),
            persisted: false,
        }
    }

    async fn pack(&self, src: &Path) -> Result<u64> {
        let src = src.to_path_buf();
        let dst = self.path.clone();
        let abandoned = Arc::clone(&self.abandoned);
        tokio::task::spawn_blocking(move || {
            let size = archive::pack_dir(&src, &dst);
            if abandoned.load(Ordering::SeqCst) {
                let _ = std::fs::remove_file(&dst);
            }
            size
        })
        .await
        .map_err(|e| BookshipError::Cache(format!("archive task failed: {e}")))?
    }

    fn persist(mut self, target: &Path) -> Result<()> {
        std::fs::rename(&self.path, target).map_err(|e| BookshipError::io(target, e))?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for PendingArchive {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        self.abandoned.store(true, Ordering::SeqCst);
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "failed to remove temp archive");
            }
        }
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    #[instrument(skip_all, fields(key = %key, path = %path.display()))]
    async fn restore(&self, key: &CacheKey, path: &Path) -> Result<bool> {
        let _lock = CacheLock::shared(&self.root).await?;
        let key_str = key.to_string();

        let Some(entry) = self.storage.get_entry(&key_str).await? else {
            info!("cache miss");
            return Ok(false);
        };

        if !entry.archive_path.exists() {
            warn!(archive = %entry.archive_path.display(), "cache archive missing, treating as miss");
            self.storage.delete_entry(&key_str).await?;
            return Ok(false);
        }

        // A cancelled restore still finishes on its blocking thread; `path`
        // only ever receives a fully read archive.
        let src = entry.archive_path.clone();
        let dest = path.to_path_buf();
        let restored = tokio::task::spawn_blocking(move || archive::restore_into(&src, &dest))
            .await
            .map_err(|e| BookshipError::Cache(format!("restore task failed: {e}")))?;

        match restored {
            Ok(()) => {}
            // Extraction failures mean the archive itself is bad
            Err(e @ BookshipError::Cache(_)) => {
                warn!(error = %e, "cache archive unreadable, dropping entry");
                self.drop_entry(&entry).await?;
                return Ok(false);
            }
            Err(e) => {
                warn!(error = %e, "could not restore into bucket path, treating as miss");
                return Ok(false);
            }
        }

        self.storage.touch_entry(&key_str, Utc::now()).await?;
        info!(size = entry.size_bytes, "cache restored");
        Ok(true)
    }

    #[instrument(skip_all, fields(key = %key, path = %path.display()))]
    async fn save(&self, key: &CacheKey, path: &Path) -> Result<SaveOutcome> {
        if !path.exists() {
            warn!("cache path does not exist, skipping save");
            return Ok(SaveOutcome::SourceMissing);
        }

        let _lock = CacheLock::exclusive(&self.root).await?;
        let key_str = key.to_string();
        let target = self.archive_path(&key_str);

        if let Some(existing) = self.storage.get_entry(&key_str).await? {
            if existing.archive_path.exists() {
                debug!("cache key already saved");
                return Ok(SaveOutcome::AlreadyExists);
            }
        }

        // Write to temp file first, then rename into place
        let temp = PendingArchive::new(
            self.root
                .join(ARCHIVE_DIR)
                .join(format!(".{key_str}.{}.tmp", Uuid::now_v7().simple())),
        );
        let size = temp.pack(path).await?;
        temp.persist(&target)?;

        let now = Utc::now();
        self.storage
            .upsert_entry(&CacheEntryRecord {
                key: key_str,
                bucket: key.bucket.clone(),
                archive_path: target,
                size_bytes: size,
                created_at: now,
                last_used_at: now,
            })
            .await?;

        info!(size, "cache saved");
        self.prune_locked().await?;

        Ok(SaveOutcome::Saved { size_bytes: size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bs-cache-{label}-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn roomy_policy() -> EvictionPolicy {
        EvictionPolicy {
            max_age: Duration::days(7),
            max_total_bytes: u64::MAX,
        }
    }

    fn populate(dir: &Path) {
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("a.crate"), b"crate bytes").unwrap();
        std::fs::write(dir.join("nested/b.json"), b"{\"x\":1}").unwrap();
    }

    #[tokio::test]
    async fn save_then_restore_roundtrip() {
        let root = temp_dir("root");
        let src = temp_dir("src");
        populate(&src);

        let cache = LocalCache::open(&root, roomy_policy()).await.unwrap();
        let key = CacheKey::derive("Linux", "registry", b"lock v1");

        let outcome = cache.save(&key, &src).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Saved { size_bytes } if size_bytes > 0));

        let dest = temp_dir("dest").join("restored");
        assert!(cache.restore(&key, &dest).await.unwrap());
        assert_eq!(std::fs::read(dest.join("a.crate")).unwrap(), b"crate bytes");
        assert_eq!(std::fs::read(dest.join("nested/b.json")).unwrap(), b"{\"x\":1}");

        let _ = std::fs::remove_dir_all(&root);
        let _ = std::fs::remove_dir_all(&src);
    }

    #[tokio::test]
    async fn second_save_is_noop() {
        let root = temp_dir("root");
        let src = temp_dir("src");
        populate(&src);

        let cache = LocalCache::open(&root, roomy_policy()).await.unwrap();
        let key = CacheKey::derive("Linux", "index", b"lock");

        cache.save(&key, &src).await.unwrap();
        std::fs::write(src.join("a.crate"), b"changed").unwrap();
        assert_eq!(cache.save(&key, &src).await.unwrap(), SaveOutcome::AlreadyExists);

        // The first snapshot wins
        let dest = temp_dir("dest");
        cache.restore(&key, &dest).await.unwrap();
        assert_eq!(std::fs::read(dest.join("a.crate")).unwrap(), b"crate bytes");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn restore_unknown_key_is_miss() {
        let root = temp_dir("root");
        let cache = LocalCache::open(&root, roomy_policy()).await.unwrap();
        let key = CacheKey::derive("Linux", "target", b"never saved");
        let dest = temp_dir("dest");
        assert!(!cache.restore(&key, &dest).await.unwrap());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn missing_source_is_skipped() {
        let root = temp_dir("root");
        let cache = LocalCache::open(&root, roomy_policy()).await.unwrap();
        let key = CacheKey::derive("Linux", "target", b"lock");
        let outcome = cache
            .save(&key, &root.join("does-not-exist"))
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::SourceMissing);
        assert!(cache.entries().await.unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn corrupt_archive_is_miss() {
        let root = temp_dir("root");
        let src = temp_dir("src");
        populate(&src);

        let cache = LocalCache::open(&root, roomy_policy()).await.unwrap();
        let key = CacheKey::derive("Linux", "registry", b"lock");
        cache.save(&key, &src).await.unwrap();

        std::fs::write(cache.archive_path(&key.to_string()), b"not a gzip stream").unwrap();
        let dest = temp_dir("dest");
        assert!(!cache.restore(&key, &dest).await.unwrap());
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn corrupt_archive_is_dropped_and_resaved() {
        let root = temp_dir("root");
        let src = temp_dir("src");
        populate(&src);

        let cache = LocalCache::open(&root, roomy_policy()).await.unwrap();
        let key = CacheKey::derive("Linux", "target", b"lock");
        cache.save(&key, &src).await.unwrap();
        std::fs::write(cache.archive_path(&key.to_string()), b"junk").unwrap();

        let dest = temp_dir("dest").join("target");
        assert!(!cache.restore(&key, &dest).await.unwrap());
        assert!(cache.storage.get_entry(&key.to_string()).await.unwrap().is_none());
        assert!(!cache.archive_path(&key.to_string()).exists());

        let outcome = cache.save(&key, &src).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Saved { .. }));
        assert!(cache.restore(&key, &dest).await.unwrap());
        assert_eq!(std::fs::read(dest.join("a.crate")).unwrap(), b"crate bytes");

        let _ = std::fs::remove_dir_all(&root);
        let _ = std::fs::remove_dir_all(&src);
    }

    #[tokio::test]
    async fn save_waiting_on_lock_respects_timeout() {
        let root = temp_dir("root");
        let src = temp_dir("src");
        populate(&src);

        let cache = LocalCache::open(&root, roomy_policy()).await.unwrap();
        let key = CacheKey::derive("Linux", "registry", b"lock");

        // Another run holds the cache exclusively
        let held = CacheLock::exclusive(&root).await.unwrap();
        let started = std::time::Instant::now();
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(200), cache.save(&key, &src))
                .await;
        assert!(waited.is_err());
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        drop(held);

        // Nothing half-written was left behind
        let temps: Vec<_> = std::fs::read_dir(root.join(ARCHIVE_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(temps.is_empty());
        assert!(cache.entries().await.unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&root);
        let _ = std::fs::remove_dir_all(&src);
    }

    #[test]
    fn dropped_pending_archive_removes_temp_file() {
        let root = temp_dir("root");
        let path = root.join("x.tmp");
        std::fs::write(&path, b"partial").unwrap();
        drop(PendingArchive::new(path.clone()));
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn prune_removes_expired_entries() {
        let root = temp_dir("root");
        let src = temp_dir("src");
        populate(&src);

        let cache = LocalCache::open(&root, roomy_policy()).await.unwrap();
        let old = CacheKey::derive("Linux", "registry", b"old");
        let fresh = CacheKey::derive("Linux", "registry", b"fresh");
        cache.save(&old, &src).await.unwrap();
        cache.save(&fresh, &src).await.unwrap();

        cache
            .storage
            .touch_entry(&old.to_string(), Utc::now() - Duration::days(30))
            .await
            .unwrap();

        let report = cache.prune().await.unwrap();
        assert_eq!(report.removed, vec![old.to_string()]);
        assert!(!cache.archive_path(&old.to_string()).exists());
        assert!(cache.archive_path(&fresh.to_string()).exists());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn prune_evicts_least_recently_used_over_budget() {
        let root = temp_dir("root");
        let src = temp_dir("src");
        populate(&src);

        let mut cache = LocalCache::open(&root, roomy_policy()).await.unwrap();
        let first = CacheKey::derive("Linux", "target", b"1");
        let second = CacheKey::derive("Linux", "target", b"2");
        cache.save(&first, &src).await.unwrap();
        cache.save(&second, &src).await.unwrap();

        // Make `second` the least recently used
        cache
            .storage
            .touch_entry(&second.to_string(), Utc::now() - Duration::hours(1))
            .await
            .unwrap();

        let one_archive = cache.storage.get_entry(&first.to_string()).await.unwrap().unwrap();
        cache.policy.max_total_bytes = one_archive.size_bytes;

        let report = cache.prune().await.unwrap();
        assert_eq!(report.removed, vec![second.to_string()]);
        assert_eq!(cache.entries().await.unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn derive_keys_without_lockfile_disables_caching() {
        let dir = temp_dir("keys");
        let buckets = vec![CacheBucket {
            name: "registry".into(),
            path: dir.join("registry"),
        }];
        let keys = derive_keys("Linux", &dir.join("Cargo.lock"), &buckets).unwrap();
        assert!(keys.is_none());

        std::fs::write(dir.join("Cargo.lock"), b"version = 4\n").unwrap();
        let keys = derive_keys("Linux", &dir.join("Cargo.lock"), &buckets)
            .unwrap()
            .unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].1, CacheKey::derive("Linux", "registry", b"version = 4\n"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn resolve_buckets_uses_workspace_for_relative_paths() {
        let config = CacheConfig::default();
        let buckets = resolve_buckets(&config, Path::new("/work/repo"));
        let names: Vec<_> = buckets.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["registry", "index", "target"]);
        assert_eq!(buckets[2].path, PathBuf::from("/work/repo/target"));
    }
}
