//! Advisory lock over the cache root.
//!
//! Restores hold a shared lock, saves and pruning hold an exclusive one, so
//! concurrent runs never observe a half-written archive or index.
//!
//! Acquisition polls with `try_lock` and sleeps between attempts, so a
//! waiting run stays cancellable and its step timeout can still fire.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

use fs4::fs_std::FileExt;
use tracing::debug;

use bookship_shared::{BookshipError, Result};

const LOCK_FILE: &str = ".lock";
const FIRST_POLL: Duration = Duration::from_millis(20);
const MAX_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
enum Mode {
    Shared,
    Exclusive,
}

/// Held lock; released when dropped.
pub(crate) struct CacheLock {
    _file: File,
}

impl CacheLock {
    pub(crate) async fn shared(root: &Path) -> Result<Self> {
        Self::acquire(root, Mode::Shared).await
    }

    pub(crate) async fn exclusive(root: &Path) -> Result<Self> {
        Self::acquire(root, Mode::Exclusive).await
    }

    async fn acquire(root: &Path, mode: Mode) -> Result<Self> {
        let file = open_lock_file(root)?;
        let contended = fs4::lock_contended_error().kind();
        let mut delay = FIRST_POLL;
        let mut announced = false;

        loop {
            let attempt = match mode {
                Mode::Shared => FileExt::try_lock_shared(&file),
                Mode::Exclusive => FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => return Ok(Self { _file: file }),
                Err(e) if e.kind() == contended => {
                    if !announced {
                        debug!(?mode, root = %root.display(), "cache locked by another run, waiting");
                        announced = true;
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_POLL);
                }
                Err(e) => {
                    return Err(BookshipError::Cache(format!(
                        "failed to acquire {mode:?} cache lock: {e}"
                    )));
                }
            }
        }
    }
}

fn open_lock_file(root: &Path) -> Result<File> {
    std::fs::create_dir_all(root).map_err(|e| BookshipError::io(root, e))?;
    let path = root.join(LOCK_FILE);
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| BookshipError::io(&path, e))
}
