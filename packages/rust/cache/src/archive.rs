//! gzip'd tar archives for cache buckets.
//!
//! Everything here is blocking; callers run it on `spawn_blocking`.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use uuid::Uuid;

use bookship_shared::{BookshipError, Result};

/// Archive the contents of `src` into `dst`. Symlinks are stored as links.
pub(crate) fn pack_dir(src: &Path, dst: &Path) -> Result<u64> {
    let file = File::create(dst).map_err(|e| BookshipError::io(dst, e))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    builder
        .append_dir_all(".", src)
        .map_err(|e| BookshipError::Cache(format!("tar append failed for {}: {e}", src.display())))?;

    let encoder = builder
        .into_inner()
        .map_err(|e| BookshipError::Cache(format!("tar finalize failed: {e}")))?;
    let writer = encoder
        .finish()
        .map_err(|e| BookshipError::Cache(format!("gzip finish failed: {e}")))?;
    writer
        .into_inner()
        .map_err(|e| BookshipError::Cache(format!("flush failed: {e}")))?
        .sync_all()
        .map_err(|e| BookshipError::io(dst, e))?;

    let size = std::fs::metadata(dst)
        .map_err(|e| BookshipError::io(dst, e))?
        .len();
    Ok(size)
}

/// Extract `archive` into `dest`.
///
/// The archive is first unpacked into a sibling staging directory; `dest`
/// is only touched after the whole archive read cleanly. Existing files in
/// `dest` are replaced, others are left alone. Mtimes are preserved so
/// incremental builds stay warm.
pub(crate) fn restore_into(archive: &Path, dest: &Path) -> Result<()> {
    let staging = staging_dir(dest)?;

    let unpacked = unpack(archive, &staging);
    let merged = unpacked.and_then(|()| merge_into(&staging, dest));
    match std::fs::remove_dir_all(&staging) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %staging.display(), error = %e, "failed to remove restore staging dir"),
    }
    merged
}

fn staging_dir(dest: &Path) -> Result<PathBuf> {
    let parent = dest
        .parent()
        .ok_or_else(|| BookshipError::validation(format!("{} has no parent directory", dest.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| BookshipError::io(parent, e))?;

    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache".into());
    Ok(parent.join(format!(".{name}.restore-{}", Uuid::now_v7().simple())))
}

fn unpack(archive: &Path, into: &Path) -> Result<()> {
    std::fs::create_dir_all(into).map_err(|e| BookshipError::io(into, e))?;

    let file = File::open(archive).map_err(|e| BookshipError::io(archive, e))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.set_preserve_mtime(true);
    tar.set_overwrite(true);
    tar.unpack(into).map_err(|e| {
        BookshipError::Cache(format!("extract of {} failed: {e}", archive.display()))
    })
}

/// Move the contents of `src` into `dest`, descending into directories that
/// exist on both sides.
fn merge_into(src: &Path, dest: &Path) -> Result<()> {
    if !dest.exists() {
        return std::fs::rename(src, dest).map_err(|e| BookshipError::io(dest, e));
    }

    let entries = std::fs::read_dir(src).map_err(|e| BookshipError::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| BookshipError::io(src, e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let from_is_dir = entry
            .file_type()
            .map_err(|e| BookshipError::io(&from, e))?
            .is_dir();

        match std::fs::symlink_metadata(&to) {
            Ok(meta) if meta.is_dir() && from_is_dir => merge_into(&from, &to)?,
            Ok(meta) if meta.is_dir() => {
                std::fs::remove_dir_all(&to).map_err(|e| BookshipError::io(&to, e))?;
                std::fs::rename(&from, &to).map_err(|e| BookshipError::io(&to, e))?;
            }
            Ok(_) => {
                std::fs::remove_file(&to).map_err(|e| BookshipError::io(&to, e))?;
                std::fs::rename(&from, &to).map_err(|e| BookshipError::io(&to, e))?;
            }
            Err(_) => std::fs::rename(&from, &to).map_err(|e| BookshipError::io(&to, e))?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bs-archive-{label}-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn restore_merges_over_existing_tree() {
        let src = temp_dir("src");
        std::fs::create_dir_all(src.join("debug")).unwrap();
        std::fs::write(src.join("debug/app"), b"cached").unwrap();

        let work = temp_dir("work");
        let archive = work.join("a.tar.gz");
        pack_dir(&src, &archive).unwrap();

        let dest = work.join("target");
        std::fs::create_dir_all(dest.join("debug")).unwrap();
        std::fs::write(dest.join("debug/app"), b"stale").unwrap();
        std::fs::write(dest.join("debug/local"), b"kept").unwrap();

        restore_into(&archive, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("debug/app")).unwrap(), b"cached");
        assert_eq!(std::fs::read(dest.join("debug/local")).unwrap(), b"kept");

        // No staging directories left next to the destination
        let leftovers: Vec<_> = std::fs::read_dir(&work)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".restore-"))
            .collect();
        assert!(leftovers.is_empty());

        let _ = std::fs::remove_dir_all(&src);
        let _ = std::fs::remove_dir_all(&work);
    }

    #[test]
    fn truncated_archive_leaves_destination_untouched() {
        let src = temp_dir("src");
        for i in 0..50 {
            std::fs::write(src.join(format!("file-{i}")), vec![b'x'; 4096]).unwrap();
        }

        let work = temp_dir("work");
        let archive = work.join("a.tar.gz");
        pack_dir(&src, &archive).unwrap();
        let bytes = std::fs::read(&archive).unwrap();
        std::fs::write(&archive, &bytes[..bytes.len() / 2]).unwrap();

        let dest = work.join("registry");
        assert!(restore_into(&archive, &dest).is_err());
        assert!(!dest.exists());

        let _ = std::fs::remove_dir_all(&src);
        let _ = std::fs::remove_dir_all(&work);
    }
}
