//! Site artifact packaging.
//!
//! Turns a built site directory into the single gzip'd tarball the hosting
//! service accepts. Entry names are relative to the site root (`index.html`,
//! `guide/install.html`), only regular files and directories are included,
//! and the archive's SHA-256 is recorded so the upload can be verified.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use bookship_shared::{BookshipError, Result};

/// Handle to a packaged site, passed to the deployment step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackagedArtifact {
    /// Archive on disk.
    pub path: PathBuf,
    /// Hex SHA-256 of the archive bytes.
    pub sha256: String,
    pub size_bytes: u64,
    /// Number of regular files inside the archive.
    pub file_count: usize,
}

/// Package `site_dir` into a gzip'd tarball at `dest`.
///
/// The archive is written to a temp file next to `dest` and renamed into
/// place, so a failed packaging never leaves a truncated artifact behind.
#[instrument(skip_all, fields(site = %site_dir.display(), dest = %dest.display()))]
pub fn package_site(site_dir: &Path, dest: &Path) -> Result<PackagedArtifact> {
    if !site_dir.is_dir() {
        return Err(BookshipError::packaging(format!(
            "{} is not a directory",
            site_dir.display()
        )));
    }

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| packaging_io(parent, e))?;
    }

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact.tar.gz".into());
    let temp = dest.with_file_name(format!(".{file_name}.tmp"));

    let file_count = match write_archive(site_dir, &temp) {
        Ok(count) => count,
        Err(e) => {
            let _ = std::fs::remove_file(&temp);
            return Err(e);
        }
    };

    if file_count == 0 {
        let _ = std::fs::remove_file(&temp);
        return Err(BookshipError::packaging(format!(
            "{} contains no files",
            site_dir.display()
        )));
    }

    // Atomic rename
    std::fs::rename(&temp, dest).map_err(|e| packaging_io(dest, e))?;

    let (sha256, size_bytes) = hash_file(dest)?;

    info!(file_count, size_bytes, %sha256, "site packaged");

    Ok(PackagedArtifact {
        path: dest.to_path_buf(),
        sha256,
        size_bytes,
        file_count,
    })
}

/// Write the tarball and return the number of files archived.
fn write_archive(site_dir: &Path, dest: &Path) -> Result<usize> {
    let file = File::create(dest).map_err(|e| packaging_io(dest, e))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    let mut file_count = 0usize;

    for entry in WalkDir::new(site_dir).sort_by_file_name().min_depth(1) {
        let entry = entry.map_err(|e| BookshipError::packaging(format!("walk failed: {e}")))?;
        let path = entry.path();
        let rel = path.strip_prefix(site_dir).map_err(|_| {
            BookshipError::packaging(format!(
                "path {} is not under {}",
                path.display(),
                site_dir.display()
            ))
        })?;
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            warn!(path = %rel.display(), "skipping symlink");
            continue;
        }

        if file_type.is_dir() {
            builder
                .append_dir(rel, path)
                .map_err(|e| BookshipError::packaging(format!("{}: {e}", rel.display())))?;
        } else if file_type.is_file() {
            let mut source = File::open(path).map_err(|e| packaging_io(path, e))?;
            builder
                .append_file(rel, &mut source)
                .map_err(|e| BookshipError::packaging(format!("{}: {e}", rel.display())))?;
            file_count += 1;
            debug!(file = %rel.display(), "archived");
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| BookshipError::packaging(format!("tar finalize failed: {e}")))?;
    let writer = encoder
        .finish()
        .map_err(|e| BookshipError::packaging(format!("gzip finish failed: {e}")))?;
    writer
        .into_inner()
        .map_err(|e| BookshipError::packaging(format!("flush failed: {e}")))?
        .sync_all()
        .map_err(|e| packaging_io(dest, e))?;

    Ok(file_count)
}

fn hash_file(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path).map_err(|e| packaging_io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).map_err(|e| packaging_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((format!("{:x}", hasher.finalize()), total))
}

fn packaging_io(path: &Path, e: std::io::Error) -> BookshipError {
    BookshipError::packaging(format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "bs-artifacts-test-{}",
            uuid::Uuid::now_v7()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn make_site(root: &Path) -> PathBuf {
        let site = root.join("book");
        std::fs::create_dir_all(site.join("guide")).unwrap();
        std::fs::write(site.join("index.html"), "<h1>Home</h1>").unwrap();
        std::fs::write(site.join("guide/install.html"), "<h1>Install</h1>").unwrap();
        std::fs::write(site.join(".nojekyll"), "").unwrap();
        site
    }

    fn archive_names(path: &Path) -> Vec<String> {
        let file = File::open(path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().to_string();
                name.trim_end_matches('/').to_string()
            })
            .collect()
    }

    #[test]
    fn packages_all_files_with_relative_paths() {
        let tmp = temp_dir();
        let site = make_site(&tmp);

        let artifact = package_site(&site, &tmp.join("out/artifact.tar.gz")).unwrap();

        assert_eq!(artifact.file_count, 3);
        assert_eq!(artifact.sha256.len(), 64);
        assert!(artifact.size_bytes > 0);

        let mut names = archive_names(&artifact.path);
        names.sort();
        assert_eq!(
            names,
            vec![".nojekyll", "guide", "guide/install.html", "index.html"]
        );

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn packaging_is_deterministic() {
        let tmp = temp_dir();
        let site = make_site(&tmp);

        let a = package_site(&site, &tmp.join("a.tar.gz")).unwrap();
        let b = package_site(&site, &tmp.join("b.tar.gz")).unwrap();
        assert_eq!(a.sha256, b.sha256);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn empty_site_is_rejected() {
        let tmp = temp_dir();
        let site = tmp.join("empty");
        std::fs::create_dir_all(&site).unwrap();

        let err = package_site(&site, &tmp.join("artifact.tar.gz")).unwrap_err();
        assert!(matches!(err, BookshipError::Packaging { .. }));
        assert!(!tmp.join("artifact.tar.gz").exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn missing_site_is_packaging_error() {
        let tmp = temp_dir();
        let err = package_site(&tmp.join("nope"), &tmp.join("artifact.tar.gz")).unwrap_err();
        assert!(matches!(err, BookshipError::Packaging { .. }));
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let tmp = temp_dir();
        let site = make_site(&tmp);
        let out = tmp.join("out");
        package_site(&site, &out.join("artifact.tar.gz")).unwrap();

        for entry in std::fs::read_dir(&out).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            assert!(!name.starts_with('.'), "temp file left behind: {name}");
        }

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
