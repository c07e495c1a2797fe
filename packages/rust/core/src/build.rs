//! Build step: run the documentation generator and swap the result into place.
//!
//! The generator writes into a per-run staging directory beside the output
//! directory. The marker file is written into staging, then staging replaces
//! the output directory by rename. Until that rename the previous output is
//! untouched; a [`DirGuard`] removes staging on failure or cancellation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use bookship_shared::{BookshipError, Result, RunId};

use crate::context::ExecutionContext;
use crate::process::{CommandRunner, CommandSpec};

/// External documentation generator.
#[async_trait]
pub trait DocGenerator: Send + Sync {
    /// Render `source` into `dest`. `dest` does not exist beforehand.
    async fn generate(&self, source: &Path, dest: &Path) -> Result<()>;
}

/// `mdbook build <source> --dest-dir <dest>`.
pub struct MdBook {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl MdBook {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }
}

#[async_trait]
impl DocGenerator for MdBook {
    async fn generate(&self, source: &Path, dest: &Path) -> Result<()> {
        let spec = CommandSpec::new(&self.program)
            .arg("build")
            .arg(source.to_string_lossy())
            .arg("--dest-dir")
            .arg(dest.to_string_lossy());

        let output = self.runner.run(&spec).await.map_err(|e| {
            BookshipError::build(format!(
                "failed to run `{}`: {e}. Is it installed?",
                self.program
            ))
        })?;

        if !output.success() {
            return Err(BookshipError::build(format!(
                "`{spec}` {}\n{}",
                output.describe_exit(),
                output.stderr_tail()
            ))
            .with_exit_code(output.exit_code));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// Removes a directory when dropped unless disarmed.
pub(crate) struct DirGuard {
    path: PathBuf,
    armed: bool,
}

impl DirGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed scratch directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove scratch directory"),
        }
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub output_dir: PathBuf,
    /// Files produced by the generator, excluding the marker.
    pub file_count: usize,
}

/// Build the site for run `run_id` into the configured output directory.
#[instrument(skip_all, fields(run = %run_id.short()))]
pub async fn build_site(
    ctx: &ExecutionContext,
    run_id: &RunId,
    generator: &dyn DocGenerator,
) -> Result<BuildOutput> {
    let source = ctx.source_dir();
    let output = ctx.output_dir();
    let marker = &ctx.config.build.marker_file;

    if !source.is_dir() {
        return Err(BookshipError::build(format!(
            "source directory {} does not exist",
            source.display()
        )));
    }

    let parent = output
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ctx.workspace.clone());
    std::fs::create_dir_all(&parent).map_err(|e| build_io(&parent, e))?;

    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "site".into());
    let staging = DirGuard::new(parent.join(format!(".{name}.staging-{}", run_id.short())));

    info!(source = %source.display(), staging = %staging.path().display(), "running generator");
    generator.generate(&source, staging.path()).await?;

    let file_count = count_files(staging.path())?;
    if file_count == 0 {
        return Err(BookshipError::build(format!(
            "generator produced no files in {}",
            staging.path().display()
        )));
    }

    // Overwrite, never merge, whatever the generator emitted
    let marker_path = staging.path().join(marker);
    std::fs::write(&marker_path, b"").map_err(|e| build_io(&marker_path, e))?;

    swap_into_place(staging.path(), &output, run_id)?;
    staging.disarm();

    info!(output = %output.display(), file_count, "site built");
    Ok(BuildOutput {
        output_dir: output,
        file_count,
    })
}

/// Replace `output` with `staging`, keeping the old tree until the new one
/// is in place.
fn swap_into_place(staging: &Path, output: &Path, run_id: &RunId) -> Result<()> {
    if !output.exists() {
        return std::fs::rename(staging, output).map_err(|e| build_io(output, e));
    }

    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "site".into());
    let retired = output.with_file_name(format!(".{name}.old-{}", run_id.short()));

    std::fs::rename(output, &retired).map_err(|e| build_io(output, e))?;
    if let Err(e) = std::fs::rename(staging, output) {
        // Put the previous build back
        let _ = std::fs::rename(&retired, output);
        return Err(build_io(output, e));
    }

    if let Err(e) = std::fs::remove_dir_all(&retired) {
        warn!(path = %retired.display(), error = %e, "failed to remove previous build");
    }
    Ok(())
}

fn count_files(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|e| BookshipError::build(format!("walk failed: {e}")))?;
        if entry.file_type().is_file() {
            count += 1;
        }
    }
    Ok(count)
}

fn build_io(path: &Path, e: std::io::Error) -> BookshipError {
    BookshipError::build(format!("{}: {e}", path.display()))
}
