//! Injected execution context.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bookship_shared::{AppConfig, RunId, expand_path, runner_os};

use crate::process::{CommandRunner, TokioCommandRunner};

/// Everything a run needs from its surroundings.
///
/// Steps read the workspace, configuration and OS label from here instead
/// of ambient process state, and launch tools through `runner`.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Repository checkout the run operates on.
    pub workspace: PathBuf,
    pub config: AppConfig,
    /// OS label used in cache keys.
    pub os: String,
    pub runner: Arc<dyn CommandRunner>,
    /// Root for per-run scratch directories (packaged artifacts).
    pub scratch_root: PathBuf,
}

impl ExecutionContext {
    pub fn new(workspace: impl Into<PathBuf>, config: AppConfig) -> Self {
        Self {
            workspace: workspace.into(),
            config,
            os: runner_os(),
            runner: Arc::new(TokioCommandRunner),
            scratch_root: std::env::temp_dir().join("bookship"),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = os.into();
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn resolve(&self, raw: &str) -> PathBuf {
        expand_path(raw, &self.workspace)
    }

    pub fn source_dir(&self) -> PathBuf {
        self.resolve(&self.config.build.source_dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.resolve(&self.config.build.output_dir)
    }

    pub fn lockfile(&self) -> PathBuf {
        self.resolve(&self.config.cache.lockfile)
    }

    /// Scratch directory owned by a single run.
    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.scratch_root.join(run_id.short())
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("workspace", &self.workspace)
            .field("os", &self.os)
            .field("scratch_root", &self.scratch_root)
            .finish_non_exhaustive()
    }
}
