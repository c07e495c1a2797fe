//! End-to-end run: trigger → provision → build → publish → cache save.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};

use bookship_cache::{CacheBackend, CacheBucket, SaveOutcome, derive_keys, resolve_buckets};
use bookship_shared::{
    BookshipError, CacheKey, DeploymentResult, PipelineRun, Result, RunState, RunStep,
};

use crate::build::{DocGenerator, MdBook, build_site};
use crate::context::ExecutionContext;
use crate::provision::{CargoToolInstaller, RustupInstaller, ToolInstaller, ToolchainInstaller};
use crate::publish::{ArtifactPackager, Deployer, PagesDeployer, TarballPackager, publish_site};
use crate::retry::{RetryPolicy, retry_async};
use crate::trigger::{TagPolicy, TriggerDecision, TriggerEvent, evaluate};

// ---------------------------------------------------------------------------
// Collaborators and options
// ---------------------------------------------------------------------------

/// External collaborators a run drives.
#[derive(Clone)]
pub struct Collaborators {
    pub toolchain: Arc<dyn ToolchainInstaller>,
    pub tools: Arc<dyn ToolInstaller>,
    pub generator: Arc<dyn DocGenerator>,
    pub packager: Arc<dyn ArtifactPackager>,
    pub deployer: Arc<dyn Deployer>,
    /// `None` runs uncached.
    pub cache: Option<Arc<dyn CacheBackend>>,
}

impl Collaborators {
    /// The real tools: rustup, cargo install, the configured generator and
    /// the hosting API.
    pub fn real(ctx: &ExecutionContext, cache: Option<Arc<dyn CacheBackend>>) -> Self {
        Self {
            toolchain: Arc::new(RustupInstaller::new(ctx.runner.clone())),
            tools: Arc::new(CargoToolInstaller::new(ctx.runner.clone())),
            generator: Arc::new(MdBook::new(
                ctx.runner.clone(),
                ctx.config.build.generator.clone(),
            )),
            packager: Arc::new(TarballPackager),
            deployer: Arc::new(PagesDeployer::new(ctx.config.publish.clone())),
            cache,
        }
    }
}

/// Per-invocation switches.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip toolchain and tool installation (caches are still restored).
    pub skip_provision: bool,
    /// Stop after the build step.
    pub dry_run: bool,
}

// ---------------------------------------------------------------------------
// Progress and results
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after every state transition.
    fn state_changed(&self, state: RunState);
    /// Called once the run has finished, successfully or not.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn state_changed(&self, _state: RunState) {}
    fn done(&self, _report: &RunReport) {}
}

/// Everything known about a finished run.
#[derive(Debug)]
pub struct RunReport {
    pub run: PipelineRun,
    pub state: RunState,
    pub output_dir: Option<PathBuf>,
    pub deployment: Option<DeploymentResult>,
    pub cache_hits: usize,
    pub caches_saved: usize,
    /// Set when `state` is `Failed`.
    pub error: Option<BookshipError>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn failed_step(&self) -> Option<RunStep> {
        self.error.as_ref().map(BookshipError::step)
    }
}

/// Outcome of [`run_pipeline`].
#[derive(Debug)]
pub enum RunOutcome {
    /// The trigger evaluator said SKIP; nothing ran.
    Skipped { reason: String },
    Finished(RunReport),
}

impl RunOutcome {
    /// Process exit code: 0 for skips and successes, the error's code otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Skipped { .. } => 0,
            Self::Finished(report) => report.error.as_ref().map_or(0, BookshipError::exit_code),
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Tracks the state machine and reports transitions.
struct Tracker<'a> {
    state: RunState,
    progress: &'a dyn ProgressReporter,
}

impl Tracker<'_> {
    fn advance(&mut self, next: RunState) -> Result<()> {
        self.state = self.state.transition(next)?;
        info!(state = %next, "run state");
        self.progress.state_changed(next);
        Ok(())
    }
}

/// Evaluate `event` and, on START, drive a full run.
///
/// Step failures do not surface as `Err`: they move the run to `FAILED`
/// and are recorded in the report. `Err` is reserved for setup problems
/// before a run exists, such as an unusable tag pattern.
#[instrument(skip_all, fields(event = ?event.kind, git_ref = %event.git_ref))]
pub async fn run_pipeline(
    ctx: &ExecutionContext,
    event: &TriggerEvent,
    collaborators: &Collaborators,
    opts: &RunOptions,
    progress: &dyn ProgressReporter,
) -> Result<RunOutcome> {
    progress.phase("Evaluating trigger");
    let policy = TagPolicy::from_config(&ctx.config.trigger)?;
    let kind = match evaluate(event, &policy) {
        TriggerDecision::Skip { reason } => {
            info!(%reason, "run skipped");
            return Ok(RunOutcome::Skipped { reason });
        }
        TriggerDecision::Start(kind) => kind,
    };

    let start = Instant::now();
    let run = PipelineRun::new(kind, event.git_ref.clone()).with_sha(event.sha.clone());
    info!(run_id = %run.id, trigger = %run.trigger_kind, "run started");

    let mut tracker = Tracker {
        state: RunState::Pending,
        progress,
    };
    progress.state_changed(RunState::Pending);

    let mut report = RunReport {
        run,
        state: RunState::Pending,
        output_dir: None,
        deployment: None,
        cache_hits: 0,
        caches_saved: 0,
        error: None,
        elapsed: Duration::ZERO,
    };

    let keys = if collaborators.cache.is_some() && ctx.config.cache.enabled {
        cache_keys(ctx)
    } else {
        None
    };

    let result = drive(ctx, collaborators, opts, keys.as_deref(), &mut tracker, &mut report).await;

    match result {
        Ok(()) => {
            if let (Some(cache), Some(keys)) = (&collaborators.cache, &keys) {
                progress.phase("Saving caches");
                report.caches_saved = save_caches(cache.as_ref(), keys).await;
            }
        }
        Err(err) => {
            // Failed is reachable from every non-terminal state
            if let Err(e) = tracker.advance(RunState::Failed) {
                warn!(error = %e, "could not record failure state");
            }
            error!(
                step = %err.step(),
                exit_code = err.exit_code(),
                error = %err,
                "run failed"
            );
            report.error = Some(err);
        }
    }

    report.state = tracker.state;
    report.elapsed = start.elapsed();
    progress.done(&report);

    info!(
        run_id = %report.run.id,
        state = %report.state,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "run finished"
    );

    Ok(RunOutcome::Finished(report))
}

async fn drive(
    ctx: &ExecutionContext,
    collab: &Collaborators,
    opts: &RunOptions,
    keys: Option<&[(CacheBucket, CacheKey)]>,
    tracker: &mut Tracker<'_>,
    report: &mut RunReport,
) -> Result<()> {
    let retry = RetryPolicy::from(&ctx.config.retry);
    let timeouts = &ctx.config.timeouts;

    // --- Provision ---
    let hits = with_timeout(
        timeouts.provision_secs,
        || BookshipError::provisioning("provision", format!("timed out after {}s", timeouts.provision_secs)),
        provision(ctx, collab, opts, keys, &retry, tracker.progress),
    )
    .await?;
    report.cache_hits = hits;
    tracker.advance(RunState::Provisioned)?;

    // --- Build ---
    tracker.progress.phase("Building documentation");
    let built = with_timeout(
        timeouts.build_secs,
        || BookshipError::build(format!("timed out after {}s", timeouts.build_secs)),
        build_site(ctx, &report.run.id, collab.generator.as_ref()),
    )
    .await?;
    report.output_dir = Some(built.output_dir.clone());
    tracker.advance(RunState::Built)?;

    if opts.dry_run {
        info!(output = %built.output_dir.display(), "dry run, skipping publish");
        return Ok(());
    }

    // --- Publish ---
    tracker.progress.phase("Publishing site");
    let version = report.run.build_version();
    let deployment = with_timeout(
        timeouts.publish_secs,
        || BookshipError::deployment(format!("timed out after {}s", timeouts.publish_secs)),
        publish_site(
            ctx,
            &report.run.id,
            &built.output_dir,
            &version,
            collab.packager.as_ref(),
            collab.deployer.as_ref(),
            &retry,
        ),
    )
    .await?;
    report.deployment = Some(deployment);
    tracker.advance(RunState::Deployed)?;

    Ok(())
}

/// Toolchain, cache restore, then auxiliary tools. Returns the number of
/// cache hits.
async fn provision(
    ctx: &ExecutionContext,
    collab: &Collaborators,
    opts: &RunOptions,
    keys: Option<&[(CacheBucket, CacheKey)]>,
    retry: &RetryPolicy,
    progress: &dyn ProgressReporter,
) -> Result<usize> {
    if !opts.skip_provision {
        progress.phase("Installing toolchain");
        retry_async(retry, "toolchain", || {
            collab.toolchain.ensure_toolchain(&ctx.config.toolchain)
        })
        .await?;
    }

    let mut hits = 0;
    if let (Some(cache), Some(keys)) = (&collab.cache, keys) {
        progress.phase("Restoring caches");
        hits = restore_caches(cache.as_ref(), keys).await;
    }

    if !opts.skip_provision {
        for tool in &ctx.config.tools {
            progress.phase(&format!("Installing {}", tool.name));
            retry_async(retry, &tool.name, || collab.tools.ensure_tool(tool)).await?;
        }
    }

    Ok(hits)
}

// ---------------------------------------------------------------------------
// Cache helpers
// ---------------------------------------------------------------------------

fn cache_keys(ctx: &ExecutionContext) -> Option<Vec<(CacheBucket, CacheKey)>> {
    let buckets = resolve_buckets(&ctx.config.cache, &ctx.workspace);
    match derive_keys(&ctx.os, &ctx.lockfile(), &buckets) {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "cannot derive cache keys, running uncached");
            None
        }
    }
}

/// Misses and restore errors are never fatal.
async fn restore_caches(cache: &dyn CacheBackend, keys: &[(CacheBucket, CacheKey)]) -> usize {
    let mut hits = 0;
    for (bucket, key) in keys {
        match cache.restore(key, &bucket.path).await {
            Ok(true) => hits += 1,
            Ok(false) => {}
            Err(e) => warn!(bucket = %bucket.name, %key, error = %e, "cache restore failed"),
        }
    }
    info!(hits, buckets = keys.len(), "caches restored");
    hits
}

/// Save failures are logged and ignored; the run has already succeeded.
async fn save_caches(cache: &dyn CacheBackend, keys: &[(CacheBucket, CacheKey)]) -> usize {
    let mut saved = 0;
    for (bucket, key) in keys {
        match cache.save(key, &bucket.path).await {
            Ok(SaveOutcome::Saved { .. }) => saved += 1,
            Ok(SaveOutcome::AlreadyExists) => {}
            Ok(SaveOutcome::SourceMissing) => {
                warn!(bucket = %bucket.name, path = %bucket.path.display(), "cache path missing, not saved");
            }
            Err(e) => warn!(bucket = %bucket.name, %key, error = %e, "cache save failed"),
        }
    }
    saved
}

/// Bound `fut` by `secs` seconds; `0` disables the limit.
async fn with_timeout<T>(
    secs: u64,
    on_timeout: impl FnOnce() -> BookshipError,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    if secs == 0 {
        return fut.await;
    }
    match tokio::time::timeout(Duration::from_secs(secs), fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_maps_to_step_error() {
        let err = with_timeout(
            1,
            || BookshipError::build("timed out after 1s"),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.step(), RunStep::Build);
    }

    #[tokio::test]
    async fn zero_timeout_is_unbounded() {
        let value = with_timeout(0, || BookshipError::build("never"), async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(
            RunOutcome::Skipped {
                reason: "not a tag".into()
            }
            .exit_code(),
            0
        );

        let report = RunReport {
            run: PipelineRun::new(bookship_shared::TriggerKind::Manual, "main"),
            state: RunState::Failed,
            output_dir: None,
            deployment: None,
            cache_hits: 0,
            caches_saved: 0,
            error: Some(BookshipError::build("boom").with_exit_code(Some(4))),
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.failed_step(), Some(RunStep::Build));
        assert_eq!(RunOutcome::Finished(report).exit_code(), 4);
    }
}
