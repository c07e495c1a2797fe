//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use bookship_cache::{CacheBackend, LocalCache, derive_keys, resolve_buckets};
use bookship_core::ExecutionContext;
use bookship_core::build::{MdBook, build_site};
use bookship_core::pipeline::{
    Collaborators, ProgressReporter, RunOptions, RunOutcome, RunReport, run_pipeline,
};
use bookship_core::trigger::{TagPolicy, TriggerDecision, TriggerEvent, evaluate};
use bookship_shared::{
    AppConfig, BookshipError, CONFIG_FILE_NAME, RunId, RunState, config_file_path, init_config,
    load_config, validate_publish_env,
};

/// Exit code reported when the run is interrupted.
const EXIT_CANCELLED: u8 = 130;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// bookship: build a documentation book and publish it on release.
#[derive(Parser)]
#[command(
    name = "bookship",
    version,
    about = "Build a documentation book and publish it to static hosting on tagged releases.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ./bookship.toml, then ~/.bookship/bookship.toml).
    #[arg(long, global = true, env = "BOOKSHIP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Repository checkout to operate on (defaults to the current directory).
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Evaluate the event and, if it qualifies, provision, build and publish.
    Run {
        /// Event descriptor as JSON, or @path to a JSON file. Read from the
        /// CI environment when omitted.
        #[arg(long)]
        event: Option<String>,

        /// Skip toolchain and tool installation.
        #[arg(long)]
        skip_provision: bool,

        /// Do not restore or save caches.
        #[arg(long)]
        no_cache: bool,

        /// Stop after the build step.
        #[arg(long)]
        dry_run: bool,
    },

    /// Evaluate an event without running anything.
    Trigger {
        /// Event descriptor as JSON, or @path to a JSON file.
        #[arg(long)]
        event: Option<String>,
    },

    /// Build the book only.
    Build,

    /// Cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Check that publish credentials are available.
    Preflight,
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Print the cache keys for the current lock file.
    Key,
    /// List cached entries, least recently used first.
    List,
    /// Evict expired and over-budget entries.
    Prune,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Write a config file with defaults.
    Init {
        /// Write the user-wide config instead of ./bookship.toml.
        #[arg(long)]
        user: bool,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "bookship=info",
        1 => "bookship=debug",
        _ => "bookship=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    let workspace = match &cli.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()
            .map_err(|e| eyre!("cannot determine working directory: {e}"))?,
    };
    let config_path = cli.config.as_deref();
    let show_progress = cli.log_format == LogFormat::Text;

    match cli.command {
        Command::Run {
            event,
            skip_provision,
            no_cache,
            dry_run,
        } => {
            let opts = RunOptions {
                skip_provision,
                dry_run,
            };
            cmd_run(
                &workspace,
                config_path,
                event.as_deref(),
                &opts,
                no_cache,
                show_progress,
            )
            .await
        }
        Command::Trigger { event } => cmd_trigger(&workspace, config_path, event.as_deref()),
        Command::Build => cmd_build(&workspace, config_path, show_progress).await,
        Command::Cache { action } => match action {
            CacheAction::Key => cmd_cache_key(&workspace, config_path),
            CacheAction::List => cmd_cache_list(&workspace, config_path).await,
            CacheAction::Prune => cmd_cache_prune(&workspace, config_path).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init { user, force } => cmd_config_init(&workspace, user, force),
            ConfigAction::Show => cmd_config_show(&workspace, config_path),
        },
        Command::Preflight => cmd_preflight(&workspace, config_path),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load(workspace: &Path, config_path: Option<&Path>) -> Result<AppConfig> {
    Ok(load_config(config_path, workspace)?)
}

fn parse_event(arg: Option<&str>) -> Result<TriggerEvent, BookshipError> {
    match arg {
        Some(arg) => TriggerEvent::from_arg(arg),
        None => TriggerEvent::from_env(),
    }
}

/// Report a pipeline error on stderr and turn it into an exit code.
fn fail(err: &BookshipError) -> ExitCode {
    eprintln!("error: {} step failed: {err}", err.step());
    exit_code(err.exit_code())
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(clamp_exit(code))
}

/// Process exit statuses are a byte; anything outside maps to 1.
fn clamp_exit(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

/// Open the cache unless disabled. Failing to open it is not fatal.
async fn open_cache(ctx: &ExecutionContext, no_cache: bool) -> Option<Arc<dyn CacheBackend>> {
    if no_cache || !ctx.config.cache.enabled {
        info!("caching disabled");
        return None;
    }
    match LocalCache::from_config(&ctx.config.cache, &ctx.workspace).await {
        Ok(cache) => {
            info!(root = %cache.root().display(), "cache opened");
            Some(Arc::new(cache))
        }
        Err(e) => {
            warn!(error = %e, "cache unavailable, running uncached");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    workspace: &Path,
    config_path: Option<&Path>,
    event: Option<&str>,
    opts: &RunOptions,
    no_cache: bool,
    show_progress: bool,
) -> Result<ExitCode> {
    let config = load(workspace, config_path)?;

    let event = match parse_event(event) {
        Ok(event) => event,
        Err(e) => return Ok(fail(&e)),
    };

    let ctx = ExecutionContext::new(workspace, config);
    let cache = open_cache(&ctx, no_cache).await;
    let collaborators = Collaborators::real(&ctx, cache);
    let reporter = CliProgress::new(show_progress);

    info!(
        workspace = %workspace.display(),
        event = ?event.kind,
        git_ref = %event.git_ref,
        dry_run = opts.dry_run,
        "starting run"
    );

    // Dropping the run future kills child processes and removes staging dirs
    let outcome = tokio::select! {
        outcome = run_pipeline(&ctx, &event, &collaborators, opts, &reporter) => outcome,
        _ = tokio::signal::ctrl_c() => {
            reporter.cancel();
            warn!("run cancelled");
            eprintln!("cancelled");
            return Ok(ExitCode::from(EXIT_CANCELLED));
        }
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => return Ok(fail(&e)),
    };

    match &outcome {
        RunOutcome::Skipped { reason } => {
            println!("SKIP: {reason}");
        }
        RunOutcome::Finished(report) => print_report(report),
    }

    Ok(exit_code(outcome.exit_code()))
}

fn print_report(report: &RunReport) {
    println!();
    match &report.error {
        None if report.state == RunState::Deployed => println!("  Site published!"),
        None => println!("  Site built (not published)."),
        Some(_) => println!("  Run failed."),
    }
    println!("  Run:     {}", report.run.id);
    println!("  Trigger: {} ({})", report.run.trigger_kind, report.run.commit_ref);
    println!("  State:   {}", report.state);
    if let Some(dir) = &report.output_dir {
        println!("  Output:  {}", dir.display());
    }
    if let Some(deployment) = &report.deployment {
        println!("  URL:     {}", deployment.public_url);
    }
    println!(
        "  Caches:  {} restored, {} saved",
        report.cache_hits, report.caches_saved
    );
    println!("  Time:    {:.1}s", report.elapsed.as_secs_f64());
    println!();

    if let Some(err) = &report.error {
        eprintln!("error: {} step failed: {err}", err.step());
    }
}

fn cmd_trigger(
    workspace: &Path,
    config_path: Option<&Path>,
    event: Option<&str>,
) -> Result<ExitCode> {
    let config = load(workspace, config_path)?;
    let policy = TagPolicy::from_config(&config.trigger)?;

    let event = match parse_event(event) {
        Ok(event) => event,
        Err(e) => return Ok(fail(&e)),
    };

    match evaluate(&event, &policy) {
        TriggerDecision::Start(kind) => println!("START ({kind})"),
        TriggerDecision::Skip { reason } => println!("SKIP: {reason}"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_build(
    workspace: &Path,
    config_path: Option<&Path>,
    show_progress: bool,
) -> Result<ExitCode> {
    let config = load(workspace, config_path)?;
    let ctx = ExecutionContext::new(workspace, config);
    let generator = MdBook::new(ctx.runner.clone(), ctx.config.build.generator.clone());
    let reporter = CliProgress::new(show_progress);
    reporter.phase("Building documentation");

    let run_id = RunId::new();
    let result = tokio::select! {
        result = build_site(&ctx, &run_id, &generator) => result,
        _ = tokio::signal::ctrl_c() => {
            reporter.cancel();
            eprintln!("cancelled");
            return Ok(ExitCode::from(EXIT_CANCELLED));
        }
    };
    reporter.finish();

    match result {
        Ok(output) => {
            println!(
                "Built {} files into {}",
                output.file_count,
                output.output_dir.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => Ok(fail(&e)),
    }
}

fn cmd_cache_key(workspace: &Path, config_path: Option<&Path>) -> Result<ExitCode> {
    let config = load(workspace, config_path)?;
    let ctx = ExecutionContext::new(workspace, config);
    let buckets = resolve_buckets(&ctx.config.cache, &ctx.workspace);

    match derive_keys(&ctx.os, &ctx.lockfile(), &buckets)? {
        Some(keys) => {
            for (bucket, key) in keys {
                println!("{:<10} {key}  {}", bucket.name, bucket.path.display());
            }
        }
        None => println!(
            "No lock file at {}; caching is disabled.",
            ctx.lockfile().display()
        ),
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_cache_list(workspace: &Path, config_path: Option<&Path>) -> Result<ExitCode> {
    let config = load(workspace, config_path)?;
    let cache = LocalCache::from_config(&config.cache, workspace).await?;
    let entries = cache.entries().await?;

    if entries.is_empty() {
        println!("Cache at {} is empty.", cache.root().display());
        return Ok(ExitCode::SUCCESS);
    }

    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    for entry in &entries {
        println!(
            "{:>10}  {}  {}",
            format_size(entry.size_bytes),
            entry.last_used_at.format("%Y-%m-%d %H:%M"),
            entry.key
        );
    }
    println!();
    println!("  {} entries, {} total", entries.len(), format_size(total));
    Ok(ExitCode::SUCCESS)
}

async fn cmd_cache_prune(workspace: &Path, config_path: Option<&Path>) -> Result<ExitCode> {
    let config = load(workspace, config_path)?;
    let cache = LocalCache::from_config(&config.cache, workspace).await?;
    let report = cache.prune().await?;

    for key in &report.removed {
        println!("removed {key}");
    }
    println!(
        "Pruned {} entries, freed {}.",
        report.removed.len(),
        format_size(report.freed_bytes)
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_config_init(workspace: &Path, user: bool, force: bool) -> Result<ExitCode> {
    let path = if user {
        config_file_path()?
    } else {
        workspace.join(CONFIG_FILE_NAME)
    };

    if path.exists() && !force {
        return Err(eyre!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }

    let written = init_config(&path)?;
    println!("Wrote default config to {}", written.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_config_show(workspace: &Path, config_path: Option<&Path>) -> Result<ExitCode> {
    let config = load(workspace, config_path)?;
    let rendered =
        toml::to_string_pretty(&config).map_err(|e| eyre!("cannot render config: {e}"))?;
    print!("{rendered}");
    Ok(ExitCode::SUCCESS)
}

fn cmd_preflight(workspace: &Path, config_path: Option<&Path>) -> Result<ExitCode> {
    let config = load(workspace, config_path)?;
    validate_publish_env(&config)?;
    let endpoint = config.publish.resolve_endpoint()?;
    println!("Publish credentials found; deploying to {endpoint}");
    Ok(ExitCode::SUCCESS)
}

fn format_size(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    if bytes >= 1024 * 1024 {
        format!("{:.1} MiB", bytes as f64 / MIB)
    } else {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new(visible: bool) -> Self {
        if !visible {
            return Self {
                spinner: ProgressBar::hidden(),
            };
        }

        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }

    fn cancel(&self) {
        self.spinner.abandon_with_message("cancelled");
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn state_changed(&self, state: RunState) {
        self.spinner.println(format!("  → {state}"));
    }

    fn done(&self, _report: &RunReport) {
        self.finish();
    }
}
