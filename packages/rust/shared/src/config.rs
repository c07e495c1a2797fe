//! Application configuration for bookship.
//!
//! Project config lives at `./bookship.toml`; a user-wide fallback lives at
//! `~/.bookship/bookship.toml`. CLI flags override config file values,
//! which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BookshipError, Result};

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "bookship.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".bookship";

// ---------------------------------------------------------------------------
// Config structs (matching bookship.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub trigger: TriggerConfig,

    #[serde(default)]
    pub toolchain: ToolchainConfig,

    /// Auxiliary tools installed after the toolchain.
    #[serde(default = "default_tools")]
    pub tools: Vec<ToolConfig>,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub publish: PublishConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            trigger: TriggerConfig::default(),
            toolchain: ToolchainConfig::default(),
            tools: default_tools(),
            build: BuildConfig::default(),
            cache: CacheConfig::default(),
            publish: PublishConfig::default(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

fn default_tools() -> Vec<ToolConfig> {
    vec![ToolConfig {
        name: "mdbook".into(),
        version: None,
    }]
}

fn default_true() -> bool {
    true
}

/// `[trigger]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Tag filter patterns; the last matching pattern wins, `!` negates.
    #[serde(default = "default_tag_patterns")]
    pub tag_patterns: Vec<String>,

    /// Whether `workflow_dispatch` events start a run.
    #[serde(default = "default_true")]
    pub allow_manual: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            tag_patterns: default_tag_patterns(),
            allow_manual: true,
        }
    }
}

fn default_tag_patterns() -> Vec<String> {
    vec!["v*".into()]
}

/// `[toolchain]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    #[serde(default = "default_toolchain_name")]
    pub name: String,

    /// Channel or pinned version (`stable`, `nightly`, `1.85.0`).
    #[serde(default = "default_channel")]
    pub channel: String,

    /// rustup installation profile.
    #[serde(default = "default_profile")]
    pub profile: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            name: default_toolchain_name(),
            channel: default_channel(),
            profile: default_profile(),
        }
    }
}

fn default_toolchain_name() -> String {
    "rust".into()
}
fn default_channel() -> String {
    "stable".into()
}
fn default_profile() -> String {
    "minimal".into()
}

/// `[[tools]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    /// Required version; any installed version satisfies `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// `[build]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Book source directory, relative to the workspace.
    #[serde(default = "default_source_dir")]
    pub source_dir: String,

    /// Generated site directory, relative to the workspace.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Generator executable.
    #[serde(default = "default_generator")]
    pub generator: String,

    /// Marker file that disables the host's own preprocessing.
    #[serde(default = "default_marker_file")]
    pub marker_file: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            output_dir: default_output_dir(),
            generator: default_generator(),
            marker_file: default_marker_file(),
        }
    }
}

fn default_source_dir() -> String {
    "docs".into()
}
fn default_output_dir() -> String {
    "docs/book".into()
}
fn default_generator() -> String {
    "mdbook".into()
}
fn default_marker_file() -> String {
    ".nojekyll".into()
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache root; defaults to the platform cache dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,

    /// Lock file whose contents key every bucket.
    #[serde(default = "default_lockfile")]
    pub lockfile: String,

    /// Entries older than this are evicted.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    /// Total archive size budget; LRU entries are evicted above it.
    #[serde(default = "default_max_total_mb")]
    pub max_total_mb: u64,

    #[serde(default = "default_buckets")]
    pub buckets: Vec<CacheBucketConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: None,
            lockfile: default_lockfile(),
            max_age_days: default_max_age_days(),
            max_total_mb: default_max_total_mb(),
            buckets: default_buckets(),
        }
    }
}

fn default_lockfile() -> String {
    "Cargo.lock".into()
}
fn default_max_age_days() -> u32 {
    7
}
fn default_max_total_mb() -> u64 {
    10 * 1024
}
fn default_buckets() -> Vec<CacheBucketConfig> {
    vec![
        CacheBucketConfig {
            name: "registry".into(),
            path: "~/.cargo/registry/cache".into(),
        },
        CacheBucketConfig {
            name: "index".into(),
            path: "~/.cargo/registry/index".into(),
        },
        CacheBucketConfig {
            name: "target".into(),
            path: "target".into(),
        },
    ]
}

/// `[[cache.buckets]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBucketConfig {
    pub name: String,
    /// `~` expands to the home directory; relative paths resolve against the workspace.
    pub path: String,
}

/// `[publish]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Deployment API base URL. Derived from `GITHUB_API_URL` and
    /// `GITHUB_REPOSITORY` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default = "default_artifact_name")]
    pub artifact_name: String,

    /// Name of the env var holding the API token (never store the token itself).
    #[serde(default = "default_api_token_env")]
    pub api_token_env: String,

    /// Env var holding a pre-minted identity token.
    #[serde(default = "default_oidc_token_env")]
    pub oidc_token_env: String,

    /// Env vars used to mint an identity token from the CI runner.
    #[serde(default = "default_oidc_request_url_env")]
    pub oidc_request_url_env: String,
    #[serde(default = "default_oidc_request_token_env")]
    pub oidc_request_token_env: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_audience: Option<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on waiting for the deployment to go live.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            artifact_name: default_artifact_name(),
            api_token_env: default_api_token_env(),
            oidc_token_env: default_oidc_token_env(),
            oidc_request_url_env: default_oidc_request_url_env(),
            oidc_request_token_env: default_oidc_request_token_env(),
            oidc_audience: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

fn default_artifact_name() -> String {
    "github-pages".into()
}
fn default_api_token_env() -> String {
    "GITHUB_TOKEN".into()
}
fn default_oidc_token_env() -> String {
    "BOOKSHIP_OIDC_TOKEN".into()
}
fn default_oidc_request_url_env() -> String {
    "ACTIONS_ID_TOKEN_REQUEST_URL".into()
}
fn default_oidc_request_token_env() -> String {
    "ACTIONS_ID_TOKEN_REQUEST_TOKEN".into()
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_max_wait_secs() -> u64 {
    600
}

impl PublishConfig {
    /// Resolve the deployment endpoint from config or the CI environment.
    pub fn resolve_endpoint(&self) -> Result<String> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.trim_end_matches('/').to_string());
        }

        let api = std::env::var("GITHUB_API_URL").unwrap_or_else(|_| "https://api.github.com".into());
        match std::env::var("GITHUB_REPOSITORY") {
            Ok(repo) if !repo.is_empty() => Ok(format!(
                "{}/repos/{repo}/pages",
                api.trim_end_matches('/')
            )),
            _ => Err(BookshipError::config(
                "no publish endpoint configured. Set [publish].endpoint or GITHUB_REPOSITORY",
            )),
        }
    }
}

/// `[retry]` section. The default of one attempt means no retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}

/// `[timeouts]` section, per pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_provision_secs")]
    pub provision_secs: u64,
    #[serde(default = "default_build_secs")]
    pub build_secs: u64,
    #[serde(default = "default_publish_secs")]
    pub publish_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            provision_secs: default_provision_secs(),
            build_secs: default_build_secs(),
            publish_secs: default_publish_secs(),
        }
    }
}

fn default_provision_secs() -> u64 {
    1_800
}
fn default_build_secs() -> u64 {
    900
}
fn default_publish_secs() -> u64 {
    900
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Expand `~` and resolve relative paths against `base`.
pub fn expand_path(raw: &str, base: &Path) -> PathBuf {
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Default cache root (`<platform cache dir>/bookship`).
pub fn default_cache_root() -> Result<PathBuf> {
    let base = dirs::cache_dir()
        .ok_or_else(|| BookshipError::config("could not determine cache directory"))?;
    Ok(base.join("bookship"))
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the user config directory (`~/.bookship/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| BookshipError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the user config file (`~/.bookship/bookship.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the config for a workspace.
///
/// An explicit path must exist. Otherwise `<workspace>/bookship.toml` is
/// tried, then the user config, then defaults.
pub fn load_config(explicit: Option<&Path>, workspace: &Path) -> Result<AppConfig> {
    if let Some(path) = explicit {
        return load_config_from(path);
    }

    let project = workspace.join(CONFIG_FILE_NAME);
    if project.exists() {
        return load_config_from(&project);
    }

    let user = config_file_path()?;
    if user.exists() {
        return load_config_from(&user);
    }

    tracing::debug!(workspace = %workspace.display(), "no config file found, using defaults");
    Ok(AppConfig::default())
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| BookshipError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        BookshipError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Write a default config file to `path`, creating parent directories.
pub fn init_config(path: &Path) -> Result<PathBuf> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).map_err(|e| BookshipError::io(dir, e))?;
        }
    }

    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| BookshipError::config(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| BookshipError::io(path, e))?;
    tracing::info!(path = %path.display(), "created default config file");

    Ok(path.to_path_buf())
}

/// Check that the credentials needed to publish are present.
///
/// Requires the API token and either a pre-minted identity token or the
/// runner's token request pair.
pub fn validate_publish_env(config: &AppConfig) -> Result<()> {
    let publish = &config.publish;
    publish.resolve_endpoint()?;

    if !env_is_set(&publish.api_token_env) {
        return Err(BookshipError::config(format!(
            "API token not found. Set the {} environment variable.",
            publish.api_token_env
        )));
    }

    let can_mint =
        env_is_set(&publish.oidc_request_url_env) && env_is_set(&publish.oidc_request_token_env);
    if !can_mint && !env_is_set(&publish.oidc_token_env) {
        return Err(BookshipError::config(format!(
            "no deployment identity token available. Set {} or grant the job \
             id-token: write so {} and {} are exported.",
            publish.oidc_token_env, publish.oidc_request_url_env, publish.oidc_request_token_env
        )));
    }

    Ok(())
}

fn env_is_set(name: &str) -> bool {
    matches!(std::env::var(name), Ok(val) if !val.is_empty())
}
