//! Shared types, error model, and configuration for bookship.
//!
//! This crate is the foundation depended on by all other bookship crates.
//! It provides:
//! - [`BookshipError`]: the unified error type
//! - Domain types ([`PipelineRun`], [`RunState`], [`CacheKey`], [`DeploymentResult`])
//! - Configuration ([`AppConfig`] and its sections, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BuildConfig, CONFIG_FILE_NAME, CacheBucketConfig, CacheConfig, PublishConfig,
    RetryConfig, TimeoutConfig, ToolConfig, ToolchainConfig, TriggerConfig, config_dir,
    config_file_path, default_cache_root, expand_path, init_config, load_config,
    load_config_from, validate_publish_env,
};
pub use error::{BookshipError, EXIT_FAILURE, EXIT_INVALID_EVENT, Result, RunStep};
pub use types::{
    CacheKey, DeploymentResult, PipelineRun, RunId, RunState, TriggerKind, runner_os,
};
