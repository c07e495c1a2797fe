//! Error types for bookship.
//!
//! Library crates use [`BookshipError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::fmt;
use std::path::PathBuf;

/// Exit code reported for malformed trigger events.
pub const EXIT_INVALID_EVENT: i32 = 2;

/// Exit code reported for fatal failures without a tool exit code.
pub const EXIT_FAILURE: i32 = 1;

/// Pipeline step a fatal error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStep {
    Trigger,
    Provision,
    Build,
    Publish,
    Cache,
    Setup,
}

impl fmt::Display for RunStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trigger => "trigger",
            Self::Provision => "provision",
            Self::Build => "build",
            Self::Publish => "publish",
            Self::Cache => "cache",
            Self::Setup => "setup",
        };
        f.write_str(name)
    }
}

/// Top-level error type for all bookship operations.
#[derive(Debug, thiserror::Error)]
pub enum BookshipError {
    /// The incoming event descriptor could not be interpreted.
    #[error("invalid event: {message}")]
    InvalidEvent { message: String },

    /// Toolchain or auxiliary tool installation failed.
    #[error("provisioning failed for {tool}: {message}")]
    Provisioning {
        tool: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// The documentation generator failed or produced nothing.
    #[error("build failed: {message}")]
    Build {
        message: String,
        exit_code: Option<i32>,
    },

    /// The output directory could not be packaged into an artifact.
    #[error("packaging failed: {message}")]
    Packaging { message: String },

    /// The hosting service rejected or failed the deployment.
    #[error("deployment failed: {message}")]
    Deployment {
        message: String,
        status: Option<u16>,
        /// Without an HTTP status, whether the failure may clear on its own
        /// (transport errors) or not (missing credentials, a failed build
        /// on the hosting side).
        transient: bool,
    },

    /// Cache archive or lock error.
    #[error("cache error: {0}")]
    Cache(String),

    /// Cache index database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BookshipError>;

impl BookshipError {
    pub fn invalid_event(msg: impl Into<String>) -> Self {
        Self::InvalidEvent {
            message: msg.into(),
        }
    }

    pub fn provisioning(tool: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioning {
            tool: tool.into(),
            message: msg.into(),
            exit_code: None,
        }
    }

    pub fn build(msg: impl Into<String>) -> Self {
        Self::Build {
            message: msg.into(),
            exit_code: None,
        }
    }

    pub fn packaging(msg: impl Into<String>) -> Self {
        Self::Packaging {
            message: msg.into(),
        }
    }

    /// Deployment failure that may succeed on retry (network, timeouts).
    pub fn deployment(msg: impl Into<String>) -> Self {
        Self::Deployment {
            message: msg.into(),
            status: None,
            transient: true,
        }
    }

    /// Deployment failure that a retry cannot fix.
    pub fn deployment_rejected(msg: impl Into<String>) -> Self {
        Self::Deployment {
            message: msg.into(),
            status: None,
            transient: false,
        }
    }

    /// The hosting API answered with a non-success HTTP status.
    pub fn deployment_status(msg: impl Into<String>, status: u16) -> Self {
        Self::Deployment {
            message: msg.into(),
            status: Some(status),
            transient: false,
        }
    }

    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attach the exit code of the external tool that caused this error.
    ///
    /// Only provisioning and build errors carry one; other variants are
    /// returned unchanged.
    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        match &mut self {
            Self::Provisioning { exit_code, .. } | Self::Build { exit_code, .. } => {
                *exit_code = code;
            }
            _ => {}
        }
        self
    }

    /// The pipeline step this error belongs to.
    pub fn step(&self) -> RunStep {
        match self {
            Self::InvalidEvent { .. } => RunStep::Trigger,
            Self::Provisioning { .. } => RunStep::Provision,
            Self::Build { .. } => RunStep::Build,
            Self::Packaging { .. } | Self::Deployment { .. } => RunStep::Publish,
            Self::Cache(_) | Self::Storage(_) => RunStep::Cache,
            Self::Config { .. } | Self::Io { .. } | Self::Validation { .. } => RunStep::Setup,
        }
    }

    /// Process exit code for this error.
    ///
    /// The external tool's own exit code wins when it is known and non-zero.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidEvent { .. } => EXIT_INVALID_EVENT,
            Self::Provisioning {
                exit_code: Some(code),
                ..
            }
            | Self::Build {
                exit_code: Some(code),
                ..
            } if *code != 0 => *code,
            _ => EXIT_FAILURE,
        }
    }

    /// Whether a retry could plausibly succeed.
    ///
    /// Provisioning hits the network. Deployments are retried on transport
    /// errors and on 408, 429 and 5xx responses only.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provisioning { .. } => true,
            Self::Deployment {
                status, transient, ..
            } => match status {
                Some(code) => *code == 408 || *code == 429 || *code >= 500,
                None => *transient,
            },
            _ => false,
        }
    }
}
