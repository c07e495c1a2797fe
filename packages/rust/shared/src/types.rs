//! Core domain types for bookship runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::error::{BookshipError, Result};

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Short form used in directory names and log lines.
    ///
    /// Taken from the random tail; the leading bits are a millisecond timestamp.
    pub fn short(&self) -> String {
        let simple = self.0.simple().to_string();
        simple[simple.len() - 12..].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// PipelineRun
// ---------------------------------------------------------------------------

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    TagPush,
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TagPush => f.write_str("tag-push"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// A single pipeline run. Lives for the duration of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub trigger_kind: TriggerKind,
    /// Ref that triggered the run (tag name for tag pushes).
    pub commit_ref: String,
    /// Commit SHA, when the event carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(trigger_kind: TriggerKind, commit_ref: impl Into<String>) -> Self {
        Self {
            id: RunId::new(),
            trigger_kind,
            commit_ref: commit_ref.into(),
            commit_sha: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_sha(mut self, sha: Option<String>) -> Self {
        self.commit_sha = sha;
        self
    }

    /// Version label handed to the hosting service.
    pub fn build_version(&self) -> String {
        match &self.commit_sha {
            Some(sha) => sha.clone(),
            None if !self.commit_ref.is_empty() => self.commit_ref.clone(),
            None => self.id.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Lifecycle of a run.
///
/// `Pending -> Provisioned -> Built -> Deployed`, or `Failed` from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Provisioned,
    Built,
    Deployed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deployed | Self::Failed)
    }

    /// Move to `next`, rejecting anything the lifecycle does not allow.
    pub fn transition(self, next: RunState) -> Result<RunState> {
        let allowed = match (self, next) {
            (Self::Pending, Self::Provisioned)
            | (Self::Provisioned, Self::Built)
            | (Self::Built, Self::Deployed) => true,
            (from, Self::Failed) => !from.is_terminal(),
            _ => false,
        };

        if allowed {
            Ok(next)
        } else {
            Err(BookshipError::validation(format!(
                "illegal run state transition {self} -> {next}"
            )))
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Provisioned => "PROVISIONED",
            Self::Built => "BUILT",
            Self::Deployed => "DEPLOYED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Address of one cache bucket: `{os}-{bucket}-{lockfile_hash}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub os: String,
    pub bucket: String,
    pub lockfile_hash: String,
}

impl CacheKey {
    /// Derive a key from the lock file contents. Pure and deterministic.
    pub fn derive(os: &str, bucket: &str, lockfile: &[u8]) -> Self {
        Self {
            os: os.to_string(),
            bucket: bucket.to_string(),
            lockfile_hash: format!("{:x}", Sha256::digest(lockfile)),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.os, self.bucket, self.lockfile_hash)
    }
}

/// Runner OS label used in cache keys (`Linux`, `macOS`, `Windows`).
///
/// `RUNNER_OS` wins when set so keys line up with the CI's own labels.
pub fn runner_os() -> String {
    if let Ok(os) = std::env::var("RUNNER_OS") {
        if !os.is_empty() {
            return os;
        }
    }
    match std::env::consts::OS {
        "linux" => "Linux".into(),
        "macos" => "macOS".into(),
        "windows" => "Windows".into(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// DeploymentResult
// ---------------------------------------------------------------------------

/// Terminal output of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub public_url: Url,
    pub deployment_id: String,
}

impl DeploymentResult {
    /// Build a result, rejecting URLs that are not absolute http(s).
    pub fn new(public_url: &str, deployment_id: impl Into<String>) -> Result<Self> {
        let url = Url::parse(public_url).map_err(|e| {
            BookshipError::deployment_rejected(format!("invalid public URL '{public_url}': {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(BookshipError::deployment_rejected(format!(
                "public URL '{public_url}' is not an http(s) URL"
            )));
        }
        Ok(Self {
            public_url: url,
            deployment_id: deployment_id.into(),
        })
    }
}
