//! Trigger evaluation: should this event start a run?
//!
//! A run starts for a push of a tag matching the configured patterns, or for
//! a manual dispatch. Everything else is skipped. Evaluation has no side
//! effects; only parsing the event descriptor can fail.

use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use bookship_shared::{BookshipError, Result, TriggerConfig, TriggerKind};

const TAG_REF_PREFIX: &str = "refs/tags/";

// ---------------------------------------------------------------------------
// Event descriptor
// ---------------------------------------------------------------------------

/// Event types that can reach the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Push,
    WorkflowDispatch,
}

/// A parsed event descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub kind: EventKind,
    /// Full (`refs/tags/v1.0.0`) or short (`v1.0.0`) ref. May be empty for
    /// manual dispatch.
    pub git_ref: String,
    pub sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type", alias = "event")]
    event_type: Option<String>,
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    #[serde(default)]
    sha: Option<String>,
}

impl TriggerEvent {
    pub fn push(git_ref: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Push,
            git_ref: git_ref.into(),
            sha: None,
        }
    }

    pub fn manual(git_ref: impl Into<String>) -> Self {
        Self {
            kind: EventKind::WorkflowDispatch,
            git_ref: git_ref.into(),
            sha: None,
        }
    }

    /// Parse `{"type": "push" | "workflow_dispatch", "ref": "..."}`.
    pub fn parse_json(json: &str) -> Result<Self> {
        let raw: RawEvent = serde_json::from_str(json)
            .map_err(|e| BookshipError::invalid_event(format!("malformed event JSON: {e}")))?;
        Self::from_parts(raw.event_type.as_deref(), raw.git_ref.as_deref(), raw.sha)
    }

    /// Parse a CLI argument: inline JSON, or `@path` to a JSON file.
    pub fn from_arg(arg: &str) -> Result<Self> {
        match arg.strip_prefix('@') {
            Some(path) => Self::from_file(Path::new(path)),
            None => Self::parse_json(arg),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BookshipError::invalid_event(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse_json(&content)
    }

    /// Read the event from the CI environment (`GITHUB_EVENT_NAME`,
    /// `GITHUB_REF`, `GITHUB_SHA`).
    pub fn from_env() -> Result<Self> {
        let name = std::env::var("GITHUB_EVENT_NAME").ok();
        let git_ref = std::env::var("GITHUB_REF").ok();
        let sha = std::env::var("GITHUB_SHA").ok().filter(|s| !s.is_empty());
        if name.is_none() {
            return Err(BookshipError::invalid_event(
                "no event given and GITHUB_EVENT_NAME is not set",
            ));
        }
        Self::from_parts(name.as_deref(), git_ref.as_deref(), sha)
    }

    fn from_parts(
        event_type: Option<&str>,
        git_ref: Option<&str>,
        sha: Option<String>,
    ) -> Result<Self> {
        let event_type = event_type
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BookshipError::invalid_event("missing event type"))?;
        let git_ref = git_ref.map(str::trim).unwrap_or("").to_string();

        let kind = match event_type {
            "push" => EventKind::Push,
            "workflow_dispatch" => EventKind::WorkflowDispatch,
            other => {
                return Err(BookshipError::invalid_event(format!(
                    "unsupported event type '{other}' (expected push or workflow_dispatch)"
                )));
            }
        };

        if kind == EventKind::Push && git_ref.is_empty() {
            return Err(BookshipError::invalid_event("push event without a ref"));
        }

        Ok(Self { kind, git_ref, sha })
    }

    /// Tag name carried by this event, if its ref names a tag.
    ///
    /// `refs/tags/X` yields `X`; any other `refs/...` ref is not a tag;
    /// short refs are taken as-is.
    pub fn tag_name(&self) -> Option<&str> {
        if let Some(tag) = self.git_ref.strip_prefix(TAG_REF_PREFIX) {
            return Some(tag);
        }
        if self.git_ref.starts_with("refs/") || self.git_ref.is_empty() {
            return None;
        }
        Some(&self.git_ref)
    }
}

// ---------------------------------------------------------------------------
// Tag policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TagPattern {
    source: String,
    negated: bool,
    regex: Regex,
}

/// Which tags and events start a run.
#[derive(Debug, Clone)]
pub struct TagPolicy {
    patterns: Vec<TagPattern>,
    allow_manual: bool,
}

impl TagPolicy {
    pub fn new(patterns: &[String], allow_manual: bool) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patterns,
            allow_manual,
        })
    }

    pub fn from_config(config: &TriggerConfig) -> Result<Self> {
        Self::new(&config.tag_patterns, config.allow_manual)
    }

    /// Evaluate patterns in order; the last one that matches decides.
    pub fn matches(&self, tag: &str) -> bool {
        let mut included = false;
        for pattern in &self.patterns {
            if pattern.regex.is_match(tag) {
                debug!(pattern = %pattern.source, tag, "tag pattern matched");
                included = !pattern.negated;
            }
        }
        included
    }
}

/// Translate a filter pattern into an anchored regex.
///
/// `*` matches within one path segment, `**` across segments, `?` and `+`
/// quantify the preceding character, `[...]` is passed through as a class,
/// `\` escapes, and a leading `!` negates the whole pattern.
fn compile_pattern(raw: &str) -> Result<TagPattern> {
    let (negated, body) = match raw.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    if body.is_empty() {
        return Err(BookshipError::config(format!("empty tag pattern '{raw}'")));
    }

    let mut regex = String::from("^");
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' | '+' => regex.push(c),
            '[' => {
                regex.push('[');
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' || inner == '[' {
                        regex.push('\\');
                    }
                    regex.push(inner);
                }
                if !closed {
                    return Err(BookshipError::config(format!(
                        "unterminated character class in tag pattern '{raw}'"
                    )));
                }
                regex.push(']');
            }
            '\\' => match chars.next() {
                Some(escaped) => regex.push_str(&regex::escape(&escaped.to_string())),
                None => regex.push_str(r"\\"),
            },
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');

    let compiled = Regex::new(&regex).map_err(|e| {
        BookshipError::config(format!("invalid tag pattern '{raw}': {e}"))
    })?;

    Ok(TagPattern {
        source: raw.to_string(),
        negated,
        regex: compiled,
    })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Result of evaluating an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    Start(TriggerKind),
    Skip { reason: String },
}

impl TriggerDecision {
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start(_))
    }
}

/// Decide whether `event` starts a run.
pub fn evaluate(event: &TriggerEvent, policy: &TagPolicy) -> TriggerDecision {
    match event.kind {
        EventKind::WorkflowDispatch if policy.allow_manual => {
            TriggerDecision::Start(TriggerKind::Manual)
        }
        EventKind::WorkflowDispatch => TriggerDecision::Skip {
            reason: "manual dispatch is disabled".into(),
        },
        EventKind::Push => match event.tag_name() {
            None => TriggerDecision::Skip {
                reason: format!("ref '{}' is not a tag", event.git_ref),
            },
            Some(tag) if policy.matches(tag) => TriggerDecision::Start(TriggerKind::TagPush),
            Some(tag) => TriggerDecision::Skip {
                reason: format!("tag '{tag}' does not match any release pattern"),
            },
        },
    }
}
