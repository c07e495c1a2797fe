//! Environment provisioning: toolchain and auxiliary tools.
//!
//! Both installers are idempotent. The toolchain is installed only when
//! `rustup toolchain list` does not show it; tools are installed only when
//! `cargo install --list` does not show the required version.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use bookship_shared::{BookshipError, Result, ToolConfig, ToolchainConfig};

use crate::process::{CommandOutput, CommandRunner, CommandSpec};

/// Ensures the requested toolchain is installed and active.
#[async_trait]
pub trait ToolchainInstaller: Send + Sync {
    async fn ensure_toolchain(&self, spec: &ToolchainConfig) -> Result<()>;
}

/// What happened to a single auxiliary tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStatus {
    AlreadyInstalled { version: String },
    Installed,
}

/// Ensures a named tool is installed at the required version.
#[async_trait]
pub trait ToolInstaller: Send + Sync {
    async fn ensure_tool(&self, tool: &ToolConfig) -> Result<ToolStatus>;
}

// ---------------------------------------------------------------------------
// rustup
// ---------------------------------------------------------------------------

/// Installs toolchains with `rustup`.
pub struct RustupInstaller {
    runner: Arc<dyn CommandRunner>,
}

impl RustupInstaller {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn rustup(&self, args: &[&str]) -> Result<CommandOutput> {
        let spec = CommandSpec::new("rustup").args(args.iter().copied());
        run_checked(self.runner.as_ref(), &spec, "rustup").await
    }
}

#[async_trait]
impl ToolchainInstaller for RustupInstaller {
    #[instrument(skip_all, fields(toolchain = %spec.name, channel = %spec.channel))]
    async fn ensure_toolchain(&self, spec: &ToolchainConfig) -> Result<()> {
        if spec.name != "rust" {
            return Err(BookshipError::provisioning(
                &spec.name,
                "only the rust toolchain can be provisioned with rustup",
            ));
        }

        let listed = self.rustup(&["toolchain", "list"]).await?;
        if toolchain_listed(&listed.stdout, &spec.channel) {
            debug!("toolchain already installed");
        } else {
            info!(profile = %spec.profile, "installing toolchain");
            self.rustup(&[
                "toolchain",
                "install",
                &spec.channel,
                "--profile",
                &spec.profile,
            ])
            .await?;
        }

        self.rustup(&["default", &spec.channel]).await?;
        info!("toolchain ready");
        Ok(())
    }
}

/// `rustup toolchain list` prints `stable-x86_64-unknown-linux-gnu (default)`.
fn toolchain_listed(stdout: &str, channel: &str) -> bool {
    let prefix = format!("{channel}-");
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| name == channel || name.starts_with(&prefix))
}

// ---------------------------------------------------------------------------
// cargo install
// ---------------------------------------------------------------------------

/// Installs tools with `cargo install`.
pub struct CargoToolInstaller {
    runner: Arc<dyn CommandRunner>,
}

impl CargoToolInstaller {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn installed(&self, tool: &str) -> Result<HashMap<String, String>> {
        let spec = CommandSpec::new("cargo").args(["install", "--list"]);
        let output = run_checked(self.runner.as_ref(), &spec, tool).await?;
        Ok(parse_install_list(&output.stdout))
    }
}

#[async_trait]
impl ToolInstaller for CargoToolInstaller {
    #[instrument(skip_all, fields(tool = %tool.name, version = tool.version.as_deref().unwrap_or("any")))]
    async fn ensure_tool(&self, tool: &ToolConfig) -> Result<ToolStatus> {
        let wanted = tool.version.as_deref().map(normalize_version);

        if let Some(current) = self.installed(&tool.name).await?.remove(&tool.name) {
            if wanted.is_none_or(|v| v == current) {
                debug!(%current, "tool already installed");
                return Ok(ToolStatus::AlreadyInstalled { version: current });
            }
            info!(%current, "installed version differs, reinstalling");
        }

        let mut spec = CommandSpec::new("cargo").args(["install", tool.name.as_str()]);
        if let Some(version) = wanted {
            spec = spec.args(["--version", version]);
        }
        spec = spec.arg("--locked");

        run_checked(self.runner.as_ref(), &spec, &tool.name).await?;
        info!("tool installed");
        Ok(ToolStatus::Installed)
    }
}

/// Parse `cargo install --list` into `name -> version`.
///
/// Package lines look like `mdbook v0.4.40:` or
/// `mdbook-mermaid v0.14.0 (https://...):`; the indented lines below them
/// list binaries and are ignored.
fn parse_install_list(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let version = parts.next()?.trim_end_matches(':');
            Some((name.to_string(), normalize_version(version).to_string()))
        })
        .collect()
}

fn normalize_version(raw: &str) -> &str {
    raw.trim_start_matches(['v', '='])
}

/// Run a command and map spawn failures and non-zero exits to
/// provisioning errors carrying the tool's exit code.
async fn run_checked(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    tool: &str,
) -> Result<CommandOutput> {
    let output = runner.run(spec).await.map_err(|e| {
        BookshipError::provisioning(tool, format!("failed to run `{spec}`: {e}"))
    })?;

    if !output.success() {
        return Err(BookshipError::provisioning(
            tool,
            format!("`{spec}` {}\n{}", output.describe_exit(), output.stderr_tail()),
        )
        .with_exit_code(output.exit_code));
    }
    Ok(output)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned outputs keyed by the command line and records calls.
    #[derive(Default)]
    pub(crate) struct ScriptedRunner {
        responses: Mutex<HashMap<String, CommandOutput>>,
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub(crate) fn respond(&self, command: &str, exit_code: i32, stdout: &str) {
            self.responses.lock().unwrap().insert(
                command.to_string(),
                CommandOutput {
                    exit_code: Some(exit_code),
                    stdout: stdout.to_string(),
                    stderr: if exit_code == 0 {
                        String::new()
                    } else {
                        "error: network unreachable".into()
                    },
                },
            );
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
            let line = spec.to_string();
            self.calls.lock().unwrap().push(line.clone());
            Ok(self
                .responses
                .lock()
                .unwrap()
                .get(&line)
                .cloned()
                .unwrap_or(CommandOutput {
                    exit_code: Some(0),
                    ..CommandOutput::default()
                }))
        }
    }

    const INSTALL_LIST: &str = "\
mdbook v0.4.40:
    mdbook
mdbook-mermaid v0.14.0 (https://github.com/badboy/mdbook-mermaid#abc):
    mdbook-mermaid
";

    #[test]
    fn parses_install_list() {
        let installed = parse_install_list(INSTALL_LIST);
        assert_eq!(installed.get("mdbook").map(String::as_str), Some("0.4.40"));
        assert_eq!(
            installed.get("mdbook-mermaid").map(String::as_str),
            Some("0.14.0")
        );
        assert_eq!(installed.len(), 2);
    }

    #[test]
    fn toolchain_listing() {
        let list = "stable-x86_64-unknown-linux-gnu (default)\nnightly-x86_64-unknown-linux-gnu\n";
        assert!(toolchain_listed(list, "stable"));
        assert!(toolchain_listed(list, "nightly"));
        assert!(!toolchain_listed(list, "beta"));
        assert!(!toolchain_listed(list, "1.85.0"));
    }

    #[tokio::test]
    async fn installs_missing_toolchain_then_selects_it() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("rustup toolchain list", 0, "nightly-x86_64-unknown-linux-gnu\n");

        RustupInstaller::new(runner.clone())
            .ensure_toolchain(&ToolchainConfig::default())
            .await
            .unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "rustup toolchain list",
                "rustup toolchain install stable --profile minimal",
                "rustup default stable",
            ]
        );
    }

    #[tokio::test]
    async fn installed_toolchain_is_not_reinstalled() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond(
            "rustup toolchain list",
            0,
            "stable-x86_64-unknown-linux-gnu (default)\n",
        );

        RustupInstaller::new(runner.clone())
            .ensure_toolchain(&ToolchainConfig::default())
            .await
            .unwrap();

        assert_eq!(
            runner.calls(),
            vec!["rustup toolchain list", "rustup default stable"]
        );
    }

    #[tokio::test]
    async fn toolchain_install_failure_keeps_exit_code() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("rustup toolchain list", 0, "");
        runner.respond("rustup toolchain install stable --profile minimal", 1, "");

        let err = RustupInstaller::new(runner)
            .ensure_toolchain(&ToolchainConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, BookshipError::Provisioning { .. }));
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("network unreachable"));
    }

    #[tokio::test]
    async fn tool_already_present_is_skipped() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("cargo install --list", 0, INSTALL_LIST);

        let status = CargoToolInstaller::new(runner.clone())
            .ensure_tool(&ToolConfig {
                name: "mdbook".into(),
                version: Some("v0.4.40".into()),
            })
            .await
            .unwrap();

        assert_eq!(
            status,
            ToolStatus::AlreadyInstalled {
                version: "0.4.40".into()
            }
        );
        assert_eq!(runner.calls(), vec!["cargo install --list"]);
    }

    #[tokio::test]
    async fn version_mismatch_reinstalls_pinned_version() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("cargo install --list", 0, INSTALL_LIST);

        let status = CargoToolInstaller::new(runner.clone())
            .ensure_tool(&ToolConfig {
                name: "mdbook".into(),
                version: Some("0.4.52".into()),
            })
            .await
            .unwrap();

        assert_eq!(status, ToolStatus::Installed);
        assert_eq!(
            runner.calls().last().map(String::as_str),
            Some("cargo install mdbook --version 0.4.52 --locked")
        );
    }

    #[tokio::test]
    async fn tool_install_failure_is_provisioning_error() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("cargo install --list", 0, "");
        runner.respond("cargo install mdbook-toc --locked", 101, "");

        let err = CargoToolInstaller::new(runner)
            .ensure_tool(&ToolConfig {
                name: "mdbook-toc".into(),
                version: None,
            })
            .await
            .unwrap_err();

        match &err {
            BookshipError::Provisioning {
                tool, exit_code, ..
            } => {
                assert_eq!(tool, "mdbook-toc");
                assert_eq!(*exit_code, Some(101));
            }
            other => panic!("expected provisioning error, got {other:?}"),
        }
    }
}
