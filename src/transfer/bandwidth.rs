//! Bandwidth-aware transfer execution
//!
//! Shaping is best effort. In order of preference:
//! 1. the transfer tool's own rate flag (`rsync`, `curl`, `wget`)
//! 2. piping the tool's output through `pv`
//! 3. running unshaped with a capability warning

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::{CommandRunner, CommandSpec, Invocation, RunOutput};
use crate::error::{MirrorError, Result};

/// Helper binary used for pipe-through shaping
pub const SHAPING_HELPER: &str = "pv";

/// How a transfer is throttled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapingStrategy {
    /// No limit configured
    Unlimited,
    /// Tool-native rate flag appended
    NativeFlag,
    /// Output piped through the shaping helper
    PipeThrough,
    /// Limit configured but nothing can enforce it
    Unshaped,
}

impl ShapingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShapingStrategy::Unlimited => "unlimited",
            ShapingStrategy::NativeFlag => "native_flag",
            ShapingStrategy::PipeThrough => "pipe_through",
            ShapingStrategy::Unshaped => "unshaped",
        }
    }
}

/// Rate flags of tools that shape their own traffic
fn native_rate_args(program: &str, limit_kbps: u32) -> Option<Vec<String>> {
    match program {
        "rsync" => Some(vec![format!("--bwlimit={}", limit_kbps)]),
        "curl" => Some(vec!["--limit-rate".to_string(), format!("{}k", limit_kbps)]),
        "wget" => Some(vec![format!("--limit-rate={}k", limit_kbps)]),
        _ => None,
    }
}

/// Capability snapshot deciding the strategy for each command
#[derive(Debug, Clone, Default)]
pub struct ShapingPolicy {
    helper: Option<PathBuf>,
}

impl ShapingPolicy {
    /// Probe `PATH` for the shaping helper once
    pub fn detect() -> Self {
        let helper = find_in_path(SHAPING_HELPER);
        match &helper {
            Some(path) => tracing::info!("Bandwidth shaping helper found at {}", path.display()),
            None => tracing::info!(
                "Bandwidth shaping helper '{}' not found; only native rate flags available",
                SHAPING_HELPER
            ),
        }
        Self { helper }
    }

    /// Use an explicit helper (or none)
    pub fn with_helper(helper: Option<PathBuf>) -> Self {
        Self { helper }
    }

    pub fn helper(&self) -> Option<&Path> {
        self.helper.as_deref()
    }

    pub fn strategy_for(&self, command: &CommandSpec, limit_kbps: u32) -> ShapingStrategy {
        if limit_kbps == 0 {
            ShapingStrategy::Unlimited
        } else if native_rate_args(command.program_name(), limit_kbps).is_some() {
            ShapingStrategy::NativeFlag
        } else if self.helper.is_some() {
            ShapingStrategy::PipeThrough
        } else {
            ShapingStrategy::Unshaped
        }
    }

    /// Build the invocation for `command` under `limit_kbps`
    pub fn plan(&self, command: &CommandSpec, limit_kbps: u32) -> ShapedInvocation {
        let strategy = self.strategy_for(command, limit_kbps);

        let (invocation, warning) = match strategy {
            ShapingStrategy::Unlimited => (Invocation::Single(command.clone()), None),
            ShapingStrategy::NativeFlag => {
                let flags = native_rate_args(command.program_name(), limit_kbps)
                    .unwrap_or_default();
                (Invocation::Single(command.clone().args(flags)), None)
            }
            ShapingStrategy::PipeThrough => {
                let helper = self
                    .helper
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_else(|| SHAPING_HELPER.to_string());
                let sink = CommandSpec::new(helper).args([
                    "-q".to_string(),
                    "-L".to_string(),
                    format!("{}k", limit_kbps),
                ]);
                (
                    Invocation::Piped {
                        source: command.clone(),
                        sink,
                    },
                    None,
                )
            }
            ShapingStrategy::Unshaped => {
                let warning = MirrorError::ShapingUnavailable(format!(
                    "no rate flag for '{}' and '{}' not found; running {} without a {} kbps limit",
                    command.program_name(),
                    SHAPING_HELPER,
                    command.program_name(),
                    limit_kbps
                ));
                (Invocation::Single(command.clone()), Some(warning.to_string()))
            }
        };

        ShapedInvocation {
            invocation,
            strategy,
            warning,
        }
    }
}

/// A planned invocation and how it is shaped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapedInvocation {
    pub invocation: Invocation,
    pub strategy: ShapingStrategy,
    /// Capability warning when shaping was requested but unavailable
    pub warning: Option<String>,
}

/// Outcome of one shaped transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Exit status of the transfer command, unchanged
    pub output: RunOutput,
    pub strategy: ShapingStrategy,
    pub warning: Option<String>,
}

/// Wraps a runner with throughput shaping
#[derive(Clone)]
pub struct BandwidthLimiter {
    runner: Arc<dyn CommandRunner>,
    policy: ShapingPolicy,
}

impl BandwidthLimiter {
    pub fn new(runner: Arc<dyn CommandRunner>, policy: ShapingPolicy) -> Self {
        Self { runner, policy }
    }

    pub fn policy(&self) -> &ShapingPolicy {
        &self.policy
    }

    pub fn plan(&self, command: &CommandSpec, limit_kbps: u32) -> ShapedInvocation {
        self.policy.plan(command, limit_kbps)
    }

    /// Run `command` under `limit_kbps`. Never fails because shaping is missing.
    pub async fn execute(
        &self,
        command: &CommandSpec,
        limit_kbps: u32,
        timeout: Duration,
    ) -> Result<TransferReport> {
        let shaped = self.plan(command, limit_kbps);
        if let Some(warning) = &shaped.warning {
            tracing::warn!("{}", warning);
        }

        let output = self.runner.run(&shaped.invocation, timeout).await?;

        Ok(TransferReport {
            output,
            strategy: shaped.strategy,
            warning: shaped.warning,
        })
    }
}

/// Locate an executable on `PATH`
fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::testing::ScriptedRunner;
    use pretty_assertions::assert_eq;

    fn with_pv() -> ShapingPolicy {
        ShapingPolicy::with_helper(Some(PathBuf::from("/usr/bin/pv")))
    }

    fn without_pv() -> ShapingPolicy {
        ShapingPolicy::with_helper(None)
    }

    #[test]
    fn test_zero_limit_runs_unmodified() {
        let cmd = CommandSpec::new("rsync").args(["-a", "src/", "dst/"]);
        let shaped = with_pv().plan(&cmd, 0);

        assert_eq!(shaped.strategy, ShapingStrategy::Unlimited);
        assert_eq!(shaped.invocation, Invocation::Single(cmd));
        assert!(shaped.warning.is_none());
    }

    #[test]
    fn test_native_flag_preferred() {
        let cmd = CommandSpec::new("/usr/bin/rsync").args(["-a", "rsync://h/a/", "/m/a/"]);
        let shaped = with_pv().plan(&cmd, 500);

        assert_eq!(shaped.strategy, ShapingStrategy::NativeFlag);
        assert_eq!(
            shaped.invocation.to_string(),
            "/usr/bin/rsync -a rsync://h/a/ /m/a/ --bwlimit=500"
        );
    }

    #[test]
    fn test_curl_and_wget_flags() {
        let curl = without_pv().plan(&CommandSpec::new("curl").arg("-O"), 500);
        assert_eq!(curl.invocation.primary().args, vec!["-O", "--limit-rate", "500k"]);

        let wget = without_pv().plan(&CommandSpec::new("wget").arg("-m"), 500);
        assert_eq!(wget.invocation.primary().args, vec!["-m", "--limit-rate=500k"]);
    }

    #[test]
    fn test_helper_fallback() {
        let cmd = CommandSpec::new("git").args(["-C", "/m/a", "remote", "update"]);
        let shaped = with_pv().plan(&cmd, 500);

        assert_eq!(shaped.strategy, ShapingStrategy::PipeThrough);
        assert_eq!(
            shaped.invocation,
            Invocation::Piped {
                source: cmd,
                sink: CommandSpec::new("/usr/bin/pv").args(["-q", "-L", "500k"]),
            }
        );
        assert!(shaped.warning.is_none());
    }

    #[test]
    fn test_unshaped_fallback_warns() {
        let cmd = CommandSpec::new("git").args(["-C", "/m/a", "remote", "update"]);
        let shaped = without_pv().plan(&cmd, 500);

        assert_eq!(shaped.strategy, ShapingStrategy::Unshaped);
        assert_eq!(shaped.invocation, Invocation::Single(cmd));
        let warning = shaped.warning.unwrap();
        assert!(warning.starts_with("Bandwidth shaping unavailable"));
        assert!(warning.contains("500 kbps"));
    }

    #[tokio::test]
    async fn test_execute_never_fails_for_missing_shaping() {
        let runner = Arc::new(ScriptedRunner::new());
        let limiter = BandwidthLimiter::new(runner.clone(), without_pv());

        let report = limiter
            .execute(
                &CommandSpec::new("git").args(["fetch"]),
                500,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert!(report.output.success());
        assert_eq!(report.strategy, ShapingStrategy::Unshaped);
        assert!(report.warning.is_some());
        assert_eq!(runner.rendered_calls(), vec!["git fetch"]);
    }

    #[tokio::test]
    async fn test_execute_returns_exit_status_unchanged() {
        let runner = Arc::new(
            ScriptedRunner::new().respond("rsync", RunOutput::failed(23, "partial transfer")),
        );
        let limiter = BandwidthLimiter::new(runner.clone(), without_pv());

        let report = limiter
            .execute(&CommandSpec::new("rsync").arg("-a"), 500, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(report.output.code, Some(23));
        assert_eq!(runner.rendered_calls(), vec!["rsync -a --bwlimit=500"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_find_in_path_locates_sh() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-binary-5c1f").is_none());
    }
}
