//! Process spawning behind a trait seam

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::{CommandSpec, Invocation};
use crate::error::Result;

/// Longest diagnostic tail kept from a failed command's stderr
const MAX_DIAGNOSTIC_BYTES: usize = 4096;

/// Result of running an invocation to completion (or to its timeout)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunOutput {
    /// Exit code of the primary command; `None` if killed or timed out
    pub code: Option<i32>,
    /// Captured stderr of all processes, truncated to the last few KiB
    pub stderr: String,
    /// The ceiling elapsed and the process was killed
    pub timed_out: bool,
}

impl RunOutput {
    pub fn ok() -> Self {
        Self {
            code: Some(0),
            ..Self::default()
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stderr: stderr.into(),
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            code: None,
            stderr: String::new(),
            timed_out: true,
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// Human-readable failure description
    pub fn diagnostic(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit status {}", code),
            None if self.timed_out => "timed out".to_string(),
            None => "terminated by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            status
        } else {
            format!("{}: {}", status, stderr)
        }
    }
}

/// Spawns external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, killing the process tree after `timeout`.
    ///
    /// Only spawn failures are errors; a non-zero exit is a normal
    /// [`RunOutput`].
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<RunOutput>;
}

/// Runs invocations as real child processes via tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }
        // Leader of its own group so a timeout reaches every descendant
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn run_single(spec: &CommandSpec, timeout: Duration) -> Result<RunOutput> {
        let child = Self::command(spec).stdout(Stdio::null()).spawn()?;
        let group = child.id();

        // Dropping the future on timeout drops the child, and kill_on_drop reaps it
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(RunOutput {
                    code: output.status.code(),
                    stderr: tail(&output.stderr),
                    timed_out: false,
                })
            }
            Err(_) => {
                kill_process_group(group);
                Ok(RunOutput::timed_out())
            }
        }
    }

    async fn run_piped(
        source: &CommandSpec,
        sink: &CommandSpec,
        timeout: Duration,
    ) -> Result<RunOutput> {
        let mut source_child: Child = Self::command(source).stdout(Stdio::piped()).spawn()?;
        let stdout = source_child.stdout.take().ok_or_else(|| {
            crate::error::MirrorError::Internal("transfer stdout was not captured".to_string())
        })?;
        let pipe: Stdio = stdout.try_into()?;

        let sink_child = Self::command(sink)
            .stdin(pipe)
            .stdout(Stdio::null())
            .spawn()?;
        let groups = [source_child.id(), sink_child.id()];

        let both = async move {
            tokio::join!(source_child.wait_with_output(), sink_child.wait_with_output())
        };

        match tokio::time::timeout(timeout, both).await {
            Ok((source_out, sink_out)) => {
                let source_out = source_out?;
                let sink_out = sink_out?;

                let mut stderr = tail(&source_out.stderr);
                if !sink_out.status.success() {
                    let sink_err = tail(&sink_out.stderr);
                    stderr.push_str(&format!(
                        "\n{} exited with {}: {}",
                        sink.program_name(),
                        sink_out.status,
                        sink_err.trim()
                    ));
                }

                Ok(RunOutput {
                    code: source_out.status.code(),
                    stderr,
                    timed_out: false,
                })
            }
            Err(_) => {
                groups.into_iter().for_each(kill_process_group);
                Ok(RunOutput::timed_out())
            }
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<RunOutput> {
        tracing::debug!("Spawning: {}", invocation);
        match invocation {
            Invocation::Single(spec) => Self::run_single(spec, timeout).await,
            Invocation::Piped { source, sink } => Self::run_piped(source, sink, timeout).await,
        }
    }
}

/// SIGKILL the process group led by `leader`
#[cfg(unix)]
fn kill_process_group(leader: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = leader.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!("Failed to kill process group {}: {}", pid, e),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_leader: Option<u32>) {}

/// Keep the last `MAX_DIAGNOSTIC_BYTES` of captured output
fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end();
    if text.len() <= MAX_DIAGNOSTIC_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - MAX_DIAGNOSTIC_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
