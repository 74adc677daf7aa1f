//! External process execution for probes.
//!
//! Defines the [`ProcessRunner`] trait the oracle talks to, the tokio-backed
//! [`SubprocessRunner`], and the [`TestCommand`] template type.

use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{BisectError, Result};

/// Substitution token for the script path in a command template.
pub const SCRIPT_TOKEN: &str = "{script}";

/// Default command: run the script through `uv`.
pub const DEFAULT_TEST_COMMAND: &str = "uv run {script}";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by a process runner.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("command timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("program '{program}' not found")]
    CommandNotFound { program: String },

    #[error("failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("empty command")]
    EmptyCommand,

    #[error("process i/o failed: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Runner trait
// ---------------------------------------------------------------------------

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// Exit code; `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined by a newline, as scanned for fix triggers.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Backend that executes one command to completion.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `command` (program first) with a hard `timeout`.
    ///
    /// Must return [`RunnerError::Timeout`] when the limit is hit, after the
    /// process has been terminated, and [`RunnerError::CommandNotFound`] when
    /// the program does not exist.
    async fn run(
        &self,
        command: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> std::result::Result<ProcessOutput, RunnerError>;
}

/// Runs commands as child processes via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubprocessRunner;

#[async_trait]
impl ProcessRunner for SubprocessRunner {
    async fn run(
        &self,
        command: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> std::result::Result<ProcessOutput, RunnerError> {
        let start = Instant::now();
        let (program, args) = command.split_first().ok_or(RunnerError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RunnerError::CommandNotFound {
                program: program.clone(),
            },
            _ => RunnerError::Launch {
                program: program.clone(),
                source: e,
            },
        })?;
        // Tears down the whole process tree on timeout, and when this future
        // is dropped mid-run.
        let _group = ProcessGroup::new(child.id());

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(RunnerError::Timeout {
                    limit_ms: timeout.as_millis() as u64,
                })
            }
        };

        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Kills every process in the child's group when dropped.
///
/// The child is spawned as a group leader, so its group id is its pid. Only
/// descendants that move to another group escape.
pub(crate) struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<u32>,
}

impl ProcessGroup {
    pub(crate) fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.and_then(|p| libc::pid_t::try_from(p).ok()) {
            // ESRCH once the group is gone is expected.
            unsafe {
                let _ = libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Command template
// ---------------------------------------------------------------------------

/// Whitespace-separated command template containing `{script}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TestCommand {
    template: String,
}

impl TestCommand {
    pub fn parse(template: &str) -> Result<Self> {
        let template = template.trim();
        if template.is_empty() {
            return Err(BisectError::InvalidConfig(
                "test command must not be empty".to_string(),
            ));
        }
        if !template.contains(SCRIPT_TOKEN) {
            return Err(BisectError::InvalidConfig(format!(
                "test command '{template}' must contain the {SCRIPT_TOKEN} placeholder"
            )));
        }
        Ok(Self {
            template: template.to_string(),
        })
    }

    /// Argument vector with every `{script}` replaced by `script`.
    pub fn argv(&self, script: &Path) -> Vec<String> {
        let script = script.to_string_lossy();
        self.template
            .split_whitespace()
            .map(|part| part.replace(SCRIPT_TOKEN, &script))
            .collect()
    }

    /// The command line as it would be typed, for error messages.
    pub fn display_for(&self, script: &Path) -> String {
        self.argv(script).join(" ")
    }
}

impl Default for TestCommand {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEST_COMMAND.to_string(),
        }
    }
}

impl fmt::Display for TestCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

impl TryFrom<String> for TestCommand {
    type Error = BisectError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TestCommand> for String {
    fn from(value: TestCommand) -> Self {
        value.template
    }
}
