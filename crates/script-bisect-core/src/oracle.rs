//! Test oracle: turns one commit into one verdict.
//!
//! Each probe pins the package in the managed script to the commit, runs the
//! test command, and on failure runs a bounded dependency-fix loop before
//! trusting the result.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BisectError, Result};
use crate::fixer::{self, FixCatalog, FixOutcome};
use crate::git::CommitRef;
use crate::obs;
use crate::runner::{ProcessOutput, ProcessRunner, RunnerError, TestCommand};
use crate::workspace::ManagedScript;

const OUTPUT_TAIL_CHARS: usize = 1000;

/// Outcome of a probe after inverse-mode mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Good,
    Bad,
    Untestable,
}

/// What the test command did, before any mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Passed,
    Failed,
    TimedOut,
    /// The process started but its output could not be collected.
    Errored,
}

impl Verdict {
    /// Map a raw outcome; inverse mode swaps pass and fail.
    pub fn from_outcome(outcome: ProbeOutcome, inverse: bool) -> Self {
        match (outcome, inverse) {
            (ProbeOutcome::Passed, false) | (ProbeOutcome::Failed, true) => Verdict::Good,
            (ProbeOutcome::Failed, false) | (ProbeOutcome::Passed, true) => Verdict::Bad,
            (ProbeOutcome::TimedOut | ProbeOutcome::Errored, _) => Verdict::Untestable,
        }
    }
}

/// Record of a single probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub commit: String,
    pub verdict: Verdict,
    pub outcome: ProbeOutcome,
    /// Exit code of the last run, if the process finished.
    pub exit_code: Option<i32>,
    /// Number of fix rounds used by this probe.
    pub fix_rounds: u32,
    /// Packages added during this probe.
    pub added_packages: Vec<String>,
    /// Digest of the dependency set the last run used.
    pub dependency_digest: String,
    pub duration_ms: u64,
    /// Tail of the output of a failing run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tail: Option<String>,
}

/// Oracle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Hard limit per test run, in seconds.
    pub timeout_secs: u64,
    /// Maximum dependency-fix rounds per probe.
    pub max_fix_rounds: u32,
    pub test_command: TestCommand,
    /// Look for the commit that fixed the behaviour instead of breaking it.
    pub inverse: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_fix_rounds: 3,
            test_command: TestCommand::default(),
            inverse: false,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Decision function used by the bisection engine.
#[async_trait]
pub trait Oracle: Send {
    async fn probe(&mut self, commit: &CommitRef) -> Result<ProbeReport>;
}

/// Oracle backed by a managed script and a process runner.
pub struct TestOracle<R: ProcessRunner> {
    runner: R,
    config: OracleConfig,
    package: String,
    source: String,
    script: ManagedScript,
    catalog: FixCatalog,
}

impl<R: ProcessRunner> TestOracle<R> {
    /// Fails with a parse error when `package` is not declared by the script.
    pub fn new(
        runner: R,
        config: OracleConfig,
        script: ManagedScript,
        package: impl Into<String>,
        source: impl Into<String>,
        catalog: FixCatalog,
    ) -> Result<Self> {
        let package = package.into();
        if !script.dependencies()?.contains(&package) {
            return Err(BisectError::Parse(format!(
                "package '{package}' not found in script dependencies"
            )));
        }
        Ok(Self {
            runner,
            config,
            package,
            source: source.into(),
            script,
            catalog,
        })
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn script(&self) -> &ManagedScript {
        &self.script
    }

    /// Run the test for `commit_id` and classify it.
    pub async fn probe_commit(&mut self, commit_id: &str) -> Result<ProbeReport> {
        let started = Instant::now();
        let argv = self.config.test_command.argv(self.script.path());
        let mut fix_rounds = 0u32;
        let mut added_packages = Vec::new();

        let (outcome, last_output, digest) = loop {
            let block = self
                .script
                .write_pinned(&self.package, &self.source, commit_id)?;
            let digest = block.digest();

            let output = match self
                .runner
                .run(&argv, None, self.config.timeout())
                .await
            {
                Ok(output) => output,
                Err(RunnerError::Timeout { limit_ms }) => {
                    tracing::warn!(commit = %short(commit_id), limit_ms, "test timed out");
                    break (ProbeOutcome::TimedOut, None, digest);
                }
                Err(RunnerError::Io(e)) => {
                    tracing::warn!(commit = %short(commit_id), error = %e, "test output unavailable");
                    break (ProbeOutcome::Errored, None, digest);
                }
                Err(e) => {
                    return Err(BisectError::Execution {
                        command: self.config.test_command.display_for(self.script.path()),
                        reason: e.to_string(),
                    })
                }
            };

            if output.success() {
                break (ProbeOutcome::Passed, Some(output), digest);
            }
            log_failure(commit_id, &output);

            if fix_rounds >= self.config.max_fix_rounds {
                tracing::debug!(commit = %short(commit_id), fix_rounds, "fix budget exhausted");
                break (ProbeOutcome::Failed, Some(output), digest);
            }
            let fixes = self.catalog.detect(&output.combined());
            if fixes.is_empty() {
                break (ProbeOutcome::Failed, Some(output), digest);
            }
            for fix in &fixes {
                tracing::info!(package = %fix.package, reason = %fix.reason, "detected missing dependency");
            }
            match fixer::apply(&self.script.dependencies()?, &fixes)? {
                FixOutcome::NoProgress => {
                    tracing::debug!(commit = %short(commit_id), "fixes already applied; not retrying");
                    break (ProbeOutcome::Failed, Some(output), digest);
                }
                FixOutcome::Applied { block, added } => {
                    fix_rounds += 1;
                    obs::emit_fix_applied(commit_id, fix_rounds, &added);
                    self.script.accumulate(&block, &added)?;
                    added_packages.extend(added);
                }
            }
        };

        let verdict = Verdict::from_outcome(outcome, self.config.inverse);
        let report = ProbeReport {
            commit: commit_id.to_string(),
            verdict,
            outcome,
            exit_code: last_output.as_ref().map(|o| o.exit_code),
            fix_rounds,
            added_packages,
            dependency_digest: digest,
            duration_ms: started.elapsed().as_millis() as u64,
            output_tail: last_output
                .filter(|o| !o.success())
                .map(|o| tail(&o.combined(), OUTPUT_TAIL_CHARS)),
        };
        Ok(report)
    }
}

#[async_trait]
impl<R: ProcessRunner> Oracle for TestOracle<R> {
    async fn probe(&mut self, commit: &CommitRef) -> Result<ProbeReport> {
        obs::emit_probe_started(&commit.id, &commit.summary);
        let report = self.probe_commit(&commit.id).await?;
        obs::emit_probe_finished(&report);
        Ok(report)
    }
}

fn log_failure(commit_id: &str, output: &ProcessOutput) {
    tracing::debug!(
        commit = %short(commit_id),
        exit_code = output.exit_code,
        stdout = %tail(&output.stdout, OUTPUT_TAIL_CHARS),
        stderr = %tail(&output.stderr, OUTPUT_TAIL_CHARS),
        "test failed"
    );
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Last `max` characters of `text`.
fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let skip = count - max;
    format!("...{}", text.chars().skip(skip).collect::<String>())
}
