//! Machine-readable record of a bisection run.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::BisectOutcome;
use crate::error::Result;
use crate::git::{CommitRef, ResolvedRange};
use crate::oracle::{OracleConfig, ProbeReport};

/// Parameters a run was started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParameters {
    pub script: String,
    pub package: String,
    pub repository: String,
    pub good_ref: String,
    pub bad_ref: String,
    pub test_command: String,
    pub timeout_secs: u64,
    pub max_fix_rounds: u32,
    pub inverse: bool,
    pub verify_endpoints: bool,
}

impl RunParameters {
    pub fn new(
        script: &Path,
        package: &str,
        repository: &str,
        range: (&str, &str),
        oracle: &OracleConfig,
        verify_endpoints: bool,
    ) -> Self {
        Self {
            script: script.display().to_string(),
            package: package.to_string(),
            repository: repository.to_string(),
            good_ref: range.0.to_string(),
            bad_ref: range.1.to_string(),
            test_command: oracle.test_command.to_string(),
            timeout_secs: oracle.timeout_secs,
            max_fix_rounds: oracle.max_fix_rounds,
            inverse: oracle.inverse,
            verify_endpoints,
        }
    }
}

/// Full run report, written with `--report`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BisectReport {
    pub run_id: Uuid,
    pub tool_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub parameters: RunParameters,
    pub good: CommitRef,
    pub bad: CommitRef,
    pub commits_in_range: usize,
    pub first_bad: Option<CommitRef>,
    pub candidates: Vec<CommitRef>,
    pub skipped: Vec<CommitRef>,
    pub probes: Vec<ProbeReport>,
    /// Packages added by dependency fixes over the whole run.
    pub added_packages: Vec<String>,
}

impl BisectReport {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        parameters: RunParameters,
        range: &ResolvedRange,
        outcome: BisectOutcome,
        added_packages: Vec<String>,
    ) -> Self {
        Self {
            run_id,
            tool_version: crate::VERSION.to_string(),
            started_at,
            finished_at: Utc::now(),
            parameters,
            good: range.good.clone(),
            bad: range.bad.clone(),
            commits_in_range: range.commits.len(),
            first_bad: outcome.first_bad,
            candidates: outcome.candidates,
            skipped: outcome.skipped,
            probes: outcome.probes,
            added_packages,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report as pretty JSON, creating parent directories.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
