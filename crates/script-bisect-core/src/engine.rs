//! Binary search over a commit range.
//!
//! The engine only knows the [`Oracle`] trait: it verifies the endpoints when
//! asked to, then narrows the window until the first commit whose verdict
//! differs from the good endpoint is found. Untestable commits are dropped
//! from the window and reported.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{BisectError, Endpoint, Result};
use crate::git::{CommitRef, ResolvedRange};
use crate::obs;
use crate::oracle::{Oracle, ProbeReport, Verdict};

/// Engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Probe both endpoints before searching.
    pub verify_endpoints: bool,
}

/// Result of one bisection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BisectOutcome {
    /// Earliest commit verdicted bad, if any.
    pub first_bad: Option<CommitRef>,
    /// Skipped commits directly preceding `first_bad`; any of them may be the
    /// real culprit.
    pub candidates: Vec<CommitRef>,
    /// Every commit found untestable, in probe order.
    pub skipped: Vec<CommitRef>,
    /// Every probe run, endpoint checks included.
    pub probes: Vec<ProbeReport>,
}

impl BisectOutcome {
    pub fn is_ambiguous(&self) -> bool {
        !self.candidates.is_empty()
    }
}

pub struct BisectionEngine<O: Oracle> {
    oracle: O,
    config: EngineConfig,
}

impl<O: Oracle> BisectionEngine<O> {
    pub fn new(oracle: O, config: EngineConfig) -> Self {
        Self { oracle, config }
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Bisect `range`.
    ///
    /// Verdicts never abort the run; oracle errors do, immediately.
    pub async fn run(&mut self, range: &ResolvedRange) -> Result<BisectOutcome> {
        let mut probes = Vec::new();
        let mut bad_endpoint_untestable = false;

        if self.config.verify_endpoints {
            let report = self.oracle.probe(&range.good).await?;
            check_endpoint(Endpoint::Good, &range.good_ref, &range.good, &report)?;
            probes.push(report);

            let report = self.oracle.probe(&range.bad).await?;
            check_endpoint(Endpoint::Bad, &range.bad_ref, &range.bad, &report)?;
            bad_endpoint_untestable = report.verdict == Verdict::Untestable;
            probes.push(report);
        }

        let mut commits = range.commits.clone();
        let mut low = 0usize;
        let mut end = commits.len();
        let mut first_bad: Option<CommitRef> = None;

        // The bad endpoint closes the sequence and is bad by assumption. It
        // stays out of the window and is only probed when no verdict backs
        // that assumption.
        let tail = commits
            .last()
            .filter(|c| !bad_endpoint_untestable && c.id == range.bad.id)
            .cloned();
        if tail.is_some() {
            end -= 1;
        }

        let mut skipped = Vec::new();
        let mut good = HashSet::new();
        while low < end {
            let mid = low + (end - low - 1) / 2;
            let Some(commit) = commits.get(mid).cloned() else {
                break;
            };
            tracing::debug!(low, end, mid, commit = %commit.short_id(), "probing");

            let report = self.oracle.probe(&commit).await?;
            let verdict = report.verdict;
            probes.push(report);

            match verdict {
                Verdict::Good => {
                    good.insert(commit.id);
                    low = mid + 1;
                }
                Verdict::Bad => {
                    first_bad = Some(commit);
                    end = mid;
                }
                Verdict::Untestable => {
                    commits.remove(mid);
                    end -= 1;
                    obs::emit_commit_skipped(&commit, end - low);
                    skipped.push(commit);
                }
            }
        }

        if let Some(tail) = tail.filter(|_| first_bad.is_none()) {
            let n = range.commits.len();
            let trusted = n == 1
                || range
                    .commits
                    .get(n - 2)
                    .is_some_and(|prev| good.contains(&prev.id));
            if trusted {
                first_bad = Some(tail);
            } else {
                tracing::debug!(commit = %tail.short_id(), "probing bad endpoint");
                let report = self.oracle.probe(&tail).await?;
                let verdict = report.verdict;
                probes.push(report);
                match verdict {
                    Verdict::Bad => first_bad = Some(tail),
                    Verdict::Good => {}
                    Verdict::Untestable => {
                        obs::emit_commit_skipped(&tail, 0);
                        skipped.push(tail);
                    }
                }
            }
        }

        let candidates = first_bad
            .as_ref()
            .map(|bad| preceding_skipped(range, bad, &skipped))
            .unwrap_or_default();

        let outcome = BisectOutcome {
            first_bad,
            candidates,
            skipped,
            probes,
        };
        obs::emit_bisect_finished(&outcome);
        Ok(outcome)
    }
}

fn check_endpoint(
    endpoint: Endpoint,
    reference: &str,
    commit: &CommitRef,
    report: &ProbeReport,
) -> Result<()> {
    let contradicting = match endpoint {
        Endpoint::Good => Verdict::Bad,
        Endpoint::Bad => Verdict::Good,
    };
    if report.verdict == contradicting {
        let mut detail = format!(
            "was expected to be {endpoint} but probed {} at {}",
            opposite(endpoint),
            commit.short_id()
        );
        if let Some(code) = report.exit_code {
            detail.push_str(&format!(" (exit code {code})"));
        }
        return Err(BisectError::InvariantViolation {
            endpoint,
            reference: reference.to_string(),
            detail,
        });
    }
    if report.verdict == Verdict::Untestable {
        tracing::warn!(
            endpoint = %endpoint,
            reference,
            commit = %commit.short_id(),
            "endpoint could not be tested; continuing"
        );
    }
    Ok(())
}

fn opposite(endpoint: Endpoint) -> Endpoint {
    match endpoint {
        Endpoint::Good => Endpoint::Bad,
        Endpoint::Bad => Endpoint::Good,
    }
}

/// Skipped commits immediately before `first_bad` in the original order.
fn preceding_skipped(
    range: &ResolvedRange,
    first_bad: &CommitRef,
    skipped: &[CommitRef],
) -> Vec<CommitRef> {
    let skipped: HashSet<&str> = skipped.iter().map(|c| c.id.as_str()).collect();
    let Some(index) = range.commits.position(&first_bad.id) else {
        return Vec::new();
    };
    let mut candidates: Vec<CommitRef> = range.commits.as_slice()[..index]
        .iter()
        .rev()
        .take_while(|c| skipped.contains(c.id.as_str()))
        .cloned()
        .collect();
    candidates.reverse();
    candidates
}
