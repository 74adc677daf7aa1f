//! Bisection behaviour against scripted oracles.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use script_bisect_core::{
    BisectError, BisectionEngine, CommitRef, CommitSequence, EngineConfig, Endpoint, Oracle,
    ProbeOutcome, ProbeReport, ResolvedRange, Result, Verdict,
};

fn commit(i: usize) -> CommitRef {
    CommitRef {
        id: format!("{:040x}", 0xc0ffee + i),
        author: "dev <dev@example.com>".to_string(),
        timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64 * 60, 0).unwrap(),
        summary: format!("change {i}"),
    }
}

/// Eight commits where the first is the good endpoint and the last the bad one.
fn eight_commit_range() -> ResolvedRange {
    let commits: Vec<CommitRef> = (0..8).map(commit).collect();
    ResolvedRange {
        good_ref: "v1.0".to_string(),
        bad_ref: "v1.1".to_string(),
        good: commits[0].clone(),
        bad: commits[7].clone(),
        commits: CommitSequence::from_commits(commits),
    }
}

#[derive(Default)]
struct TableOracle {
    verdicts: HashMap<String, Verdict>,
    probed: Vec<String>,
}

impl TableOracle {
    fn new(verdicts: impl IntoIterator<Item = (usize, Verdict)>) -> Self {
        Self {
            verdicts: verdicts
                .into_iter()
                .map(|(i, v)| (commit(i).id, v))
                .collect(),
            probed: Vec::new(),
        }
    }
}

#[async_trait]
impl Oracle for TableOracle {
    async fn probe(&mut self, commit: &CommitRef) -> Result<ProbeReport> {
        self.probed.push(commit.id.clone());
        let verdict = self.verdicts[&commit.id];
        Ok(ProbeReport {
            commit: commit.id.clone(),
            verdict,
            outcome: match verdict {
                Verdict::Good => ProbeOutcome::Passed,
                Verdict::Bad => ProbeOutcome::Failed,
                Verdict::Untestable => ProbeOutcome::TimedOut,
            },
            exit_code: None,
            fix_rounds: 0,
            added_packages: Vec::new(),
            dependency_digest: String::new(),
            duration_ms: 0,
            output_tail: None,
        })
    }
}

fn threshold(first_bad: usize) -> impl Iterator<Item = (usize, Verdict)> {
    (0..8).map(move |i| {
        let v = if i >= first_bad {
            Verdict::Bad
        } else {
            Verdict::Good
        };
        (i, v)
    })
}

fn verifying() -> EngineConfig {
    EngineConfig {
        verify_endpoints: true,
    }
}

#[tokio::test]
async fn finds_index_five_with_verified_endpoints() {
    let range = eight_commit_range();
    let mut engine = BisectionEngine::new(TableOracle::new(threshold(5)), verifying());
    let outcome = engine.run(&range).await.unwrap();

    assert_eq!(outcome.first_bad, Some(commit(5)));
    let bisection_probes = outcome.probes.len() - 2;
    assert!(
        (3..=4).contains(&bisection_probes),
        "{bisection_probes} bisection probes"
    );
    assert_eq!(engine.oracle().probed[..2], [commit(0).id, commit(7).id]);
}

#[tokio::test]
async fn untestable_index_three_is_dropped() {
    let range = eight_commit_range();
    let verdicts = threshold(5).map(|(i, v)| if i == 3 { (i, Verdict::Untestable) } else { (i, v) });
    let mut engine = BisectionEngine::new(TableOracle::new(verdicts), verifying());
    let outcome = engine.run(&range).await.unwrap();

    assert_eq!(outcome.first_bad, Some(commit(5)));
    assert_eq!(outcome.skipped, vec![commit(3)]);
    assert!(outcome.candidates.is_empty());
}

#[tokio::test]
async fn broken_good_endpoint_stops_before_bisecting() {
    let range = eight_commit_range();
    let mut engine = BisectionEngine::new(TableOracle::new(threshold(0)), verifying());
    let err = engine.run(&range).await.unwrap_err();

    assert!(matches!(
        err,
        BisectError::InvariantViolation {
            endpoint: Endpoint::Good,
            ..
        }
    ));
    assert!(err.to_string().contains("v1.0"));
    assert_eq!(engine.oracle().probed.len(), 1);
}

#[tokio::test]
async fn bad_endpoint_is_trusted_after_a_good_neighbour() {
    let range = eight_commit_range();
    let verdicts = (0..8).map(|i| (i, Verdict::Good));
    let mut engine = BisectionEngine::new(TableOracle::new(verdicts), EngineConfig::default());
    let outcome = engine.run(&range).await.unwrap();

    // Without verification the bad endpoint is trusted once the commit
    // right before it passed.
    assert_eq!(outcome.first_bad, Some(commit(7)));
    assert!(engine.oracle().probed.contains(&commit(6).id));
    assert!(!engine.oracle().probed.contains(&commit(7).id));
}

#[tokio::test]
async fn nothing_is_found_when_every_commit_is_untestable() {
    let range = eight_commit_range();
    let verdicts = (0..8).map(|i| (i, Verdict::Untestable));
    let mut engine = BisectionEngine::new(TableOracle::new(verdicts), EngineConfig::default());
    let outcome = engine.run(&range).await.unwrap();

    assert_eq!(outcome.first_bad, None);
    assert!(outcome.candidates.is_empty());
    assert_eq!(outcome.skipped.len(), 8);
    assert_eq!(outcome.probes.len(), 8);
}
