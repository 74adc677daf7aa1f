//! Structured events for the bisection lifecycle.
//!
//! A [`BisectSpan`] tags everything logged during one run with its run id and
//! package; the `emit_*` functions log the lifecycle events with a stable
//! `event` field.

use tracing::{info, warn};

use crate::engine::BisectOutcome;
use crate::git::CommitRef;
use crate::oracle::{ProbeReport, Verdict};

/// RAII guard for the run-scoped span.
///
/// ```ignore
/// let _span = BisectSpan::enter("3f2a...", "xarray");
/// ```
pub struct BisectSpan {
    _span: tracing::span::EnteredSpan,
}

impl BisectSpan {
    pub fn enter(run_id: &str, package: &str) -> Self {
        let span = tracing::info_span!("script_bisect.run", run_id = %run_id, package = %package);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_probe_started(commit_id: &str, summary: &str) {
    info!(event = "probe.started", commit = %short(commit_id), summary = %summary);
}

pub fn emit_probe_finished(report: &ProbeReport) {
    let verdict = match report.verdict {
        Verdict::Good => "good",
        Verdict::Bad => "bad",
        Verdict::Untestable => "untestable",
    };
    info!(
        event = "probe.finished",
        commit = %short(&report.commit),
        verdict = verdict,
        fix_rounds = report.fix_rounds,
        duration_ms = report.duration_ms,
    );
}

pub fn emit_fix_applied(commit_id: &str, round: u32, added: &[String]) {
    info!(
        event = "probe.fix_applied",
        commit = %short(commit_id),
        round = round,
        added = %added.join(", "),
    );
}

/// Warning: a commit could not be classified and left the search window.
pub fn emit_commit_skipped(commit: &CommitRef, remaining: usize) {
    warn!(
        event = "commit.skipped",
        commit = %commit.short_id(),
        remaining = remaining,
    );
}

pub fn emit_bisect_finished(outcome: &BisectOutcome) {
    info!(
        event = "bisect.finished",
        first_bad = %outcome.first_bad.as_ref().map(|c| c.short_id()).unwrap_or("none"),
        probes = outcome.probes.len(),
        skipped = outcome.skipped.len(),
    );
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
