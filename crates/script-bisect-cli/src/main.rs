//! script-bisect CLI
//!
//! The `script-bisect` command finds the commit of a Python package that
//! changed the behaviour of a script carrying inline (PEP 723) dependency
//! metadata.
//!
//! ```text
//! script-bisect repro.py xarray v2024.01.0 v2024.03.0
//! ```
//!
//! Exit codes: 0 when a commit is found (or on `--dry-run`), 1 on error or
//! when no commit is found, 130 when interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn, Level};
use uuid::Uuid;

use script_bisect_core::obs::BisectSpan;
use script_bisect_core::telemetry::init_tracing;
use script_bisect_core::{
    looks_like_newer_version, BisectOutcome, BisectReport, BisectionEngine, CommitRangeResolver,
    EngineConfig, FixCatalog, GitRepository, ManagedScript, OracleConfig, ResolvedRange,
    RunParameters, ScriptMetadata, SubprocessRunner, TestCommand, TestOracle,
};

const INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "script-bisect")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bisect a package's git history using a PEP 723 script as the test", long_about = None)]
struct Cli {
    /// Script with an inline `# /// script` metadata block
    script: PathBuf,

    /// Dependency to bisect, as named in the script's dependencies
    package: String,

    /// Reference where the script behaves as expected
    good_ref: String,

    /// Reference where the script misbehaves
    bad_ref: String,

    /// Git URL of the package (default: source of an existing pin in the script)
    #[arg(long)]
    repo_url: Option<String>,

    /// Command template; `{script}` is replaced by the managed script path
    #[arg(long, env = "SCRIPT_BISECT_TEST_COMMAND")]
    test_command: Option<String>,

    /// Per-run timeout in seconds
    #[arg(long, env = "SCRIPT_BISECT_TIMEOUT", default_value_t = 120)]
    timeout: u64,

    /// Maximum dependency-fix rounds per commit
    #[arg(long, env = "SCRIPT_BISECT_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Directory to place the temporary clone in
    #[arg(long)]
    clone_dir: Option<PathBuf>,

    /// Do not delete the clone when done
    #[arg(long)]
    keep_clone: bool,

    /// Find the commit that fixed the behaviour instead of breaking it
    #[arg(long)]
    inverse: bool,

    /// Print what would be done and exit
    #[arg(long)]
    dry_run: bool,

    /// Test both references before bisecting
    #[arg(long)]
    verify_endpoints: bool,

    /// TOML file with extra `[[fix]]` rules for missing dependencies
    #[arg(long)]
    fix_rules: Option<PathBuf>,

    /// Write a JSON report of the run to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunStatus {
    Found,
    NotFound,
    DryRun,
}

impl RunStatus {
    fn code(self) -> u8 {
        match self {
            RunStatus::Found | RunStatus::DryRun => 0,
            RunStatus::NotFound => 1,
        }
    }
}

/// Everything derived from the command line before any git work.
#[derive(Debug)]
struct Plan {
    script: PathBuf,
    package: String,
    repo_url: String,
    good_ref: String,
    bad_ref: String,
    oracle: OracleConfig,
    engine: EngineConfig,
    catalog: FixCatalog,
    clone_dir: Option<PathBuf>,
    keep_clone: bool,
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    // Dropping the run future on interrupt kills the running test and removes
    // the temporary directories.
    tokio::select! {
        result = run(cli) => match result {
            Ok(status) => ExitCode::from(status.code()),
            Err(e) => {
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted");
            ExitCode::from(INTERRUPTED)
        }
    }
}

async fn run(cli: Cli) -> Result<RunStatus> {
    let plan = build_plan(&cli)?;
    println!("{}", render_plan(&plan));

    if cli.dry_run {
        println!("Dry run: nothing was cloned or executed.");
        return Ok(RunStatus::DryRun);
    }

    let run_id = Uuid::new_v4();
    let _span = BisectSpan::enter(&run_id.to_string(), &plan.package);
    let started_at = Utc::now();

    let (repo, range) = resolve_range(&plan).await?;
    println!(
        "Bisecting {} commits between {} and {}",
        range.commits.len(),
        range.good.short_id(),
        range.bad.short_id()
    );

    let script = ManagedScript::from_file(&plan.script)
        .with_context(|| format!("Failed to prepare {}", plan.script.display()))?;
    let oracle = TestOracle::new(
        SubprocessRunner,
        plan.oracle.clone(),
        script,
        &plan.package,
        &plan.repo_url,
        plan.catalog.clone(),
    )?;
    let mut engine = BisectionEngine::new(oracle, plan.engine.clone());
    let outcome = engine.run(&range).await?;
    let added = engine.oracle().script().added_packages().to_vec();

    println!();
    println!(
        "{}",
        render_outcome(&outcome, &plan.repo_url, plan.oracle.inverse, &added)
    );

    if plan.keep_clone {
        println!("Clone kept at {}", repo.path().display());
    }

    let status = if outcome.first_bad.is_some() {
        RunStatus::Found
    } else {
        RunStatus::NotFound
    };

    if let Some(path) = &plan.report {
        let params = RunParameters::new(
            &plan.script,
            &plan.package,
            &plan.repo_url,
            (plan.good_ref.as_str(), plan.bad_ref.as_str()),
            &plan.oracle,
            plan.engine.verify_endpoints,
        );
        BisectReport::new(run_id, started_at, params, &range, outcome, added)
            .write(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }

    Ok(status)
}

fn build_plan(cli: &Cli) -> Result<Plan> {
    if cli.good_ref == cli.bad_ref {
        bail!("Good and bad references are identical ('{}')", cli.good_ref);
    }
    if !cli.inverse && looks_like_newer_version(&cli.good_ref, &cli.bad_ref) {
        warn!(
            good = %cli.good_ref,
            bad = %cli.bad_ref,
            "good ref looks newer than bad ref; use --inverse to find a fix"
        );
    }

    let text = std::fs::read_to_string(&cli.script)
        .with_context(|| format!("Failed to read script {}", cli.script.display()))?;
    let metadata = ScriptMetadata::parse(&text)
        .with_context(|| format!("Invalid inline metadata in {}", cli.script.display()))?;
    for warning in metadata.warnings() {
        warn!("{warning}");
    }
    if !metadata.has_package(&cli.package) {
        bail!(
            "Package '{}' not found in script dependencies (available: {})",
            cli.package,
            metadata.list_packages().join(", ")
        );
    }

    let repo_url = match (&cli.repo_url, metadata.repository_url(&cli.package)) {
        (Some(url), _) => url.clone(),
        (None, Some(url)) => {
            info!(url = %url, "using repository URL from script metadata");
            url
        }
        (None, None) => bail!(
            "No repository URL for '{}'; pass --repo-url",
            cli.package
        ),
    };

    let test_command = match &cli.test_command {
        Some(template) => TestCommand::parse(template)?,
        None => TestCommand::default(),
    };

    let mut catalog = FixCatalog::builtin()?;
    if let Some(path) = &cli.fix_rules {
        let added = catalog
            .extend_from_file(path)
            .with_context(|| format!("Failed to load fix rules from {}", path.display()))?;
        info!(rules = added, "loaded fix rules");
    }

    Ok(Plan {
        script: cli.script.clone(),
        package: cli.package.clone(),
        repo_url,
        good_ref: cli.good_ref.clone(),
        bad_ref: cli.bad_ref.clone(),
        oracle: OracleConfig {
            timeout_secs: cli.timeout,
            max_fix_rounds: cli.max_retries,
            test_command,
            inverse: cli.inverse,
        },
        engine: EngineConfig {
            verify_endpoints: cli.verify_endpoints,
        },
        catalog,
        clone_dir: cli.clone_dir.clone(),
        keep_clone: cli.keep_clone,
        report: cli.report.clone(),
    })
}

/// Set up the scratch clone and resolve the range. Dropping this future
/// kills any running git process.
async fn resolve_range(plan: &Plan) -> Result<(GitRepository, ResolvedRange)> {
    let url = &plan.repo_url;
    let repo = GitRepository::init_remote(url, plan.clone_dir.as_deref(), plan.keep_clone)
        .await
        .with_context(|| format!("Failed to set up a clone of {url}"))?;
    let range = CommitRangeResolver::new(&repo)
        .resolve(&plan.good_ref, &plan.bad_ref)
        .await
        .with_context(|| {
            format!(
                "Failed to resolve range {}..{}",
                plan.good_ref, plan.bad_ref
            )
        })?;
    Ok((repo, range))
}

fn render_plan(plan: &Plan) -> String {
    let mut lines = vec![
        "Bisection summary".to_string(),
        format!("  Script:        {}", plan.script.display()),
        format!("  Package:       {}", plan.package),
        format!("  Repository:    {}", plan.repo_url),
        format!("  Good ref:      {}", plan.good_ref),
        format!("  Bad ref:       {}", plan.bad_ref),
        format!("  Test command:  {}", plan.oracle.test_command),
        format!("  Timeout:       {}s", plan.oracle.timeout_secs),
        format!("  Fix rounds:    {}", plan.oracle.max_fix_rounds),
    ];
    if plan.oracle.inverse {
        lines.push("  Mode:          inverse (looking for the fixing commit)".to_string());
    }
    if plan.engine.verify_endpoints {
        lines.push("  Endpoints:     verified before bisecting".to_string());
    }
    lines.join("\n")
}

fn render_outcome(
    outcome: &BisectOutcome,
    repo_url: &str,
    inverse: bool,
    added: &[String],
) -> String {
    let mut out = String::new();
    match &outcome.first_bad {
        Some(commit) => {
            if inverse {
                out.push_str("Found the commit that fixed the issue:\n");
            } else {
                out.push_str("Found the first bad commit:\n");
            }
            out.push_str(&commit.describe());
            if let Some(url) = commit_url(repo_url, &commit.id) {
                out.push_str(&format!("\nURL:     {url}"));
            }
            if outcome.is_ambiguous() {
                out.push_str(&format!(
                    "\n\n{} untestable commit(s) directly precede it; any of them may be responsible:",
                    outcome.candidates.len()
                ));
                for c in &outcome.candidates {
                    out.push_str(&format!("\n  {} {}", c.short_id(), c.summary));
                }
            }
        }
        None => out.push_str("No commit with a changed result was found in the range."),
    }
    if !outcome.skipped.is_empty() {
        out.push_str(&format!(
            "\n\nSkipped {} untestable commit(s).",
            outcome.skipped.len()
        ));
    }
    if !added.is_empty() {
        out.push_str(&format!(
            "\nDependencies added during the run: {}",
            added.join(", ")
        ));
    }
    out.push_str(&format!("\nProbes run: {}", outcome.probes.len()));
    out
}

/// Web link for a commit on GitHub-hosted repositories.
fn commit_url(repo_url: &str, sha: &str) -> Option<String> {
    let url = repo_url.strip_prefix("git+").unwrap_or(repo_url);
    let url = url.trim_end_matches('/');
    let url = url.strip_suffix(".git").unwrap_or(url);
    if url.starts_with("https://github.com/") {
        Some(format!("{url}/commit/{sha}"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use script_bisect_core::CommitRef;

    const SCRIPT: &str = "# /// script\n# requires-python = \">=3.11\"\n# dependencies = [\n#   \"xarray@git+https://github.com/pydata/xarray.git@main\",\n#   \"numpy\",\n# ]\n# ///\nimport xarray\n";

    fn parse_args(args: &[&str]) -> Cli {
        let mut argv = vec!["script-bisect"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    fn script_file() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repro.py");
        std::fs::write(&path, SCRIPT).unwrap();
        (dir, path)
    }

    fn commit(id: &str, summary: &str) -> CommitRef {
        CommitRef {
            id: id.to_string(),
            author: "Dev <dev@example.com>".to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            summary: summary.to_string(),
        }
    }

    #[test]
    fn test_cli_defaults() {
        let cli = parse_args(&["repro.py", "xarray", "v1", "v2"]);
        assert_eq!(cli.timeout, 120);
        assert_eq!(cli.max_retries, 3);
        assert!(!cli.inverse && !cli.dry_run && !cli.verify_endpoints);
        assert!(cli.test_command.is_none());
    }

    #[test]
    fn test_cli_requires_four_positionals() {
        assert!(Cli::try_parse_from(["script-bisect", "repro.py", "xarray", "v1"]).is_err());
    }

    #[test]
    fn test_plan_uses_pinned_repository_url() {
        let (_dir, path) = script_file();
        let cli = parse_args(&[path.to_str().unwrap(), "xarray", "v1", "v2"]);
        let plan = build_plan(&cli).unwrap();
        assert_eq!(plan.repo_url, "git+https://github.com/pydata/xarray.git");
        assert_eq!(plan.oracle, OracleConfig::default());
    }

    #[test]
    fn test_plan_rejects_identical_refs() {
        let (_dir, path) = script_file();
        let cli = parse_args(&[path.to_str().unwrap(), "xarray", "v1", "v1"]);
        let err = build_plan(&cli).unwrap_err();
        assert!(err.to_string().contains("identical"));
    }

    #[test]
    fn test_plan_rejects_unknown_package() {
        let (_dir, path) = script_file();
        let cli = parse_args(&[path.to_str().unwrap(), "pandas", "v1", "v2"]);
        let err = build_plan(&cli).unwrap_err().to_string();
        assert!(err.contains("pandas"));
        assert!(err.contains("xarray, numpy"));
    }

    #[test]
    fn test_plan_requires_repo_url_for_unpinned_package() {
        let (_dir, path) = script_file();
        let cli = parse_args(&[path.to_str().unwrap(), "numpy", "v1", "v2"]);
        assert!(build_plan(&cli).is_err());

        let cli = parse_args(&[
            path.to_str().unwrap(),
            "numpy",
            "v1",
            "v2",
            "--repo-url",
            "https://github.com/numpy/numpy",
        ]);
        assert_eq!(build_plan(&cli).unwrap().repo_url, "https://github.com/numpy/numpy");
    }

    #[test]
    fn test_plan_rejects_command_without_placeholder() {
        let (_dir, path) = script_file();
        let cli = parse_args(&[
            path.to_str().unwrap(),
            "xarray",
            "v1",
            "v2",
            "--test-command",
            "pytest -x",
        ]);
        assert!(build_plan(&cli).is_err());
    }

    #[test]
    fn test_plan_loads_fix_rules() {
        let (dir, path) = script_file();
        let rules = dir.path().join("rules.toml");
        std::fs::write(
            &rules,
            "[[fix]]\npackage = \"pooch\"\npattern = \"No module named 'pooch'\"\n",
        )
        .unwrap();
        let cli = parse_args(&[
            path.to_str().unwrap(),
            "xarray",
            "v1",
            "v2",
            "--fix-rules",
            rules.to_str().unwrap(),
        ]);
        let plan = build_plan(&cli).unwrap();
        assert_eq!(plan.catalog.len(), FixCatalog::builtin().unwrap().len() + 1);
    }

    #[tokio::test]
    async fn test_dry_run_exits_without_cloning() {
        let (_dir, path) = script_file();
        let cli = parse_args(&[path.to_str().unwrap(), "xarray", "v1", "v2", "--dry-run"]);
        assert_eq!(run(cli).await.unwrap(), RunStatus::DryRun);
    }

    #[test]
    fn test_render_plan_mentions_inverse_mode() {
        let (_dir, path) = script_file();
        let cli = parse_args(&[path.to_str().unwrap(), "xarray", "v1", "v2", "--inverse"]);
        let text = render_plan(&build_plan(&cli).unwrap());
        assert!(text.contains("Package:       xarray"));
        assert!(text.contains("inverse"));
    }

    #[test]
    fn test_render_outcome_found_with_candidates() {
        let outcome = BisectOutcome {
            first_bad: Some(commit("abc123", "Refactor indexing")),
            candidates: vec![commit("fff000", "Bump deps")],
            skipped: vec![commit("fff000", "Bump deps")],
            probes: Vec::new(),
        };
        let text = render_outcome(
            &outcome,
            "git+https://github.com/pydata/xarray.git",
            false,
            &["scipy".to_string()],
        );
        assert!(text.starts_with("Found the first bad commit:"));
        assert!(text.contains("Commit:  abc123"));
        assert!(text.contains("https://github.com/pydata/xarray/commit/abc123"));
        assert!(text.contains("fff000 Bump deps"));
        assert!(text.contains("Dependencies added during the run: scipy"));
    }

    #[test]
    fn test_render_outcome_not_found() {
        let outcome = BisectOutcome {
            first_bad: None,
            candidates: Vec::new(),
            skipped: Vec::new(),
            probes: Vec::new(),
        };
        let text = render_outcome(&outcome, "https://gitlab.com/x/y", true, &[]);
        assert!(text.starts_with("No commit"));
        assert!(!text.contains("URL"));
    }

    #[test]
    fn test_commit_url() {
        assert_eq!(
            commit_url("https://github.com/pydata/xarray/", "abc").as_deref(),
            Some("https://github.com/pydata/xarray/commit/abc")
        );
        assert_eq!(commit_url("https://example.org/repo.git", "abc"), None);
    }

    #[test]
    fn test_status_exit_codes() {
        assert_eq!(RunStatus::Found.code(), 0);
        assert_eq!(RunStatus::DryRun.code(), 0);
        assert_eq!(RunStatus::NotFound.code(), 1);
    }
}
