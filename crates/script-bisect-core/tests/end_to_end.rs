//! Full runs against a real local git repository with `sh` as the test
//! command.

use std::path::Path;
use std::process::Command;

use script_bisect_core::{
    BisectError, BisectionEngine, CommitRangeResolver, EngineConfig, FixCatalog, GitRepository,
    ManagedScript, OracleConfig, SubprocessRunner, TestCommand, TestOracle,
};

fn run_git(repo_dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Upstream repo: `good` tag, eight further commits, `bad` tag on the last.
fn make_upstream() -> (tempfile::TempDir, Vec<String>) {
    let dir = tempfile::tempdir().unwrap();
    run_git(dir.path(), &["init", "--quiet"]);
    run_git(dir.path(), &["config", "user.name", "test-user"]);
    run_git(dir.path(), &["config", "user.email", "test@example.com"]);
    run_git(dir.path(), &["commit", "--quiet", "--allow-empty", "-m", "base"]);
    run_git(dir.path(), &["tag", "good"]);
    let mut shas = Vec::new();
    for i in 0..8 {
        run_git(
            dir.path(),
            &["commit", "--quiet", "--allow-empty", "-m", &format!("change {i}")],
        );
        shas.push(run_git(dir.path(), &["rev-parse", "HEAD"]));
    }
    run_git(dir.path(), &["tag", "bad"]);
    (dir, shas)
}

/// A shell script with PEP 723 metadata. It needs `scipy` declared, then
/// fails once the pinned commit contains `breaking`.
fn repro_script(upstream: &Path, breaking: &str) -> String {
    format!(
        r#"# /// script
# requires-python = ">=3.11"
# dependencies = [
#   "mylib",
# ]
# ///
grep -q '^#.*"scip[y]"' "$0" || {{ echo "ModuleNotFoundError: No module named 'scipy'" >&2; exit 1; }}
ref=$(sed -n 's/.*mylib@.*@\([0-9a-f]\{{40\}}\)".*/\1/p' "$0")
[ -n "$ref" ] || exit 2
if git -C '{upstream}' merge-base --is-ancestor {breaking} "$ref"; then
  echo "regression present at $ref"
  exit 1
fi
"#,
        upstream = upstream.display(),
    )
}

fn sh_config() -> OracleConfig {
    OracleConfig {
        timeout_secs: 30,
        test_command: TestCommand::parse("sh {script}").unwrap(),
        ..Default::default()
    }
}

#[tokio::test]
async fn finds_breaking_commit_and_fixes_missing_dependency() {
    let (upstream, shas) = make_upstream();
    let url = format!("file://{}", upstream.path().display());

    let repo = GitRepository::init_remote(&url, None, false).await.unwrap();
    let range = CommitRangeResolver::new(&repo)
        .resolve("good", "bad")
        .await
        .unwrap();
    assert_eq!(range.commits.len(), 8);

    let original = tempfile::tempdir().unwrap();
    let script_path = original.path().join("repro.py");
    let text = repro_script(upstream.path(), &shas[5]);
    std::fs::write(&script_path, &text).unwrap();

    let script = ManagedScript::from_file(&script_path).unwrap();
    let oracle = TestOracle::new(
        SubprocessRunner,
        sh_config(),
        script,
        "mylib",
        &url,
        FixCatalog::builtin().unwrap(),
    )
    .unwrap();
    let config = EngineConfig {
        verify_endpoints: true,
    };
    let mut engine = BisectionEngine::new(oracle, config);
    let outcome = engine.run(&range).await.unwrap();

    let first_bad = outcome.first_bad.expect("a bad commit");
    assert_eq!(first_bad.id, shas[5]);
    assert_eq!(first_bad.summary, "change 5");
    assert!(outcome.skipped.is_empty());
    assert_eq!(engine.oracle().script().added_packages(), ["scipy".to_string()]);
    assert_eq!(outcome.probes[0].fix_rounds, 1);

    // The user's file is untouched.
    assert_eq!(std::fs::read_to_string(&script_path).unwrap(), text);
}

#[tokio::test]
async fn inverse_mode_finds_the_fixing_commit() {
    let (upstream, shas) = make_upstream();
    let url = format!("file://{}", upstream.path().display());
    let repo = GitRepository::init_remote(&url, None, false).await.unwrap();
    let range = CommitRangeResolver::new(&repo)
        .resolve("good", "bad")
        .await
        .unwrap();

    // The script fails before change 2 and passes from it on.
    let text = repro_script(upstream.path(), &shas[2]).replace("exit 1\nfi", "exit 0\nfi\nexit 1");
    let script = ManagedScript::from_text("repro.py", text).unwrap();
    let config = OracleConfig {
        inverse: true,
        max_fix_rounds: 1,
        ..sh_config()
    };
    let oracle = TestOracle::new(
        SubprocessRunner,
        config,
        script,
        "mylib",
        &url,
        FixCatalog::builtin().unwrap(),
    )
    .unwrap();
    let mut engine = BisectionEngine::new(oracle, EngineConfig::default());
    let outcome = engine.run(&range).await.unwrap();
    assert_eq!(outcome.first_bad.map(|c| c.id), Some(shas[2].clone()));
}

#[tokio::test]
async fn missing_test_runner_aborts_the_run() {
    let (upstream, shas) = make_upstream();
    let url = format!("file://{}", upstream.path().display());
    let repo = GitRepository::init_remote(&url, None, false).await.unwrap();
    let range = CommitRangeResolver::new(&repo)
        .resolve("good", "bad")
        .await
        .unwrap();

    let script =
        ManagedScript::from_text("repro.py", repro_script(upstream.path(), &shas[0])).unwrap();
    let config = OracleConfig {
        test_command: TestCommand::parse("no-such-runner-xyz {script}").unwrap(),
        ..Default::default()
    };
    let oracle = TestOracle::new(
        SubprocessRunner,
        config,
        script,
        "mylib",
        &url,
        FixCatalog::empty(),
    )
    .unwrap();
    let mut engine = BisectionEngine::new(oracle, EngineConfig::default());
    let err = engine.run(&range).await.unwrap_err();
    match err {
        BisectError::Execution { command, .. } => assert!(command.starts_with("no-such-runner-xyz ")),
        other => panic!("expected Execution, got {:?}", other),
    }
}

#[tokio::test]
async fn slow_commits_are_skipped_as_untestable() {
    let (upstream, shas) = make_upstream();
    let url = format!("file://{}", upstream.path().display());
    let repo = GitRepository::init_remote(&url, None, false).await.unwrap();
    let range = CommitRangeResolver::new(&repo)
        .resolve("good", "bad")
        .await
        .unwrap();

    // Every run hangs past the timeout.
    let text = "# /// script\n# dependencies = [\"mylib\"]\n# ///\nsleep 10\n".to_string();
    let script = ManagedScript::from_text("repro.py", text).unwrap();
    let config = OracleConfig {
        timeout_secs: 1,
        ..sh_config()
    };
    let oracle = TestOracle::new(
        SubprocessRunner,
        config,
        script,
        "mylib",
        &url,
        FixCatalog::builtin().unwrap(),
    )
    .unwrap();
    let mut engine = BisectionEngine::new(oracle, EngineConfig::default());
    let outcome = engine.run(&range).await.unwrap();

    // No run ever failed, so no commit is blamed; the bad endpoint was
    // probed as well.
    assert_eq!(outcome.first_bad, None);
    assert!(outcome.candidates.is_empty());
    assert_eq!(outcome.skipped.len(), 7);
    assert!(outcome.skipped.iter().any(|c| c.id == shas[7]));
}
