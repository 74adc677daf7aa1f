//! Git access: a blob-less local mirror of the dependency's repository and
//! the commit range between two references.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::process::Command;

use crate::error::{BisectError, Result};
use crate::runner::ProcessGroup;

const CLONE_PREFIX: &str = "script_bisect_repo_";
const FIELD_SEP: char = '\u{1f}';
const LOG_FORMAT: &str = "--format=%H%x1f%an <%ae>%x1f%ct%x1f%s";

/// One commit of the dependency's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    /// Full object id.
    pub id: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    /// First line of the message.
    pub summary: String,
}

impl CommitRef {
    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }

    /// Human-readable multi-line description.
    pub fn describe(&self) -> String {
        format!(
            "Commit:  {}\nAuthor:  {}\nDate:    {}\nMessage: {}",
            self.id,
            self.author,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.summary
        )
    }

    fn from_log_line(line: &str) -> Result<Self> {
        let mut fields = line.splitn(4, FIELD_SEP);
        let (Some(id), Some(author), Some(ts), Some(summary)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(BisectError::Git(format!("unexpected git log line: {line:?}")));
        };
        let secs: i64 = ts
            .trim()
            .parse()
            .map_err(|_| BisectError::Git(format!("bad commit timestamp: {ts:?}")))?;
        let timestamp = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| BisectError::Git(format!("commit timestamp out of range: {secs}")))?;
        Ok(Self {
            id: id.trim().to_string(),
            author: author.to_string(),
            timestamp,
            summary: summary.to_string(),
        })
    }
}

/// Commits strictly after `good` up to and including `bad`, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSequence {
    commits: Vec<CommitRef>,
}

impl CommitSequence {
    /// Build a sequence, dropping repeated ids while keeping the first.
    pub fn from_commits(commits: Vec<CommitRef>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let commits = commits
            .into_iter()
            .filter(|c| seen.insert(c.id.clone()))
            .collect();
        Self { commits }
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CommitRef> {
        self.commits.get(index)
    }

    pub fn last(&self) -> Option<&CommitRef> {
        self.commits.last()
    }

    /// Remove and return the commit at `index`.
    pub fn remove(&mut self, index: usize) -> CommitRef {
        self.commits.remove(index)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.commits.iter().position(|c| c.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommitRef> {
        self.commits.iter()
    }

    pub fn as_slice(&self) -> &[CommitRef] {
        &self.commits
    }
}

/// Read access to a repository's history.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Make `refs` available locally. Repositories without a remote treat
    /// this as a no-op.
    async fn fetch(&self, refs: &[&str]) -> Result<()>;

    /// Resolve a branch, tag or commit id to a commit.
    async fn resolve(&self, reference: &str) -> Result<CommitRef>;

    /// Whether `ancestor` is reachable from `descendant`.
    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool>;

    /// Commits reachable from `bad` but not from `good`, oldest first.
    async fn range(&self, good: &str, bad: &str) -> Result<Vec<CommitRef>>;
}

/// Repository driven through the `git` command line.
///
/// Every git call is a child process killed when its future is dropped, so
/// cancelling a resolve stops any running fetch.
#[derive(Debug)]
pub struct GitRepository {
    path: PathBuf,
    remote: Option<String>,
    /// Holds the scratch clone; `None` for caller-owned repositories.
    _scratch: Option<TempDir>,
    fetched: Mutex<HashMap<String, String>>,
}

impl GitRepository {
    /// Use an existing local repository as is.
    pub async fn open(path: &Path) -> Result<Self> {
        let repo = Self {
            path: path.to_path_buf(),
            remote: None,
            _scratch: None,
            fetched: Mutex::new(HashMap::new()),
        };
        repo.git(&["rev-parse", "--git-dir"]).await?;
        Ok(repo)
    }

    /// Create an empty repository with `url` as `origin`.
    ///
    /// Nothing is downloaded until [`Repository::fetch`]. The directory is
    /// created under `parent` (or the system temp dir) and removed on drop
    /// unless `keep` is set.
    pub async fn init_remote(url: &str, parent: Option<&Path>, keep: bool) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(CLONE_PREFIX).disable_cleanup(keep);
        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        let url = clone_url(url);
        let repo = Self {
            path: dir.path().to_path_buf(),
            remote: Some(url.to_string()),
            _scratch: Some(dir),
            fetched: Mutex::new(HashMap::new()),
        };
        repo.git(&["init", "--quiet"]).await?;
        repo.git(&["remote", "add", "origin", url]).await?;
        tracing::debug!(path = %repo.path.display(), url, "initialized scratch repository");
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    async fn command(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let child = cmd
            .spawn()
            .map_err(|e| BisectError::Git(format!("failed to run git: {e}")))?;
        // Also takes down helpers such as upload-pack.
        let _group = ProcessGroup::new(child.id());
        child
            .wait_with_output()
            .await
            .map_err(|e| BisectError::Git(format!("failed to run git: {e}")))
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = self.command(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BisectError::Git(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn rev_parse(&self, spec: &str) -> Option<String> {
        let spec = format!("{spec}^{{commit}}");
        self.git(&["rev-parse", "--verify", "--quiet", &spec])
            .await
            .ok()
    }

    async fn fetch_one(&self, reference: &str) -> Result<String> {
        self.git(&[
            "fetch",
            "--quiet",
            "--no-tags",
            "--filter=blob:none",
            "origin",
            reference,
        ])
        .await?;
        self.rev_parse("FETCH_HEAD")
            .await
            .ok_or_else(|| BisectError::Git(format!("fetched '{reference}' but FETCH_HEAD is empty")))
    }

    async fn fetch_all(&self) -> Result<()> {
        self.git(&["fetch", "--quiet", "--tags", "--filter=blob:none", "origin"])
            .await?;
        Ok(())
    }

    fn cached(&self, reference: &str) -> Option<String> {
        self.fetched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(reference)
            .cloned()
    }
}

#[async_trait]
impl Repository for GitRepository {
    async fn fetch(&self, refs: &[&str]) -> Result<()> {
        if self.remote.is_none() {
            return Ok(());
        }
        let mut missing = false;
        for reference in refs {
            match self.fetch_one(reference).await {
                Ok(sha) => {
                    tracing::debug!(reference, sha = %sha, "fetched reference");
                    self.fetched
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert((*reference).to_string(), sha);
                }
                Err(e) => {
                    tracing::debug!(reference, error = %e, "targeted fetch failed");
                    missing = true;
                }
            }
        }
        if missing {
            tracing::info!("falling back to a full history fetch");
            self.fetch_all().await?;
        }
        Ok(())
    }

    async fn resolve(&self, reference: &str) -> Result<CommitRef> {
        let mut sha = self.cached(reference);
        for spec in [
            reference.to_string(),
            format!("refs/remotes/origin/{reference}"),
            format!("refs/tags/{reference}"),
        ] {
            if sha.is_some() {
                break;
            }
            sha = self.rev_parse(&spec).await;
        }
        let sha = sha
            .ok_or_else(|| BisectError::Range(format!("cannot resolve reference '{reference}'")))?;
        let line = self.git(&["log", "-1", LOG_FORMAT, &sha]).await?;
        CommitRef::from_log_line(&line)
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self
            .command(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(BisectError::Git(format!(
                "git merge-base failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    async fn range(&self, good: &str, bad: &str) -> Result<Vec<CommitRef>> {
        let spec = format!("{good}..{bad}");
        let out = self.git(&["log", "--reverse", LOG_FORMAT, &spec]).await?;
        out.lines()
            .filter(|l| !l.trim().is_empty())
            .map(CommitRef::from_log_line)
            .collect()
    }
}

/// A validated range ready for bisection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRange {
    /// References as the user wrote them.
    pub good_ref: String,
    pub bad_ref: String,
    pub good: CommitRef,
    pub bad: CommitRef,
    pub commits: CommitSequence,
}

/// Turns two user references into a [`ResolvedRange`].
pub struct CommitRangeResolver<'a, R: Repository + ?Sized> {
    repo: &'a R,
}

impl<'a, R: Repository + ?Sized> CommitRangeResolver<'a, R> {
    pub fn new(repo: &'a R) -> Self {
        Self { repo }
    }

    /// Fetch both references and list the commits between them.
    ///
    /// Fails with a range error when either reference is unknown or looks
    /// like a command-line option, both name
    /// the same commit, `bad` does not descend from `good`, or the range is
    /// empty.
    pub async fn resolve(&self, good: &str, bad: &str) -> Result<ResolvedRange> {
        if good == bad {
            return Err(BisectError::Range(format!(
                "good and bad references are identical ('{good}')"
            )));
        }
        for reference in [good, bad] {
            if reference.starts_with('-') {
                return Err(BisectError::Range(format!(
                    "invalid reference '{reference}': must not start with '-'"
                )));
            }
        }
        self.repo.fetch(&[good, bad]).await?;
        let good_commit = self.repo.resolve(good).await?;
        let bad_commit = self.repo.resolve(bad).await?;

        if good_commit.id == bad_commit.id {
            return Err(BisectError::Range(format!(
                "'{good}' and '{bad}' resolve to the same commit {}",
                good_commit.short_id()
            )));
        }
        if !self.repo.is_ancestor(&good_commit.id, &bad_commit.id).await? {
            return Err(BisectError::Range(format!(
                "bad ref '{bad}' is not a descendant of good ref '{good}'"
            )));
        }

        let commits = CommitSequence::from_commits(
            self.repo.range(&good_commit.id, &bad_commit.id).await?,
        );
        if commits.is_empty() {
            return Err(BisectError::Range(format!(
                "no commits between '{good}' and '{bad}'"
            )));
        }
        tracing::info!(
            good = %good_commit.short_id(),
            bad = %bad_commit.short_id(),
            commits = commits.len(),
            "resolved commit range"
        );
        Ok(ResolvedRange {
            good_ref: good.to_string(),
            bad_ref: bad.to_string(),
            good: good_commit,
            bad: bad_commit,
            commits,
        })
    }
}

/// URL suitable for `git remote add`: the `git+` scheme prefix removed.
pub fn clone_url(source: &str) -> &str {
    source.strip_prefix("git+").unwrap_or(source)
}

/// Whether `first` carries a higher version number than `second`.
///
/// Used to warn when the refs look swapped, e.g. good `v2.0` and bad `v1.0`.
/// References without a version number never compare as newer.
pub fn looks_like_newer_version(first: &str, second: &str) -> bool {
    match (version_of(first), version_of(second)) {
        (Some(a), Some(b)) => a > b,
        _ => false,
    }
}

fn version_of(reference: &str) -> Option<Vec<u64>> {
    let re = Regex::new(r"(?:^|[^0-9A-Za-z])v?(\d+(?:\.\d+)+)").ok()?;
    let caps = re.captures(reference)?;
    caps.get(1)?
        .as_str()
        .split('.')
        .map(|part| part.parse().ok())
        .collect()
}
