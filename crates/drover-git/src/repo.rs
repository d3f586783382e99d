//! Async `git` subprocess runner.
//!
//! [`GitRepo`] is rooted at a repository directory and runs `git` commands
//! there (or in an explicitly supplied directory, for worktree operations).
//! Commands are spawned with `kill_on_drop`, so dropping an in-flight future
//! — e.g. because a cancellation token fired — kills the subprocess.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::trace;

use crate::error::GitError;

// ---------------------------------------------------------------------------
// GitOutput
// ---------------------------------------------------------------------------

/// Captured result of a git command, success or not.
///
/// Most callers want [`GitRepo::run`], which turns a non-zero exit into
/// [`GitError::Command`]. The merge pipeline needs the raw output to
/// classify conflicts, so it uses [`GitRepo::output_in`] and inspects this.
#[derive(Debug)]
pub struct GitOutput {
    /// Captured stdout, lossily decoded.
    pub stdout: String,
    /// Captured stderr, lossily decoded.
    pub stderr: String,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
}

impl GitOutput {
    /// Whether the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout and stderr concatenated, for pattern checks on merge output.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut s = self.stdout.clone();
        s.push_str(&self.stderr);
        s
    }
}

// ---------------------------------------------------------------------------
// GitRepo
// ---------------------------------------------------------------------------

/// A handle to a git repository, identified by its root directory.
#[derive(Clone, Debug)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    /// Create a handle rooted at `root` (the directory containing `.git`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The repository root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run a git command at the repository root and return its stdout.
    ///
    /// # Errors
    /// Returns [`GitError::Command`] on non-zero exit, [`GitError::Io`] if
    /// the process could not be spawned.
    pub async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        self.run_in(&self.root, args).await
    }

    /// Run a git command in `dir` and return its stdout.
    ///
    /// # Errors
    /// Returns [`GitError::Command`] on non-zero exit, [`GitError::Io`] if
    /// the process could not be spawned.
    pub async fn run_in(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let out = self.output_in(dir, args).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(GitError::Command {
                command: format!("git {}", args.join(" ")),
                stderr: out.stderr.trim().to_owned(),
                exit_code: out.exit_code,
            })
        }
    }

    /// Run a git command in `dir` and return the raw captured output,
    /// regardless of exit status.
    ///
    /// # Errors
    /// Returns [`GitError::Io`] if the process could not be spawned.
    pub async fn output_in(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        trace!(dir = %dir.display(), ?args, "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(GitOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    /// Resolve a revision to a full object id in `dir`.
    ///
    /// # Errors
    /// Returns an error if the revision does not resolve.
    pub async fn rev_parse_in(&self, dir: &Path, rev: &str) -> Result<String, GitError> {
        let out = self.run_in(dir, &["rev-parse", rev]).await?;
        let oid = out.trim();
        if oid.is_empty() {
            return Err(GitError::Parse {
                command: format!("git rev-parse {rev}"),
                reason: "empty output".to_owned(),
            });
        }
        Ok(oid.to_owned())
    }

    /// Delete a branch in the main repository (`git branch -D`).
    ///
    /// # Errors
    /// Returns an error if the branch does not exist or cannot be deleted.
    pub async fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        self.run(&["branch", "-D", name]).await?;
        Ok(())
    }
}
