//! Merge worktree management.
//!
//! A [`MergeWorktree`] is a dedicated detached checkout of a repository's
//! working branch, used to merge worker branches off the critical path of
//! whatever else is touching the repository. Conflicted text files are
//! handed to a caller-supplied [`ConflictResolver`]; binary conflicts are
//! kept on the working-branch side with a warning.
//!
//! The worktree's git index is exclusive to the worktree directory, so two
//! `MergeWorktree`s anchored on different directories are independent.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{BoxError, GitError, MergeError};
use crate::repo::GitRepo;

// ---------------------------------------------------------------------------
// ConflictResolver
// ---------------------------------------------------------------------------

/// Everything a resolver needs to arbitrate one conflicted text file.
#[derive(Clone, Debug)]
pub struct ConflictRequest {
    /// Conflicted path, relative to the worktree root.
    pub path: String,
    /// Content on the working branch side (`HEAD`). Empty if absent there.
    pub ours: String,
    /// Content on the incoming branch side. Empty if absent there.
    pub theirs: String,
    /// Content at the merge base. Empty when the sides share no ancestor
    /// for this path (add/add).
    pub base: String,
    /// Title of the task whose branch is being merged.
    pub task_title: String,
    /// Description of the task whose branch is being merged.
    pub task_description: String,
}

/// Arbitrates merge conflicts: given both sides and the base, returns the
/// full resolved file content.
///
/// Supplied by the embedding application (typically an LLM call). An error
/// aborts the merge in progress.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Produce the resolved content for one conflicted file.
    ///
    /// # Errors
    /// Any error aborts the merge; the task that produced the branch is
    /// failed and requeued by the caller.
    async fn resolve(&self, request: ConflictRequest) -> Result<String, BoxError>;
}

// ---------------------------------------------------------------------------
// MergeOutcome
// ---------------------------------------------------------------------------

/// Result of a successful merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The merge commit id (new `HEAD` of the worktree).
    pub commit: String,
    /// How many conflicted text files the resolver arbitrated.
    /// Zero means the merge was clean.
    pub resolved_conflicts: usize,
}

impl MergeOutcome {
    /// Whether the resolver had to arbitrate any conflicts.
    #[must_use]
    pub fn was_conflicted(&self) -> bool {
        self.resolved_conflicts > 0
    }
}

// ---------------------------------------------------------------------------
// MergeWorktree
// ---------------------------------------------------------------------------

/// A dedicated detached worktree anchored on a working branch.
pub struct MergeWorktree {
    repo: GitRepo,
    dir: PathBuf,
    working_branch: String,
}

impl MergeWorktree {
    /// Create a merge worktree at `dir`, detached at the tip of
    /// `working_branch`. Any prior worktree at the same directory is
    /// removed first.
    ///
    /// # Errors
    /// Returns an error if the branch does not exist or the worktree
    /// cannot be created.
    pub async fn create(
        repo_root: impl Into<PathBuf>,
        dir: impl Into<PathBuf>,
        working_branch: &str,
    ) -> Result<Self, GitError> {
        let repo = GitRepo::new(repo_root);
        let dir = dir.into();

        // Clean any prior worktree at this path. Removal failure is fine
        // (the path may simply not be registered); a leftover directory is
        // not — `worktree add` refuses to reuse it.
        let dir_str = dir.to_string_lossy().into_owned();
        let _ = repo
            .output_in(repo.root(), &["worktree", "remove", "--force", &dir_str])
            .await;
        let _ = repo.output_in(repo.root(), &["worktree", "prune"]).await;
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        repo.run(&["worktree", "add", "--detach", &dir_str, working_branch])
            .await?;

        Ok(Self {
            repo,
            dir,
            working_branch: working_branch.to_owned(),
        })
    }

    /// The worktree directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The branch this worktree is anchored on.
    #[must_use]
    pub fn working_branch(&self) -> &str {
        &self.working_branch
    }

    /// Remove the worktree from disk and from git's bookkeeping.
    ///
    /// # Errors
    /// Returns an error if git refuses the removal.
    pub async fn remove(&self) -> Result<(), GitError> {
        let dir_str = self.dir.to_string_lossy().into_owned();
        self.repo
            .run(&["worktree", "remove", "--force", &dir_str])
            .await?;
        Ok(())
    }

    /// Merge `other_branch` into the worktree's `HEAD`.
    ///
    /// A clean merge commits with message `"Merge <branch>: <title>"` and
    /// returns immediately. On conflicts, each conflicted text file is
    /// arbitrated by `resolver`; binary conflicts are kept on the working
    /// branch side with a warning. If no resolver is supplied, or no text
    /// file could be resolved, the merge is aborted.
    ///
    /// # Errors
    /// - [`MergeError::Failed`] — fatal git failure, or conflicts that
    ///   cannot be arbitrated. The merge has been aborted (best effort).
    /// - [`MergeError::Resolver`] — the resolver errored; merge aborted.
    pub async fn merge(
        &self,
        other_branch: &str,
        task_title: &str,
        task_description: &str,
        resolver: Option<&dyn ConflictResolver>,
    ) -> Result<MergeOutcome, MergeError> {
        let message = format!("Merge {other_branch}: {task_title}");
        let out = self
            .repo
            .output_in(&self.dir, &["merge", "--no-ff", "-m", &message, other_branch])
            .await?;

        if out.success() {
            let commit = self.repo.rev_parse_in(&self.dir, "HEAD").await?;
            debug!(branch = other_branch, %commit, "clean merge");
            return Ok(MergeOutcome {
                commit,
                resolved_conflicts: 0,
            });
        }

        if !out.combined().contains("CONFLICT") {
            self.abort_merge().await;
            return Err(MergeError::Failed {
                branch: other_branch.to_owned(),
                detail: non_empty_or(out.stderr.trim(), "merge exited non-zero"),
            });
        }

        let Some(resolver) = resolver else {
            self.abort_merge().await;
            return Err(MergeError::Failed {
                branch: other_branch.to_owned(),
                detail: "merge conflicts and no resolver supplied".to_owned(),
            });
        };

        self.resolve_conflicts(other_branch, task_title, task_description, resolver)
            .await
    }

    /// Delete a branch in the underlying repository (not the worktree).
    ///
    /// # Errors
    /// Returns an error if the branch cannot be deleted.
    pub async fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        self.repo.delete_branch(branch).await
    }

    // -- conflict machinery -------------------------------------------------

    async fn resolve_conflicts(
        &self,
        other_branch: &str,
        task_title: &str,
        task_description: &str,
        resolver: &dyn ConflictResolver,
    ) -> Result<MergeOutcome, MergeError> {
        let paths = self.conflicted_paths().await?;
        let binaries = self.binary_paths().await?;
        let base_rev = self.merge_base(other_branch).await;

        let mut resolved = 0usize;
        for path in &paths {
            if binaries.contains(path) {
                warn!(%path, "binary conflict, keeping working branch side");
                if let Err(e) = self.keep_ours(path).await {
                    self.abort_merge().await;
                    return Err(MergeError::Failed {
                        branch: other_branch.to_owned(),
                        detail: format!("cannot keep our side of binary `{path}`: {e}"),
                    });
                }
                continue;
            }

            let ours = self.show_or_empty("HEAD", path).await;
            let theirs = self.show_or_empty(other_branch, path).await;
            let base = match &base_rev {
                Some(rev) => self.show_or_empty(rev, path).await,
                None => String::new(),
            };

            let content = resolver
                .resolve(ConflictRequest {
                    path: path.clone(),
                    ours,
                    theirs,
                    base,
                    task_title: task_title.to_owned(),
                    task_description: task_description.to_owned(),
                })
                .await;
            let content = match content {
                Ok(c) => c,
                Err(source) => {
                    self.abort_merge().await;
                    return Err(MergeError::Resolver {
                        path: path.clone(),
                        source,
                    });
                }
            };

            tokio::fs::write(self.dir.join(path), content).await.map_err(GitError::Io)?;
            self.repo.run_in(&self.dir, &["add", "--", path.as_str()]).await?;
            resolved += 1;
            debug!(%path, "conflict resolved");
        }

        if resolved == 0 {
            self.abort_merge().await;
            return Err(MergeError::Failed {
                branch: other_branch.to_owned(),
                detail: "every conflicted path is binary; nothing to resolve".to_owned(),
            });
        }

        self.repo.run_in(&self.dir, &["commit", "--no-edit"]).await?;
        let commit = self.repo.rev_parse_in(&self.dir, "HEAD").await?;
        debug!(branch = other_branch, %commit, resolved, "merge committed after resolution");
        Ok(MergeOutcome {
            commit,
            resolved_conflicts: resolved,
        })
    }

    /// Paths still unmerged in the worktree index.
    async fn conflicted_paths(&self) -> Result<Vec<String>, GitError> {
        let out = self
            .repo
            .run_in(&self.dir, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out.lines().map(str::to_owned).filter(|l| !l.is_empty()).collect())
    }

    /// Paths numstat reports as binary (`-\t-\t<path>`).
    async fn binary_paths(&self) -> Result<Vec<String>, GitError> {
        let out = self.repo.run_in(&self.dir, &["diff", "--numstat"]).await?;
        Ok(out
            .lines()
            .filter_map(|line| line.strip_prefix("-\t-\t"))
            .map(str::to_owned)
            .collect())
    }

    /// Merge base of `HEAD` and `branch`, if they share one.
    async fn merge_base(&self, branch: &str) -> Option<String> {
        let out = self
            .repo
            .output_in(&self.dir, &["merge-base", "HEAD", branch])
            .await
            .ok()?;
        if out.success() {
            let oid = out.stdout.trim();
            (!oid.is_empty()).then(|| oid.to_owned())
        } else {
            None
        }
    }

    /// Content of `rev:path`, or empty when the path is absent on that side.
    async fn show_or_empty(&self, rev: &str, path: &str) -> String {
        let spec = format!("{rev}:{path}");
        match self.repo.output_in(&self.dir, &["show", &spec]).await {
            Ok(out) if out.success() => out.stdout,
            _ => String::new(),
        }
    }

    /// Stage the working-branch side of a binary conflict.
    async fn keep_ours(&self, path: &str) -> Result<(), GitError> {
        self.repo
            .run_in(&self.dir, &["checkout", "--ours", "--", path])
            .await?;
        self.repo.run_in(&self.dir, &["add", "--", path]).await?;
        Ok(())
    }

    /// Abort an in-progress merge. Failure is logged, not fatal — the
    /// worktree stays recoverable either way.
    async fn abort_merge(&self) {
        match self.repo.output_in(&self.dir, &["merge", "--abort"]).await {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(stderr = out.stderr.trim(), "merge --abort failed"),
            Err(e) => warn!(error = %e, "merge --abort failed"),
        }
    }
}

fn non_empty_or(s: &str, fallback: &str) -> String {
    if s.is_empty() { fallback.to_owned() } else { s.to_owned() }
}
