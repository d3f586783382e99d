//! Shared test infrastructure.
#![allow(dead_code)]
//!
//! Provides [`TestRepo`], a self-contained git repository in a temporary
//! directory, plus handler stubs and polling helpers. Each `TestRepo` runs
//! real git commands and is deleted on drop, so tests are parallel-safe.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use drover::model::{BranchName, Task, TaskId, TaskResult, TaskStatus};
use drover::tasks::TaskStore;
use drover::worker::TaskHandler;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// TestRepo
// ---------------------------------------------------------------------------

/// A git repository in a temp dir, seeded with one commit on `main`.
///
/// The repository lives under `repo/` inside the temp dir so merge
/// worktrees can be placed next to it rather than inside its working tree
/// (where a stray `git add .` would pick them up).
pub struct TestRepo {
    dir: TempDir,
    root: PathBuf,
}

impl TestRepo {
    /// Initialize a repo with an initial commit holding `README.md`.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().join("repo");
        std::fs::create_dir_all(&root).expect("mkdir");
        run_git(&root, &["init", "-b", "main"]);
        run_git(&root, &["config", "user.email", "test@test.invalid"]);
        run_git(&root, &["config", "user.name", "Test"]);
        std::fs::write(root.join("README.md"), "# Test\n").expect("write");
        run_git(&root, &["add", "."]);
        run_git(&root, &["commit", "-m", "initial"]);
        Self { dir, root }
    }

    /// The repository root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A scratch path next to the repository for the merge worktree.
    pub fn merge_worktree_dir(&self) -> PathBuf {
        self.dir.path().join("merge-wt")
    }

    /// Create `branch` off `main`, commit the given files to it, and
    /// return to `main`.
    pub fn branch_with_files(&self, branch: &str, files: &[(&str, &str)]) {
        run_git(&self.root, &["checkout", "-b", branch]);
        self.commit_files(files, &format!("work on {branch}"));
        run_git(&self.root, &["checkout", "main"]);
    }

    /// Commit files onto the current branch.
    pub fn commit_files(&self, files: &[(&str, &str)], message: &str) {
        for (path, content) in files {
            let full = self.root.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).expect("mkdir");
            }
            std::fs::write(full, content).expect("write");
        }
        run_git(&self.root, &["add", "."]);
        run_git(&self.root, &["commit", "-m", message]);
    }

    /// Whether a local branch exists.
    pub fn has_branch(&self, branch: &str) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .current_dir(&self.root)
            .output()
            .expect("git rev-parse")
            .status
            .success()
    }

    /// `git show <rev>:<path>`, if it exists.
    pub fn show(&self, rev: &str, path: &str) -> Option<String> {
        let out = Command::new("git")
            .args(["show", &format!("{rev}:{path}")])
            .current_dir(&self.root)
            .output()
            .expect("git show");
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Run a git command, panicking on failure. Test-only plumbing.
pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to spawn git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Succeeds immediately with branch `agent/<worker>/<task>` and a summary.
pub struct BranchingHandler {
    pub worker: String,
}

#[async_trait]
impl TaskHandler for BranchingHandler {
    async fn run(&self, _cancel: CancellationToken, task: Task) -> anyhow::Result<TaskResult> {
        Ok(TaskResult {
            branch: Some(BranchName::new(&format!("agent/{}/{}", self.worker, task.id))?),
            summary: "done".to_owned(),
            ..TaskResult::default()
        })
    }
}

/// Succeeds with a summary only (no branch).
pub struct SummaryHandler;

#[async_trait]
impl TaskHandler for SummaryHandler {
    async fn run(&self, _cancel: CancellationToken, _task: Task) -> anyhow::Result<TaskResult> {
        Ok(TaskResult {
            summary: "done".to_owned(),
            ..TaskResult::default()
        })
    }
}

/// Commits a real file to a real branch in a [`TestRepo`], then reports it.
pub struct RepoHandler {
    pub repo_root: PathBuf,
    pub worker: String,
}

#[async_trait]
impl TaskHandler for RepoHandler {
    async fn run(&self, _cancel: CancellationToken, task: Task) -> anyhow::Result<TaskResult> {
        let branch = format!("agent/{}/{}", self.worker, task.id);
        run_git(&self.repo_root, &["checkout", "-b", &branch]);
        let file = format!("{}.txt", task.id);
        std::fs::write(self.repo_root.join(&file), format!("{}\n", task.title))?;
        run_git(&self.repo_root, &["add", "."]);
        run_git(&self.repo_root, &["commit", "-m", &format!("complete {}", task.id)]);
        run_git(&self.repo_root, &["checkout", "main"]);
        Ok(TaskResult {
            branch: Some(BranchName::new(&branch)?),
            summary: format!("committed {file}"),
            ..TaskResult::default()
        })
    }
}

/// Always succeeds with fixed content — the literal resolver of the merge
/// scenarios.
pub struct LiteralResolver(pub &'static str);

#[async_trait]
impl drover::git::ConflictResolver for LiteralResolver {
    async fn resolve(
        &self,
        _request: drover::git::ConflictRequest,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.0.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Polling helpers
// ---------------------------------------------------------------------------

/// Poll `check` every 20 ms until it returns true or `deadline` elapses.
pub async fn wait_until<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Wait until the task reaches `status`, panicking on timeout.
pub async fn wait_for_status(
    tasks: &TaskStore,
    id: &TaskId,
    status: TaskStatus,
    deadline: Duration,
) -> Task {
    let ok = wait_until(deadline, || async {
        tasks.get(id).await.is_ok_and(|t| t.status == status)
    })
    .await;
    assert!(ok, "task {id} never reached {status}");
    tasks.get(id).await.expect("task exists")
}

/// Arc a handler — shorthand for the call sites.
pub fn handler(h: impl TaskHandler + 'static) -> Arc<dyn TaskHandler> {
    Arc::new(h)
}
