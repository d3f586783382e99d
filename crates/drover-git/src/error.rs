//! Error types for git operations.
//!
//! [`GitError`] covers plumbing failures (a command exited non-zero, the
//! subprocess could not be spawned, output was unparseable). [`MergeError`]
//! covers the merge pipeline, where the caller needs to distinguish a fatal
//! merge from a resolver failure in order to pick the right task transition.

use thiserror::Error;

/// Boxed error for collaborator-supplied callbacks (conflict resolvers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from running `git` subprocesses.
#[derive(Debug, Error)]
pub enum GitError {
    /// A git command exited with a non-zero status.
    #[error("`{command}` failed{}: {stderr}", exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    Command {
        /// The command that was run (e.g. `"git worktree add"`).
        command: String,
        /// Captured stderr, trimmed.
        stderr: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
    },

    /// The subprocess could not be spawned or its output could not be read.
    #[error("I/O error running git: {0}")]
    Io(#[from] std::io::Error),

    /// A command succeeded but produced output we could not interpret.
    #[error("unexpected output from `{command}`: {reason}")]
    Parse {
        /// The command that was run.
        command: String,
        /// Why the output was rejected.
        reason: String,
    },
}

/// Errors from [`MergeWorktree::merge`](crate::MergeWorktree::merge).
#[derive(Debug, Error)]
pub enum MergeError {
    /// The merge cannot complete: a non-conflict git failure, conflicts with
    /// no resolver supplied, or conflicts where no text file could be
    /// resolved. The merge has been aborted (best effort).
    #[error("merge of `{branch}` failed: {detail}")]
    Failed {
        /// The branch being merged in.
        branch: String,
        /// What went wrong.
        detail: String,
    },

    /// The conflict resolver returned an error; the merge has been aborted.
    #[error("conflict resolver failed for `{path}`")]
    Resolver {
        /// The conflicted path the resolver was working on.
        path: String,
        /// The resolver's error.
        #[source]
        source: BoxError,
    },

    /// An underlying git command failed outside the merge-conflict protocol.
    #[error(transparent)]
    Git(#[from] GitError),
}
