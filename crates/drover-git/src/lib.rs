//! Git plumbing for drover.
//!
//! This crate is the only place drover talks to git. Everything goes through
//! a POSIX `git` executable on `PATH`; there is no in-process git library.
//! Subprocesses are spawned on the tokio runtime with kill-on-drop, so
//! cancelling a caller's future kills the underlying `git` process.
//!
//! # Crate layout
//!
//! - [`repo`] — [`GitRepo`], a thin async command runner rooted at a repository.
//! - [`worktree`] — [`MergeWorktree`], a dedicated detached worktree used to
//!   merge worker branches into a shared working branch, with pluggable
//!   conflict resolution via [`ConflictResolver`].
//! - [`error`] — [`GitError`] and [`MergeError`].

pub mod error;
pub mod repo;
pub mod worktree;

pub use error::{GitError, MergeError};
pub use repo::{GitOutput, GitRepo};
pub use worktree::{ConflictRequest, ConflictResolver, MergeOutcome, MergeWorktree};
