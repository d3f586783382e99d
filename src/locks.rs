//! File locks.
//!
//! A lock key is `<repo>::<path>` in the `locks` bucket; the key exists iff
//! some agent holds the lock. Acquisition is a KV create, so two agents
//! racing for the same file are serialized by the bucket — the loser gets
//! the current holder back in the error.
//!
//! Release deliberately does not verify the holder: the monitor releases
//! locks on behalf of agents that stopped heartbeating.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::bus::{BusError, Kv};
use crate::model::{now_millis, AgentId, TaskId};

/// Separates repo from path in lock keys. Paths may contain `/`, so a plain
/// joiner would be ambiguous.
const KEY_SEPARATOR: &str = "::";

// ---------------------------------------------------------------------------
// FileLock
// ---------------------------------------------------------------------------

/// Who holds a file and for which task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLock {
    /// The holding agent.
    pub agent_id: AgentId,
    /// The task the agent is editing the file for.
    pub task_id: TaskId,
    /// When the lock was taken (unix millis).
    pub locked_at: u64,
}

// ---------------------------------------------------------------------------
// LockError
// ---------------------------------------------------------------------------

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The file is already locked; the error names the current holder.
    #[error("`{repo}/{path}` is locked by agent `{holder}`")]
    Held {
        /// Repository half of the key.
        repo: String,
        /// Path half of the key.
        path: String,
        /// The agent currently holding the lock.
        holder: AgentId,
    },

    /// A stored lock cannot be decoded.
    #[error("corrupt lock record for `{key}`")]
    Corrupt {
        /// The offending lock key.
        key: String,
        /// The decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// The underlying bus failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

/// Acquire and release file locks.
#[derive(Clone)]
pub struct LockManager {
    kv: Kv,
}

impl LockManager {
    /// Wrap the `locks` bucket.
    #[must_use]
    pub const fn new(kv: Kv) -> Self {
        Self { kv }
    }

    /// Take the lock on `(repo, path)` for `agent` working on `task`.
    ///
    /// # Errors
    /// [`LockError::Held`] when another agent holds it; bus failure.
    pub async fn acquire(
        &self,
        repo: &str,
        path: &str,
        agent: &AgentId,
        task: &TaskId,
    ) -> Result<FileLock, LockError> {
        let lock = FileLock {
            agent_id: agent.clone(),
            task_id: task.clone(),
            locked_at: now_millis(),
        };
        let key = lock_key(repo, path);
        let value = serde_json::to_string(&lock).unwrap_or_default();
        match self.kv.create(&key, &value).await {
            Ok(_) => {
                debug!(component = "locks", agent_id = %agent, %key, "lock acquired");
                Ok(lock)
            }
            Err(BusError::AlreadyExists { .. }) => {
                let holder = self
                    .get(repo, path)
                    .await?
                    .map_or_else(|| agent.clone(), |l| l.agent_id);
                Err(LockError::Held {
                    repo: repo.to_owned(),
                    path: path.to_owned(),
                    holder,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the lock on `(repo, path)`. The holder is not re-checked;
    /// releasing an unheld lock is a no-op.
    ///
    /// # Errors
    /// Bus failure.
    pub async fn release(&self, repo: &str, path: &str) -> Result<(), LockError> {
        self.kv.delete(&lock_key(repo, path)).await?;
        Ok(())
    }

    /// Current holder of `(repo, path)`, if any.
    ///
    /// # Errors
    /// Bus failure, or an unreadable lock record.
    pub async fn get(&self, repo: &str, path: &str) -> Result<Option<FileLock>, LockError> {
        let key = lock_key(repo, path);
        match self.kv.get(&key).await? {
            Some((value, _)) => Ok(Some(decode(&key, &value)?)),
            None => Ok(None),
        }
    }

    /// Drop every lock held by `agent`, returning how many were released.
    /// The monitor calls this for agents that stopped heartbeating.
    ///
    /// # Errors
    /// Bus failure, or an unreadable lock record.
    pub async fn release_by_agent(&self, agent: &AgentId) -> Result<usize, LockError> {
        let mut released = 0;
        for key in self.kv.list_keys().await? {
            let Some((value, _)) = self.kv.get(&key).await? else {
                continue;
            };
            let lock = decode(&key, &value)?;
            if lock.agent_id == *agent {
                self.kv.delete(&key).await?;
                released += 1;
            }
        }
        if released > 0 {
            info!(component = "locks", agent_id = %agent, released, "released locks of agent");
        }
        Ok(released)
    }
}

fn lock_key(repo: &str, path: &str) -> String {
    format!("{repo}{KEY_SEPARATOR}{path}")
}

fn decode(key: &str, value: &str) -> Result<FileLock, LockError> {
    serde_json::from_str(value).map_err(|source| LockError::Corrupt {
        key: key.to_owned(),
        source,
    })
}
