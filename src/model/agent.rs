//! Agent cards — the self-descriptions agents publish to the cluster.

use serde::{Deserialize, Serialize};

use super::types::{AgentId, TaskId};
use super::now_millis;

// ---------------------------------------------------------------------------
// AgentStatus
// ---------------------------------------------------------------------------

/// What an agent is currently doing.
///
/// `Offline` is terminal but revivable: a fresh heartbeat or registration
/// brings the agent back. Cards are never deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered and polling for work.
    #[default]
    Idle,
    /// Executing a task.
    Working,
    /// Missed heartbeats past the staleness threshold.
    Offline,
}

impl AgentStatus {
    /// Stable lowercase name, matching the serde representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AgentCard
// ---------------------------------------------------------------------------

/// A participant's replicated self-description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCard {
    /// Stable identity.
    pub id: AgentId,
    /// Human-readable name.
    pub name: String,
    /// What this agent is willing to execute, ordered, deduplicated.
    pub capabilities: Vec<String>,
    /// When the agent process started (unix millis).
    pub started_at: u64,
    /// Last time the agent proved liveness (unix millis). Bumped by every
    /// status update.
    pub last_heartbeat: u64,
    /// Current status.
    pub status: AgentStatus,
    /// The task the agent is executing, if any. Preserved when the agent
    /// goes offline, for diagnostic replay.
    #[serde(default)]
    pub current_task: Option<TaskId>,
}

impl AgentCard {
    /// Create a card for a freshly started agent: idle, heartbeat stamped now.
    #[must_use]
    pub fn new(id: AgentId, name: impl Into<String>, capabilities: Vec<String>) -> Self {
        let now = now_millis();
        let mut seen = std::collections::HashSet::new();
        let mut capabilities = capabilities;
        capabilities.retain(|c| seen.insert(c.clone()));
        Self {
            id,
            name: name.into(),
            capabilities,
            started_at: now,
            last_heartbeat: now,
            status: AgentStatus::Idle,
            current_task: None,
        }
    }

    /// Whether the card's last heartbeat is older than `max_age_millis`,
    /// judged against `now`. Offline agents are never stale — they already
    /// fell off.
    #[must_use]
    pub fn is_stale(&self, now: u64, max_age_millis: u64) -> bool {
        self.status != AgentStatus::Offline && now.saturating_sub(self.last_heartbeat) > max_age_millis
    }
}
