//! Agent registry.
//!
//! Cards live in the `agents` bucket, keyed by agent id. Registration is an
//! unconditional write; every other mutation is a read-modify-write guarded
//! by the card's revision, retried with jitter on conflict — heartbeats and
//! status updates are idempotent, so losing a race and retrying on the new
//! value is always correct.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info};

use crate::bus::{BusError, Kv, Revision};
use crate::model::{now_millis, AgentCard, AgentId, AgentStatus, TaskId};

/// How many CAS rounds a read-modify-write gets before giving up.
const CAS_RETRIES: u32 = 8;

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No card exists for the agent.
    #[error("agent `{id}` is not registered")]
    NotFound {
        /// The missing agent.
        id: AgentId,
    },

    /// A read-modify-write kept losing CAS races.
    #[error("gave up updating agent `{id}` after {CAS_RETRIES} conflicts")]
    RetriesExhausted {
        /// The contested agent.
        id: AgentId,
    },

    /// A stored card cannot be decoded.
    #[error("corrupt card for agent `{id}`")]
    Corrupt {
        /// The agent whose card is unreadable.
        id: AgentId,
        /// The decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// The underlying bus failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

/// Register, heartbeat, list, and staleness-sweep agent cards.
#[derive(Clone)]
pub struct AgentRegistry {
    kv: Kv,
}

impl AgentRegistry {
    /// Wrap the `agents` bucket.
    #[must_use]
    pub const fn new(kv: Kv) -> Self {
        Self { kv }
    }

    /// Register (or re-register) an agent: status forced to idle, heartbeat
    /// stamped now, any existing card overwritten.
    ///
    /// # Errors
    /// Bus failure.
    pub async fn register(&self, mut card: AgentCard) -> Result<(), RegistryError> {
        card.status = AgentStatus::Idle;
        card.last_heartbeat = now_millis();
        let value = encode(&card);
        self.kv.put(card.id.as_str(), &value).await?;
        info!(component = "registry", agent_id = %card.id, "agent registered");
        Ok(())
    }

    /// Bump the agent's heartbeat, preserving every other field.
    ///
    /// # Errors
    /// [`RegistryError::NotFound`] for unknown agents; bus failure.
    pub async fn heartbeat(&self, id: &AgentId) -> Result<(), RegistryError> {
        self.update(id, |card| {
            card.last_heartbeat = now_millis();
        })
        .await
    }

    /// Set the agent's status and current task, bumping the heartbeat —
    /// any status update proves liveness.
    ///
    /// # Errors
    /// [`RegistryError::NotFound`] for unknown agents; bus failure.
    pub async fn update_status(
        &self,
        id: &AgentId,
        status: AgentStatus,
        current_task: Option<TaskId>,
    ) -> Result<(), RegistryError> {
        self.update(id, move |card| {
            card.status = status;
            card.current_task = current_task.clone();
            card.last_heartbeat = now_millis();
        })
        .await
    }

    /// Fetch one card.
    ///
    /// # Errors
    /// [`RegistryError::NotFound`] when no card exists; bus failure.
    pub async fn get(&self, id: &AgentId) -> Result<AgentCard, RegistryError> {
        let (card, _) = self.get_with_revision(id).await?;
        Ok(card)
    }

    /// Fetch every card.
    ///
    /// # Errors
    /// Bus failure, or a card that cannot be decoded.
    pub async fn list(&self) -> Result<Vec<AgentCard>, RegistryError> {
        let mut cards = Vec::new();
        for key in self.kv.list_keys().await? {
            if let Some((value, _)) = self.kv.get(&key).await? {
                cards.push(decode(&key, &value)?);
            }
        }
        Ok(cards)
    }

    /// Cards that are not offline and have not heartbeat within `max_age`.
    ///
    /// # Errors
    /// Bus failure.
    pub async fn find_stale_agents(
        &self,
        max_age: Duration,
    ) -> Result<Vec<AgentCard>, RegistryError> {
        let now = now_millis();
        let max_age_millis = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|card| card.is_stale(now, max_age_millis))
            .collect())
    }

    /// Transition every stale card to offline, preserving `current_task`
    /// for diagnostic replay. Returns the cards that were transitioned.
    ///
    /// # Errors
    /// Bus failure.
    pub async fn mark_stale_agents_offline(
        &self,
        max_age: Duration,
    ) -> Result<Vec<AgentCard>, RegistryError> {
        let mut marked = Vec::new();
        for card in self.find_stale_agents(max_age).await? {
            // Heartbeat untouched: the card records when the agent was last
            // actually alive. A CAS loss means someone else touched the card
            // (possibly the agent coming back) — skip it this round.
            let result = self
                .update(&card.id, |card| {
                    card.status = AgentStatus::Offline;
                })
                .await;
            match result {
                Ok(()) => {
                    info!(component = "registry", agent_id = %card.id, "agent marked offline");
                    let mut offline = card;
                    offline.status = AgentStatus::Offline;
                    marked.push(offline);
                }
                Err(RegistryError::NotFound { .. } | RegistryError::RetriesExhausted { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(marked)
    }

    // -- internals ----------------------------------------------------------

    async fn get_with_revision(
        &self,
        id: &AgentId,
    ) -> Result<(AgentCard, Revision), RegistryError> {
        let Some((value, revision)) = self.kv.get(id.as_str()).await? else {
            return Err(RegistryError::NotFound { id: id.clone() });
        };
        Ok((decode(id.as_str(), &value)?, revision))
    }

    /// CAS read-modify-write loop with jittered backoff.
    async fn update(
        &self,
        id: &AgentId,
        mutate: impl Fn(&mut AgentCard),
    ) -> Result<(), RegistryError> {
        for _ in 0..CAS_RETRIES {
            let (mut card, revision) = self.get_with_revision(id).await?;
            mutate(&mut card);
            match self
                .kv
                .compare_and_put(id.as_str(), &encode(&card), revision)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    debug!(component = "registry", agent_id = %id, "card CAS conflict, retrying");
                    let wait = rand::rng().random_range(5..25);
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(RegistryError::RetriesExhausted { id: id.clone() })
    }
}

fn encode(card: &AgentCard) -> String {
    serde_json::to_string(card).unwrap_or_default()
}

fn decode(key: &str, value: &str) -> Result<AgentCard, RegistryError> {
    serde_json::from_str(value).map_err(|source| RegistryError::Corrupt {
        id: AgentId::new(key).unwrap_or_else(|_| AgentId::new("unknown").expect("valid id")),
        source,
    })
}
