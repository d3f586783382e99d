//! Node configuration (`drover.toml`).
//!
//! Typed configuration for a cluster node. Missing fields use defaults;
//! a node started with no file at all gets a random id, an in-memory bus,
//! and no listener. CLI flags override file values in the binary.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::model::AgentId;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// A configuration file could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config `{}`: {source}", path.display())]
    Io {
        /// The file that failed.
        path: PathBuf,
        /// The I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("cannot parse config `{}`: {source}", path.display())]
    Parse {
        /// The file that failed.
        path: PathBuf,
        /// The TOML failure.
        #[source]
        source: toml::de::Error,
    },
}

// ---------------------------------------------------------------------------
// NodeConfig
// ---------------------------------------------------------------------------

/// Everything a node needs at boot.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// This node's agent identity. Defaults to a random `node-xxxx`.
    #[serde(default = "default_agent_id")]
    pub agent_id: AgentId,

    /// Human-readable name; defaults to the agent id at boot.
    #[serde(default)]
    pub agent_name: String,

    /// Capabilities advertised by this node's workers.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Serve the embedded bus over TCP at this address. Ignored when
    /// `bus_url` is set.
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,

    /// Directory for durable bucket logs. In-memory when unset.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,

    /// Join an existing bus as a client instead of hosting one.
    #[serde(default)]
    pub bus_url: Option<String>,

    /// Interval and staleness tuning.
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            agent_name: String::new(),
            capabilities: Vec::new(),
            listen_addr: None,
            store_dir: None,
            bus_url: None,
            timing: TimingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// A config with the given identity and everything else default.
    #[must_use]
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            ..Self::default()
        }
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    /// The file is unreadable or does not match the schema.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The display name: `agent_name`, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.agent_name.is_empty() {
            self.agent_id.as_str()
        } else {
            &self.agent_name
        }
    }
}

/// Interval and staleness tuning, all in milliseconds on disk.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingConfig {
    /// How often this node heartbeats its own card.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,

    /// How often workers poll the submitted queue.
    #[serde(default = "default_poll_ms")]
    pub worker_poll_interval_ms: u64,

    /// How often the monitor runs its recovery tick.
    #[serde(default = "default_tick_ms")]
    pub monitor_tick_interval_ms: u64,

    /// Heartbeat age past which an agent counts as gone.
    #[serde(default = "default_max_age_ms")]
    pub max_agent_age_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_ms(),
            worker_poll_interval_ms: default_poll_ms(),
            monitor_tick_interval_ms: default_tick_ms(),
            max_agent_age_ms: default_max_age_ms(),
        }
    }
}

impl TimingConfig {
    /// Heartbeat interval as a [`Duration`].
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Worker poll interval as a [`Duration`].
    #[must_use]
    pub const fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    /// Monitor tick interval as a [`Duration`].
    #[must_use]
    pub const fn monitor_tick_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_tick_interval_ms)
    }

    /// Maximum agent heartbeat age as a [`Duration`].
    #[must_use]
    pub const fn max_agent_age(&self) -> Duration {
        Duration::from_millis(self.max_agent_age_ms)
    }
}

fn default_agent_id() -> AgentId {
    let suffix: u32 = rand::random_range(0..0x1_0000);
    AgentId::new(&format!("node-{suffix:04x}")).expect("generated id is valid")
}

const fn default_heartbeat_ms() -> u64 {
    10_000
}

const fn default_poll_ms() -> u64 {
    500
}

const fn default_tick_ms() -> u64 {
    5_000
}

const fn default_max_age_ms() -> u64 {
    30_000
}
