//! Embedded message bus: subject pub/sub plus revisioned KV buckets.
//!
//! A [`Bus`] lives inside the node that hosts it. Other nodes reach the same
//! state through the TCP [`server`] / [`client`] pair; stores are written
//! once against [`BusHandle`] and [`Kv`], which dispatch to either side.
//!
//! Buckets are named [`AGENTS_BUCKET`], [`TASKS_BUCKET`], [`LOCKS_BUCKET`],
//! and [`CLUSTER_BUCKET`]. Writes are durable when the bus is opened with a
//! store directory.

pub mod client;
pub mod kv;
pub mod server;
pub mod subjects;
pub mod wire;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;

pub use client::{RemoteBucket, RemoteBus};
pub use kv::{Bucket, Entry, EntryOp, Revision};
pub use subjects::{Message, SubjectRouter};

/// Bucket holding agent cards, keyed by agent id.
pub const AGENTS_BUCKET: &str = "agents";
/// Bucket holding tasks, keyed by task id.
pub const TASKS_BUCKET: &str = "tasks";
/// Bucket holding file locks, keyed by `<repo>::<path>`.
pub const LOCKS_BUCKET: &str = "locks";
/// Bucket holding node bootstrap records, keyed by agent id.
pub const CLUSTER_BUCKET: &str = "cluster";

// ---------------------------------------------------------------------------
// BusError
// ---------------------------------------------------------------------------

/// Errors from bus and KV operations.
///
/// The two conflict variants are the CAS protocol: callers branch on them,
/// so they carry the revisions involved rather than prose.
#[derive(Debug, Error)]
pub enum BusError {
    /// A compare-and-put lost: the key's revision is not what was expected.
    #[error("revision conflict on `{key}`: expected {expected}, found {current}")]
    RevisionConflict {
        /// The contested key.
        key: String,
        /// The guard revision the caller supplied.
        expected: Revision,
        /// The revision actually present (0 when the key is absent).
        current: Revision,
    },

    /// A create (or CAS-against-absent) found the key already present.
    #[error("key `{key}` already exists at revision {current}")]
    AlreadyExists {
        /// The contested key.
        key: String,
        /// The revision of the existing entry.
        current: Revision,
    },

    /// The durable log could not be read or written.
    #[error("bucket store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The durable log exists but cannot be parsed.
    #[error("corrupt bucket log at {}: {reason}", path.display())]
    CorruptLog {
        /// Path of the offending log file.
        path: PathBuf,
        /// First problem encountered.
        reason: String,
    },

    /// The remote bus connection failed mid-request.
    #[error("bus transport error: {message}")]
    Transport {
        /// What the transport reported.
        message: String,
    },

    /// The bus client has shut down; no further requests will succeed.
    #[error("bus connection closed")]
    Closed,
}

impl BusError {
    /// Whether this is a CAS-style conflict rather than a transport or
    /// storage failure.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::RevisionConflict { .. } | Self::AlreadyExists { .. })
    }
}

// ---------------------------------------------------------------------------
// Bus (embedded)
// ---------------------------------------------------------------------------

struct BusInner {
    router: SubjectRouter,
    buckets: Mutex<HashMap<String, Bucket>>,
    store_dir: Option<PathBuf>,
}

/// The embedded bus: one per hosting node, shared by reference everywhere
/// else in the process, and optionally served over TCP.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Open a bus. With a store directory, buckets replay and append their
    /// JSONL logs there; without one, state is in-memory only.
    ///
    /// # Errors
    /// Returns an error if the store directory cannot be created.
    pub fn open(store_dir: Option<PathBuf>) -> Result<Self, BusError> {
        if let Some(dir) = &store_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            inner: Arc::new(BusInner {
                router: SubjectRouter::new(),
                buckets: Mutex::new(HashMap::new()),
                store_dir,
            }),
        })
    }

    /// Open-or-create a bucket by name. Buckets are cached: every caller
    /// sees the same instance.
    ///
    /// # Errors
    /// Returns an error if the bucket's log cannot be opened or replayed.
    pub fn bucket(&self, name: &str) -> Result<Bucket, BusError> {
        let mut buckets = self
            .inner
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(bucket) = buckets.get(name) {
            return Ok(bucket.clone());
        }
        let bucket = Bucket::open(name, self.inner.store_dir.as_deref())?;
        buckets.insert(name.to_owned(), bucket.clone());
        Ok(bucket)
    }

    /// Publish `payload` on `subject`.
    pub fn publish(&self, subject: &str, payload: &str) {
        self.inner.router.publish(subject, payload);
    }

    /// Subscribe to subjects matching `filter`.
    #[must_use]
    pub fn subscribe(&self, filter: &str) -> mpsc::UnboundedReceiver<Message> {
        self.inner.router.subscribe(filter)
    }
}

// ---------------------------------------------------------------------------
// BusHandle / Kv — local-or-remote dispatch
// ---------------------------------------------------------------------------

/// Pub/sub access to the bus, embedded or remote.
#[derive(Clone)]
pub enum BusHandle {
    /// In-process bus.
    Local(Bus),
    /// TCP client to a bus hosted elsewhere.
    Remote(RemoteBus),
}

impl BusHandle {
    /// Publish `payload` on `subject`.
    ///
    /// # Errors
    /// Remote: transport failure. Local: infallible.
    pub async fn publish(&self, subject: &str, payload: &str) -> Result<(), BusError> {
        match self {
            Self::Local(bus) => {
                bus.publish(subject, payload);
                Ok(())
            }
            Self::Remote(bus) => bus.publish(subject, payload).await,
        }
    }

    /// Subscribe to subjects matching `filter`.
    ///
    /// # Errors
    /// Remote: transport failure. Local: infallible.
    pub async fn subscribe(
        &self,
        filter: &str,
    ) -> Result<mpsc::UnboundedReceiver<Message>, BusError> {
        match self {
            Self::Local(bus) => Ok(bus.subscribe(filter)),
            Self::Remote(bus) => bus.subscribe(filter).await,
        }
    }

    /// Open-or-create a bucket and return a handle on the same side as
    /// this bus handle.
    ///
    /// # Errors
    /// Local: log open/replay failure. Remote: transport failure.
    pub async fn bucket(&self, name: &str) -> Result<Kv, BusError> {
        match self {
            Self::Local(bus) => Ok(Kv::Local(bus.bucket(name)?)),
            Self::Remote(bus) => Ok(Kv::Remote(bus.bucket(name).await?)),
        }
    }
}

/// KV access to one bucket, embedded or remote. The CAS error contract is
/// identical on both sides.
#[derive(Clone)]
pub enum Kv {
    /// In-process bucket.
    Local(Bucket),
    /// Bucket reached over the wire.
    Remote(RemoteBucket),
}

impl Kv {
    /// Write `key` unconditionally.
    ///
    /// # Errors
    /// Storage or transport failure.
    pub async fn put(&self, key: &str, value: &str) -> Result<Revision, BusError> {
        match self {
            Self::Local(b) => b.put(key, value),
            Self::Remote(b) => b.put(key, value).await,
        }
    }

    /// Write `key` only if absent.
    ///
    /// # Errors
    /// [`BusError::AlreadyExists`] when present; storage or transport failure.
    pub async fn create(&self, key: &str, value: &str) -> Result<Revision, BusError> {
        match self {
            Self::Local(b) => b.create(key, value),
            Self::Remote(b) => b.create(key, value).await,
        }
    }

    /// Write `key` guarded on its current revision (0 = expect absent).
    ///
    /// # Errors
    /// [`BusError::RevisionConflict`] / [`BusError::AlreadyExists`] when the
    /// guard fails; storage or transport failure.
    pub async fn compare_and_put(
        &self,
        key: &str,
        value: &str,
        expected: Revision,
    ) -> Result<Revision, BusError> {
        match self {
            Self::Local(b) => b.compare_and_put(key, value, expected),
            Self::Remote(b) => b.compare_and_put(key, value, expected).await,
        }
    }

    /// Current value and revision of `key`.
    ///
    /// # Errors
    /// Transport failure (local gets are infallible).
    pub async fn get(&self, key: &str) -> Result<Option<(String, Revision)>, BusError> {
        match self {
            Self::Local(b) => Ok(b.get(key)),
            Self::Remote(b) => b.get(key).await,
        }
    }

    /// Remove `key`; removing an absent key is a no-op.
    ///
    /// # Errors
    /// Storage or transport failure.
    pub async fn delete(&self, key: &str) -> Result<(), BusError> {
        match self {
            Self::Local(b) => b.delete(key),
            Self::Remote(b) => b.delete(key).await,
        }
    }

    /// All live keys.
    ///
    /// # Errors
    /// Transport failure.
    pub async fn list_keys(&self) -> Result<Vec<String>, BusError> {
        match self {
            Self::Local(b) => Ok(b.list_keys()),
            Self::Remote(b) => b.list_keys().await,
        }
    }

    /// Subscribe to writes on keys starting with `prefix`.
    ///
    /// # Errors
    /// Transport failure.
    pub async fn watch(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<Entry>, BusError> {
        match self {
            Self::Local(b) => Ok(b.watch(prefix)),
            Self::Remote(b) => b.watch(prefix).await,
        }
    }
}
