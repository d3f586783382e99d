//! Revisioned key-value buckets.
//!
//! Each bucket is an in-memory map with a per-bucket revision counter and an
//! optional append-only JSONL log for durability. Every committed write is a
//! [`Entry`]; the same struct is the log record, the watch event, and the
//! wire representation, so replay and watching are the same code path.
//!
//! Ordering: all mutations and watch notifications happen under one lock, so
//! a single key's events are always delivered in revision order. Across keys
//! the order is whatever the interleaving produced.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::BusError;

/// Per-bucket monotonically increasing write sequence. Revision 0 is never
/// assigned; CAS against 0 means "expect absent".
pub type Revision = u64;

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// What a committed write did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOp {
    /// The key now holds `value`.
    Put,
    /// The key was removed; `value` is empty.
    Delete,
}

/// One committed write: log record, watch event, and wire shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The key written.
    pub key: String,
    /// The value written; empty for deletes.
    pub value: String,
    /// The bucket revision assigned to this write.
    pub revision: Revision,
    /// Put or delete.
    pub op: EntryOp,
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Entry>,
}

#[derive(Debug)]
struct BucketInner {
    entries: BTreeMap<String, (String, Revision)>,
    last_revision: Revision,
    watchers: Vec<Watcher>,
    log: Option<File>,
    log_path: Option<PathBuf>,
}

/// A named KV bucket. Cheap to clone; all clones share state.
#[derive(Clone, Debug)]
pub struct Bucket {
    name: Arc<str>,
    inner: Arc<Mutex<BucketInner>>,
}

impl Bucket {
    /// Open a bucket, replaying `<dir>/<name>.jsonl` when `dir` is given.
    ///
    /// # Errors
    /// Returns an error if the log cannot be read, parsed, or opened for
    /// append.
    pub fn open(name: &str, dir: Option<&Path>) -> Result<Self, BusError> {
        let mut entries = BTreeMap::new();
        let mut last_revision = 0;
        let mut log = None;
        let mut log_path = None;

        if let Some(dir) = dir {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("{name}.jsonl"));
            if path.exists() {
                let reader = BufReader::new(File::open(&path)?);
                for (lineno, line) in reader.lines().enumerate() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let entry: Entry =
                        serde_json::from_str(&line).map_err(|e| BusError::CorruptLog {
                            path: path.clone(),
                            reason: format!("line {}: {e}", lineno + 1),
                        })?;
                    last_revision = last_revision.max(entry.revision);
                    match entry.op {
                        EntryOp::Put => {
                            entries.insert(entry.key, (entry.value, entry.revision));
                        }
                        EntryOp::Delete => {
                            entries.remove(&entry.key);
                        }
                    }
                }
            }
            log = Some(OpenOptions::new().create(true).append(true).open(&path)?);
            log_path = Some(path);
        }

        Ok(Self {
            name: Arc::from(name),
            inner: Arc::new(Mutex::new(BucketInner {
                entries,
                last_revision,
                watchers: Vec::new(),
                log,
                log_path,
            })),
        })
    }

    /// The bucket name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write `key` unconditionally.
    ///
    /// # Errors
    /// Returns an error only if the durable log cannot be appended.
    pub fn put(&self, key: &str, value: &str) -> Result<Revision, BusError> {
        let mut inner = self.lock();
        inner.commit(key, value, EntryOp::Put)
    }

    /// Write `key` only if it does not exist — the acquire primitive.
    ///
    /// # Errors
    /// [`BusError::AlreadyExists`] when the key is present.
    pub fn create(&self, key: &str, value: &str) -> Result<Revision, BusError> {
        let mut inner = self.lock();
        if let Some((_, current)) = inner.entries.get(key) {
            return Err(BusError::AlreadyExists {
                key: key.to_owned(),
                current: *current,
            });
        }
        inner.commit(key, value, EntryOp::Put)
    }

    /// Write `key` only if its current revision equals `expected`.
    /// `expected == 0` means the key must be absent.
    ///
    /// # Errors
    /// [`BusError::RevisionConflict`] (or [`BusError::AlreadyExists`] for
    /// `expected == 0` on a present key) when the guard fails. Never a
    /// silent overwrite.
    pub fn compare_and_put(
        &self,
        key: &str,
        value: &str,
        expected: Revision,
    ) -> Result<Revision, BusError> {
        let mut inner = self.lock();
        let current = inner.entries.get(key).map(|(_, rev)| *rev);
        match (expected, current) {
            (0, Some(current)) => Err(BusError::AlreadyExists {
                key: key.to_owned(),
                current,
            }),
            (0, None) => inner.commit(key, value, EntryOp::Put),
            (_, Some(current)) if current == expected => inner.commit(key, value, EntryOp::Put),
            (_, current) => Err(BusError::RevisionConflict {
                key: key.to_owned(),
                expected,
                current: current.unwrap_or(0),
            }),
        }
    }

    /// Remove `key`. Deleting an absent key is a no-op.
    ///
    /// # Errors
    /// Returns an error only if the durable log cannot be appended.
    pub fn delete(&self, key: &str) -> Result<(), BusError> {
        let mut inner = self.lock();
        if inner.entries.contains_key(key) {
            inner.commit(key, "", EntryOp::Delete)?;
        }
        Ok(())
    }

    /// Current value and revision of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<(String, Revision)> {
        self.lock().entries.get(key).cloned()
    }

    /// All live keys, in lexicographic order.
    #[must_use]
    pub fn list_keys(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    /// Subscribe to writes on keys starting with `prefix` (empty prefix:
    /// everything). Delivers updates from now on; no historical replay.
    #[must_use]
    pub fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<Entry> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.push(Watcher {
            prefix: prefix.to_owned(),
            tx,
        });
        rx
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl BucketInner {
    /// Append to the log (if durable), apply to the map, notify watchers.
    /// The log write happens first so a failed append mutates nothing.
    fn commit(&mut self, key: &str, value: &str, op: EntryOp) -> Result<Revision, BusError> {
        let entry = Entry {
            key: key.to_owned(),
            value: value.to_owned(),
            revision: self.last_revision + 1,
            op,
        };

        if let Some(log) = self.log.as_mut() {
            let mut line = serde_json::to_string(&entry).map_err(|e| BusError::CorruptLog {
                path: self.log_path.clone().unwrap_or_default(),
                reason: e.to_string(),
            })?;
            line.push('\n');
            log.write_all(line.as_bytes())?;
            log.flush()?;
        }

        self.last_revision = entry.revision;
        match op {
            EntryOp::Put => {
                self.entries
                    .insert(entry.key.clone(), (entry.value.clone(), entry.revision));
            }
            EntryOp::Delete => {
                self.entries.remove(&entry.key);
            }
        }

        self.watchers
            .retain(|w| !entry.key.starts_with(&w.prefix) || w.tx.send(entry.clone()).is_ok());
        Ok(entry.revision)
    }
}
