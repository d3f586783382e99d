//! Wire protocol for remote bus clients.
//!
//! JSON-lines over TCP: each line is one frame. Clients send
//! [`ClientFrame`]s (a correlation id plus a [`Request`]); the server
//! answers with [`ServerFrame::Reply`] carrying the same id, and pushes
//! subscription traffic as [`ServerFrame::Message`] / [`ServerFrame::KvEvent`]
//! tagged with the client-chosen subscription id.

use serde::{Deserialize, Serialize};

use super::BusError;
use super::kv::{Entry, Revision};

/// Client-to-server operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Publish { subject: String, payload: String },
    Subscribe { filter: String, sub_id: u64 },
    BucketOpen { bucket: String },
    Put { bucket: String, key: String, value: String },
    Create { bucket: String, key: String, value: String },
    CompareAndPut { bucket: String, key: String, value: String, expected: Revision },
    Get { bucket: String, key: String },
    Delete { bucket: String, key: String },
    ListKeys { bucket: String },
    Watch { bucket: String, prefix: String, sub_id: u64 },
}

/// One client line: correlation id plus request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: Request,
}

/// Success and error results for a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Revision { revision: Revision },
    /// `value` is `None` when the key is absent (revision is then 0).
    Value { value: Option<String>, revision: Revision },
    Keys { keys: Vec<String> },
    Error { error: WireError },
}

/// Errors that survive the wire with their structure intact, so remote CAS
/// behaves exactly like local CAS.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireError {
    RevisionConflict { key: String, expected: Revision, current: Revision },
    AlreadyExists { key: String, current: Revision },
    Other { message: String },
}

impl From<&BusError> for WireError {
    fn from(err: &BusError) -> Self {
        match err {
            BusError::RevisionConflict { key, expected, current } => Self::RevisionConflict {
                key: key.clone(),
                expected: *expected,
                current: *current,
            },
            BusError::AlreadyExists { key, current } => Self::AlreadyExists {
                key: key.clone(),
                current: *current,
            },
            other => Self::Other {
                message: other.to_string(),
            },
        }
    }
}

impl From<WireError> for BusError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::RevisionConflict { key, expected, current } => {
                Self::RevisionConflict { key, expected, current }
            }
            WireError::AlreadyExists { key, current } => Self::AlreadyExists { key, current },
            WireError::Other { message } => Self::Transport { message },
        }
    }
}

/// Server-to-client frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply { reply_to: u64, reply: Reply },
    Message { sub_id: u64, subject: String, payload: String },
    KvEvent { sub_id: u64, entry: Entry },
}
