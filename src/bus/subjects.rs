//! Subject-based pub/sub.
//!
//! Subjects are dot-separated token strings (`tasks.completed.t1`). Filters
//! may use `*` to match exactly one token and a trailing `>` to match the
//! rest of the subject. Delivery is fan-out to every matching subscriber
//! over an unbounded channel; a dropped receiver unsubscribes lazily.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A published message as seen by subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The subject it was published on.
    pub subject: String,
    /// Opaque payload (JSON in practice).
    pub payload: String,
}

/// Whether `filter` matches `subject` under NATS-style token rules.
#[must_use]
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscription {
    filter: String,
    tx: mpsc::UnboundedSender<Message>,
}

/// Fan-out router shared by the embedded bus and its TCP server.
#[derive(Clone, Default)]
pub struct SubjectRouter {
    subs: Arc<Mutex<Vec<Subscription>>>,
}

impl SubjectRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `payload` to every subscriber whose filter matches `subject`.
    pub fn publish(&self, subject: &str, payload: &str) {
        let message = Message {
            subject: subject.to_owned(),
            payload: payload.to_owned(),
        };
        let mut subs = self.lock();
        subs.retain(|s| {
            !subject_matches(&s.filter, subject) || s.tx.send(message.clone()).is_ok()
        });
    }

    /// Subscribe to subjects matching `filter`.
    #[must_use]
    pub fn subscribe(&self, filter: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(Subscription {
            filter: filter.to_owned(),
            tx,
        });
        rx
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.subs.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
