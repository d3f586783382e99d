//! TCP client for a bus hosted on another node.
//!
//! [`RemoteBus`] speaks the JSON-lines protocol from [`wire`](super::wire).
//! A single supervisor task owns the socket: it writes outbound frames,
//! dispatches replies to waiting callers by correlation id, and routes
//! pushed subscription traffic. When the connection drops, the supervisor
//! reconnects with capped backoff, re-registers every live subscription and
//! watch, and re-sends every request that has not been answered — callers
//! observe delay, not loss. Re-sent writes are at-least-once; the CAS
//! guards absorb replays.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::kv::{Entry, Revision};
use super::subjects::Message;
use super::wire::{ClientFrame, Reply, Request, ServerFrame};
use super::BusError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Client state
// ---------------------------------------------------------------------------

struct PendingRequest {
    frame: ClientFrame,
    tx: oneshot::Sender<Result<Reply, BusError>>,
}

struct SubState {
    filter: String,
    tx: mpsc::UnboundedSender<Message>,
}

struct WatchState {
    bucket: String,
    prefix: String,
    tx: mpsc::UnboundedSender<Entry>,
}

#[derive(Default)]
struct SharedState {
    pending: HashMap<u64, PendingRequest>,
    subs: HashMap<u64, SubState>,
    watches: HashMap<u64, WatchState>,
}

struct ClientInner {
    url: String,
    next_id: AtomicU64,
    next_sub_id: AtomicU64,
    state: Mutex<SharedState>,
    frame_tx: mpsc::UnboundedSender<ClientFrame>,
    cancel: CancellationToken,
}

impl ClientInner {
    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// RemoteBus
// ---------------------------------------------------------------------------

/// A connected client to a remote embedded bus.
#[derive(Clone)]
pub struct RemoteBus {
    inner: Arc<ClientInner>,
}

impl RemoteBus {
    /// Connect to `url` (`host:port`, scheme prefixes like `nats://` are
    /// tolerated and stripped). Retries with capped backoff until the first
    /// connection succeeds or `cancel` fires; thereafter the client
    /// reconnects on its own.
    ///
    /// # Errors
    /// [`BusError::Closed`] if cancelled before the first connection.
    pub async fn connect(url: &str, cancel: CancellationToken) -> Result<Self, BusError> {
        let addr = strip_scheme(url).to_owned();
        let Some(stream) = connect_with_retry(&addr, &cancel).await else {
            return Err(BusError::Closed);
        };

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            url: addr,
            next_id: AtomicU64::new(1),
            next_sub_id: AtomicU64::new(1),
            state: Mutex::new(SharedState::default()),
            frame_tx,
            cancel: cancel.clone(),
        });
        tokio::spawn(supervisor(Arc::clone(&inner), frame_rx, stream));
        Ok(Self { inner })
    }

    /// Publish `payload` on `subject`.
    ///
    /// # Errors
    /// Transport failure or client shutdown.
    pub async fn publish(&self, subject: &str, payload: &str) -> Result<(), BusError> {
        self.request(Request::Publish {
            subject: subject.to_owned(),
            payload: payload.to_owned(),
        })
        .await
        .and_then(expect_ok)
    }

    /// Subscribe to subjects matching `filter`.
    ///
    /// # Errors
    /// Transport failure or client shutdown.
    pub async fn subscribe(
        &self,
        filter: &str,
    ) -> Result<mpsc::UnboundedReceiver<Message>, BusError> {
        let sub_id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subs.insert(
            sub_id,
            SubState {
                filter: filter.to_owned(),
                tx,
            },
        );
        let result = self
            .request(Request::Subscribe {
                filter: filter.to_owned(),
                sub_id,
            })
            .await
            .and_then(expect_ok);
        if result.is_err() {
            self.inner.lock().subs.remove(&sub_id);
        }
        result.map(|()| rx)
    }

    /// Open-or-create a bucket on the serving node.
    ///
    /// # Errors
    /// Transport failure, or the server could not open the bucket.
    pub async fn bucket(&self, name: &str) -> Result<RemoteBucket, BusError> {
        self.request(Request::BucketOpen {
            bucket: name.to_owned(),
        })
        .await
        .and_then(expect_ok)?;
        Ok(RemoteBucket {
            bus: self.clone(),
            name: name.to_owned(),
        })
    }

    async fn request(&self, request: Request) -> Result<Reply, BusError> {
        if self.inner.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = ClientFrame { id, request };
        let (tx, rx) = oneshot::channel();
        self.inner.lock().pending.insert(
            id,
            PendingRequest {
                frame: frame.clone(),
                tx,
            },
        );
        if self.inner.frame_tx.send(frame).is_err() {
            self.inner.lock().pending.remove(&id);
            return Err(BusError::Closed);
        }
        rx.await.map_err(|_| BusError::Closed)?
    }
}

// ---------------------------------------------------------------------------
// RemoteBucket
// ---------------------------------------------------------------------------

/// A KV bucket reached through a [`RemoteBus`]. Mirrors the local
/// [`Bucket`](super::Bucket) API, including the CAS error contract.
#[derive(Clone)]
pub struct RemoteBucket {
    bus: RemoteBus,
    name: String,
}

impl RemoteBucket {
    /// The bucket name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write `key` unconditionally.
    ///
    /// # Errors
    /// Transport or server-side storage failure.
    pub async fn put(&self, key: &str, value: &str) -> Result<Revision, BusError> {
        self.bus
            .request(Request::Put {
                bucket: self.name.clone(),
                key: key.to_owned(),
                value: value.to_owned(),
            })
            .await
            .and_then(expect_revision)
    }

    /// Write `key` only if absent.
    ///
    /// # Errors
    /// [`BusError::AlreadyExists`] when present.
    pub async fn create(&self, key: &str, value: &str) -> Result<Revision, BusError> {
        self.bus
            .request(Request::Create {
                bucket: self.name.clone(),
                key: key.to_owned(),
                value: value.to_owned(),
            })
            .await
            .and_then(expect_revision)
    }

    /// Write `key` guarded on its current revision (0 = expect absent).
    ///
    /// # Errors
    /// [`BusError::RevisionConflict`] / [`BusError::AlreadyExists`] when the
    /// guard fails.
    pub async fn compare_and_put(
        &self,
        key: &str,
        value: &str,
        expected: Revision,
    ) -> Result<Revision, BusError> {
        self.bus
            .request(Request::CompareAndPut {
                bucket: self.name.clone(),
                key: key.to_owned(),
                value: value.to_owned(),
                expected,
            })
            .await
            .and_then(expect_revision)
    }

    /// Current value and revision of `key`.
    ///
    /// # Errors
    /// Transport failure.
    pub async fn get(&self, key: &str) -> Result<Option<(String, Revision)>, BusError> {
        let reply = self
            .bus
            .request(Request::Get {
                bucket: self.name.clone(),
                key: key.to_owned(),
            })
            .await?;
        match reply {
            Reply::Value { value, revision } => Ok(value.map(|v| (v, revision))),
            Reply::Error { error } => Err(error.into()),
            other => Err(unexpected(&other)),
        }
    }

    /// Remove `key`; removing an absent key is a no-op.
    ///
    /// # Errors
    /// Transport or server-side storage failure.
    pub async fn delete(&self, key: &str) -> Result<(), BusError> {
        self.bus
            .request(Request::Delete {
                bucket: self.name.clone(),
                key: key.to_owned(),
            })
            .await
            .and_then(expect_ok)
    }

    /// All live keys.
    ///
    /// # Errors
    /// Transport failure.
    pub async fn list_keys(&self) -> Result<Vec<String>, BusError> {
        let reply = self
            .bus
            .request(Request::ListKeys {
                bucket: self.name.clone(),
            })
            .await?;
        match reply {
            Reply::Keys { keys } => Ok(keys),
            Reply::Error { error } => Err(error.into()),
            other => Err(unexpected(&other)),
        }
    }

    /// Subscribe to writes on keys starting with `prefix`.
    ///
    /// # Errors
    /// Transport failure.
    pub async fn watch(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<Entry>, BusError> {
        let sub_id = self.bus.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus.inner.lock().watches.insert(
            sub_id,
            WatchState {
                bucket: self.name.clone(),
                prefix: prefix.to_owned(),
                tx,
            },
        );
        let result = self
            .bus
            .request(Request::Watch {
                bucket: self.name.clone(),
                prefix: prefix.to_owned(),
                sub_id,
            })
            .await
            .and_then(expect_ok);
        if result.is_err() {
            self.bus.inner.lock().watches.remove(&sub_id);
        }
        result.map(|()| rx)
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

enum Session {
    Cancelled,
    ConnectionLost,
}

async fn supervisor(
    inner: Arc<ClientInner>,
    mut frame_rx: mpsc::UnboundedReceiver<ClientFrame>,
    first: TcpStream,
) {
    let mut stream = Some(first);
    loop {
        let conn = match stream.take() {
            Some(conn) => conn,
            None => match connect_with_retry(&inner.url, &inner.cancel).await {
                Some(conn) => conn,
                None => break,
            },
        };
        match drive_session(&inner, &mut frame_rx, conn).await {
            Session::Cancelled => break,
            Session::ConnectionLost => {
                warn!(url = %inner.url, "bus connection lost, reconnecting");
            }
        }
    }

    // Shutting down for good: fail every caller still waiting.
    let pending = std::mem::take(&mut inner.lock().pending);
    for (_, p) in pending {
        let _ = p.tx.send(Err(BusError::Closed));
    }
}

/// Frames that must be replayed on a fresh connection: re-registrations for
/// live subscriptions and watches (fire-and-forget ids), then every
/// unanswered request.
fn replay_frames(inner: &ClientInner) -> Vec<ClientFrame> {
    let state = inner.lock();
    let mut frames = Vec::new();
    for (sub_id, sub) in &state.subs {
        frames.push(ClientFrame {
            id: inner.next_id.fetch_add(1, Ordering::Relaxed),
            request: Request::Subscribe {
                filter: sub.filter.clone(),
                sub_id: *sub_id,
            },
        });
    }
    for (sub_id, watch) in &state.watches {
        frames.push(ClientFrame {
            id: inner.next_id.fetch_add(1, Ordering::Relaxed),
            request: Request::Watch {
                bucket: watch.bucket.clone(),
                prefix: watch.prefix.clone(),
                sub_id: *sub_id,
            },
        });
    }
    let mut pending: Vec<_> = state.pending.values().map(|p| p.frame.clone()).collect();
    pending.sort_by_key(|f| f.id);
    frames.extend(pending);
    frames
}

async fn drive_session(
    inner: &Arc<ClientInner>,
    frame_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    conn: TcpStream,
) -> Session {
    let (read_half, mut write_half) = conn.into_split();

    for frame in replay_frames(inner) {
        if write_frame(&mut write_half, &frame).await.is_err() {
            return Session::ConnectionLost;
        }
    }

    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return Session::Cancelled,
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { return Session::Cancelled };
                if write_frame(&mut write_half, &frame).await.is_err() {
                    // The frame stays pending and is re-sent after reconnect.
                    return Session::ConnectionLost;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => dispatch_line(inner, &line),
                Ok(None) => return Session::ConnectionLost,
                Err(e) => {
                    debug!(error = %e, "bus read failed");
                    return Session::ConnectionLost;
                }
            },
        }
    }
}

async fn write_frame(write_half: &mut OwnedWriteHalf, frame: &ClientFrame) -> std::io::Result<()> {
    let mut line = serde_json::to_string(frame).map_err(std::io::Error::other)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await
}

fn dispatch_line(inner: &Arc<ClientInner>, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let frame: ServerFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "dropping unparseable server frame");
            return;
        }
    };
    let mut state = inner.lock();
    match frame {
        ServerFrame::Reply { reply_to, reply } => {
            if let Some(pending) = state.pending.remove(&reply_to) {
                let result = match reply {
                    Reply::Error { error } => Err(error.into()),
                    other => Ok(other),
                };
                let _ = pending.tx.send(result);
            }
        }
        ServerFrame::Message { sub_id, subject, payload } => {
            // TODO: add an unsubscribe op; a dropped receiver currently
            // lingers server-side until the connection closes.
            let dead = state
                .subs
                .get(&sub_id)
                .is_some_and(|s| s.tx.send(Message { subject, payload }).is_err());
            if dead {
                state.subs.remove(&sub_id);
            }
        }
        ServerFrame::KvEvent { sub_id, entry } => {
            let dead = state
                .watches
                .get(&sub_id)
                .is_some_and(|w| w.tx.send(entry).is_err());
            if dead {
                state.watches.remove(&sub_id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection helpers
// ---------------------------------------------------------------------------

fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map_or(url, |(_, rest)| rest)
}

/// Dial until connected or cancelled, doubling the wait up to
/// [`MAX_BACKOFF`] with a little jitter.
async fn connect_with_retry(addr: &str, cancel: &CancellationToken) -> Option<TcpStream> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!(addr, "bus connected");
                return Some(stream);
            }
            Err(e) => {
                debug!(addr, error = %e, wait = ?backoff, "bus connect failed, retrying");
            }
        }
        let jitter = Duration::from_millis(rand::rng().random_range(0..50));
        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(backoff + jitter) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn expect_ok(reply: Reply) -> Result<(), BusError> {
    match reply {
        Reply::Ok => Ok(()),
        Reply::Error { error } => Err(error.into()),
        other => Err(unexpected(&other)),
    }
}

fn expect_revision(reply: Reply) -> Result<Revision, BusError> {
    match reply {
        Reply::Revision { revision } => Ok(revision),
        Reply::Error { error } => Err(error.into()),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(reply: &Reply) -> BusError {
    BusError::Transport {
        message: format!("unexpected reply: {reply:?}"),
    }
}
