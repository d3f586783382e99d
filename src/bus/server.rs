//! TCP front-end for the embedded bus.
//!
//! Serves the JSON-lines protocol from [`wire`](super::wire). Each
//! connection gets a reader task (this function's body) and a writer task;
//! subscription and watch traffic is pumped by per-subscription forwarder
//! tasks into the shared writer channel, so replies and events interleave
//! without blocking each other.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::wire::{ClientFrame, Reply, Request, ServerFrame, WireError};
use super::{Bus, BusError};

/// A running TCP listener for a [`Bus`].
pub struct BusServer {
    local_addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl BusServer {
    /// Bind `addr` and start accepting clients for `bus`. The server runs
    /// until `cancel` fires.
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        bus: Bus,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "bus listening");
        let handle = tokio::spawn(accept_loop(listener, bus, cancel));
        Ok(Self { local_addr, handle })
    }

    /// The bound address (useful when binding port 0).
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the accept loop to exit (after cancellation).
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

async fn accept_loop(listener: TcpListener, bus: Bus, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "bus client connected");
                    tokio::spawn(serve_connection(stream, bus.clone(), cancel.child_token()));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            },
        }
    }
}

async fn serve_connection(stream: TcpStream, bus: Bus, cancel: CancellationToken) {
    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();

    // Writer: everything the client sees goes through this channel.
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = writer_cancel.cancelled() => break,
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let Ok(mut line) = serde_json::to_string(&frame) else { continue };
                    line.push('\n');
                    if write_half.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "bus client read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame: ClientFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping unparseable client frame");
                continue;
            }
        };
        let reply = handle_request(&bus, frame.request, &out_tx, &cancel);
        let _ = out_tx.send(ServerFrame::Reply {
            reply_to: frame.id,
            reply,
        });
    }

    // Reader gone: tear down this connection's forwarders and writer.
    cancel.cancel();
    let _ = writer.await;
    debug!("bus client disconnected");
}

fn handle_request(
    bus: &Bus,
    request: Request,
    out_tx: &mpsc::UnboundedSender<ServerFrame>,
    cancel: &CancellationToken,
) -> Reply {
    match request {
        Request::Publish { subject, payload } => {
            bus.publish(&subject, &payload);
            Reply::Ok
        }
        Request::Subscribe { filter, sub_id } => {
            let mut rx = bus.subscribe(&filter);
            let out_tx = out_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        msg = rx.recv() => {
                            let Some(msg) = msg else { break };
                            let frame = ServerFrame::Message {
                                sub_id,
                                subject: msg.subject,
                                payload: msg.payload,
                            };
                            if out_tx.send(frame).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            Reply::Ok
        }
        Request::Watch { bucket, prefix, sub_id } => match bus.bucket(&bucket) {
            Ok(bucket) => {
                let mut rx = bucket.watch(&prefix);
                let out_tx = out_tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            entry = rx.recv() => {
                                let Some(entry) = entry else { break };
                                if out_tx.send(ServerFrame::KvEvent { sub_id, entry }).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
                Reply::Ok
            }
            Err(e) => error_reply(&e),
        },
        Request::BucketOpen { bucket } => match bus.bucket(&bucket) {
            Ok(_) => Reply::Ok,
            Err(e) => error_reply(&e),
        },
        Request::Put { bucket, key, value } => {
            kv_reply(bus, &bucket, |b| b.put(&key, &value).map(revision_reply))
        }
        Request::Create { bucket, key, value } => {
            kv_reply(bus, &bucket, |b| b.create(&key, &value).map(revision_reply))
        }
        Request::CompareAndPut { bucket, key, value, expected } => kv_reply(bus, &bucket, |b| {
            b.compare_and_put(&key, &value, expected).map(revision_reply)
        }),
        Request::Get { bucket, key } => kv_reply(bus, &bucket, |b| {
            Ok(match b.get(&key) {
                Some((value, revision)) => Reply::Value {
                    value: Some(value),
                    revision,
                },
                None => Reply::Value { value: None, revision: 0 },
            })
        }),
        Request::Delete { bucket, key } => {
            kv_reply(bus, &bucket, |b| b.delete(&key).map(|()| Reply::Ok))
        }
        Request::ListKeys { bucket } => {
            kv_reply(bus, &bucket, |b| Ok(Reply::Keys { keys: b.list_keys() }))
        }
    }
}

const fn revision_reply(revision: super::Revision) -> Reply {
    Reply::Revision { revision }
}

fn kv_reply(
    bus: &Bus,
    bucket: &str,
    op: impl FnOnce(&super::Bucket) -> Result<Reply, BusError>,
) -> Reply {
    match bus.bucket(bucket) {
        Ok(b) => op(&b).unwrap_or_else(|e| error_reply(&e)),
        Err(e) => error_reply(&e),
    }
}

fn error_reply(err: &BusError) -> Reply {
    Reply::Error {
        error: WireError::from(err),
    }
}
