//! RPC endpoint: one connection, many concurrent requests in both directions.
//!
//! A background reader task owns the receive side of the transport. Replies
//! are matched against a correlation table keyed by message id, each entry
//! holding its own oneshot completion. Requests from the peer are pushed to
//! a queue owned by whoever serves them (the world, or a simulator server).

use crate::codec::{decode, encode};
use crate::error::{CallError, ProtocolError};
use crate::network::FrameTransport;
use crate::types::{Call, Message, MessageId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

type Completion = oneshot::Sender<Result<Value, CallError>>;
type PendingTable = Arc<Mutex<HashMap<MessageId, Completion>>>;

/// A request received from the peer, waiting to be answered via
/// [`Endpoint::reply`].
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Name of the endpoint the request arrived on
    pub origin: String,

    /// Peer-assigned message id (echoed in the reply)
    pub id: MessageId,

    /// The invoked method and its arguments
    pub call: Call,
}

/// One side of a multiplexed request/response connection.
pub struct Endpoint {
    /// Endpoint name (the simulator id on the world side)
    name: String,

    /// Frame transport shared with the reader task
    transport: Arc<dyn FrameTransport>,

    /// Next outgoing message id
    next_id: AtomicU64,

    /// Outstanding requests awaiting a reply
    pending: PendingTable,

    /// Set once the connection is unusable
    closed: Arc<AtomicBool>,

    /// Reader task handle
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    /// Starts an endpoint over `transport`.
    ///
    /// Incoming requests are forwarded to `requests`. The queue is unbounded
    /// so the reader can always make progress delivering replies.
    pub fn spawn<T: FrameTransport>(
        name: impl Into<String>,
        transport: T,
        requests: mpsc::UnboundedSender<IncomingRequest>,
    ) -> Arc<Self> {
        let name = name.into();
        let transport: Arc<dyn FrameTransport> = Arc::new(transport);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            name.clone(),
            Arc::clone(&transport),
            Arc::clone(&pending),
            Arc::clone(&closed),
            requests,
        ));

        Arc::new(Self {
            name,
            transport,
            next_id: AtomicU64::new(0),
            pending,
            closed,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Returns the endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once the connection has been closed or failed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Issues a request and waits for its reply.
    #[instrument(skip(self, call), fields(endpoint = %self.name, method = %call.method))]
    pub async fn call(&self, call: Call) -> Result<Value, CallError> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed.into());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        // The reader may have drained the table between the check and insert
        if self.is_closed() {
            lock(&self.pending).remove(&id);
            return Err(ProtocolError::ConnectionClosed.into());
        }

        let sent = match encode(&Message::Request { id, call }) {
            Ok(payload) => self.transport.send(payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            lock(&self.pending).remove(&id);
            return Err(e.into());
        }

        debug!(id, "Request sent");
        rx.await
            .unwrap_or_else(|_| Err(ProtocolError::ConnectionClosed.into()))
    }

    /// Shorthand for a call with positional arguments only.
    pub async fn request(&self, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        self.call(Call::new(method, args)).await
    }

    /// Answers a request previously received from the peer.
    pub async fn reply(
        &self,
        id: MessageId,
        result: Result<Value, String>,
    ) -> Result<(), ProtocolError> {
        let message = match result {
            Ok(value) => Message::Success { id, value },
            Err(error) => Message::Failure { id, error },
        };
        self.transport.send(encode(&message)?).await
    }

    /// Closes the connection. Outstanding calls fail with
    /// [`ProtocolError::ConnectionClosed`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        fail_pending(&self.pending);
        self.transport.close().await;
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        debug!(endpoint = %self.name, "Endpoint closed");
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fail_pending(pending: &PendingTable) {
    let drained: Vec<Completion> = lock(pending).drain().map(|(_, tx)| tx).collect();
    for tx in drained {
        let _ = tx.send(Err(ProtocolError::ConnectionClosed.into()));
    }
}

fn complete(
    pending: &PendingTable,
    id: MessageId,
    result: Result<Value, CallError>,
) -> Result<(), ProtocolError> {
    let tx = lock(pending)
        .remove(&id)
        .ok_or(ProtocolError::UnexpectedMessageId(id))?;
    // The caller may have given up (e.g. a timed-out stop)
    let _ = tx.send(result);
    Ok(())
}

async fn read_loop(
    name: String,
    transport: Arc<dyn FrameTransport>,
    pending: PendingTable,
    closed: Arc<AtomicBool>,
    requests: mpsc::UnboundedSender<IncomingRequest>,
) {
    let failure = loop {
        let frame = match transport.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break None,
            Err(e) => break Some(e),
        };

        let message = match decode(&frame) {
            Ok(message) => message,
            Err(e) => break Some(e),
        };

        match message {
            Message::Request { id, call } => {
                debug!(endpoint = %name, id, method = %call.method, "Request received");
                let request = IncomingRequest {
                    origin: name.clone(),
                    id,
                    call,
                };
                if let Err(mpsc::error::SendError(request)) = requests.send(request) {
                    warn!(endpoint = %name, method = %request.call.method, "No request handler");
                    let refusal = Message::Failure {
                        id: request.id,
                        error: "requests are not served on this connection".to_string(),
                    };
                    if let Ok(payload) = encode(&refusal) {
                        let _ = transport.send(payload).await;
                    }
                }
            }
            Message::Success { id, value } => {
                if let Err(e) = complete(&pending, id, Ok(value)) {
                    break Some(e);
                }
            }
            Message::Failure { id, error } => {
                if let Err(e) = complete(&pending, id, Err(CallError::Remote(error))) {
                    break Some(e);
                }
            }
        }
    };

    match &failure {
        Some(e) => error!(endpoint = %name, error = %e, "Connection terminated"),
        None => debug!(endpoint = %name, peer = %transport.peer(), "Peer closed connection"),
    }

    closed.store(true, Ordering::SeqCst);
    fail_pending(&pending);
    transport.close().await;
}
