//! Request/response multiplexing over a [`Transport`].

use crate::error::{ReplicationError, ReplicationResult};
use crate::transport::{CloseStatus, Transport, TransportEvent, CLOSE_ABNORMAL};
use docsync_protocol::{Frame, FrameKind, SyncMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Something the peer sent that the session has to act on.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// A request to answer with [`Connection::respond`].
    Request {
        /// Request ID.
        id: u64,
        /// Payload.
        message: SyncMessage,
    },
    /// The connection closed.
    Closed(CloseStatus),
}

/// An open connection to the peer.
///
/// Outgoing requests wait for the response with the same ID; incoming
/// requests are handed to the session through the inbox returned by
/// [`Connection::spawn_reader`]. When the connection closes, every pending
/// request fails with [`ReplicationError::Disconnected`].
pub(crate) struct Connection {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<u64, oneshot::Sender<SyncMessage>>>,
    next_id: AtomicU64,
    closed: watch::Sender<bool>,
}

impl Connection {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            closed,
        })
    }

    /// Starts reading from the transport.
    pub(crate) fn spawn_reader(
        self: &Arc<Self>,
    ) -> (mpsc::UnboundedReceiver<Inbound>, JoinHandle<()>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let conn = Arc::clone(self);
        let handle = tokio::spawn(async move { conn.read_loop(inbox_tx).await });
        (inbox_rx, handle)
    }

    async fn read_loop(&self, inbox: mpsc::UnboundedSender<Inbound>) {
        loop {
            match self.transport.recv().await {
                Some(TransportEvent::Message(bytes)) => match Frame::decode(&bytes) {
                    Ok(frame) => self.dispatch(frame, &inbox),
                    Err(e) => warn!(error = %e, "dropping undecodable frame"),
                },
                Some(TransportEvent::Closed(status)) => {
                    self.mark_closed();
                    let _ = inbox.send(Inbound::Closed(status));
                    return;
                }
                None => {
                    self.mark_closed();
                    let _ = inbox.send(Inbound::Closed(CloseStatus::new(
                        CLOSE_ABNORMAL,
                        "",
                        "transport ended",
                    )));
                    return;
                }
            }
        }
    }

    fn dispatch(&self, frame: Frame, inbox: &mpsc::UnboundedSender<Inbound>) {
        trace!(id = frame.id, kind = ?frame.kind, message = frame.message.name(), "received");
        match frame.kind {
            FrameKind::Request => {
                let _ = inbox.send(Inbound::Request {
                    id: frame.id,
                    message: frame.message,
                });
            }
            FrameKind::Response => {
                let waiter = self.pending.lock().remove(&frame.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame.message);
                    }
                    None => warn!(id = frame.id, "response to unknown request"),
                }
            }
        }
    }

    fn mark_closed(&self) {
        self.closed.send_replace(true);
        self.pending.lock().clear();
    }

    /// Returns true once the connection has closed.
    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves when the connection has closed.
    pub(crate) async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`, so this only ends on close.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Sends a request and waits for its response.
    ///
    /// An `Error` response is returned as [`ReplicationError::Remote`].
    pub(crate) async fn request(&self, message: SyncMessage) -> ReplicationResult<SyncMessage> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if self.is_closed() {
            self.pending.lock().remove(&id);
            return Err(ReplicationError::Disconnected);
        }

        trace!(id, message = message.name(), "sending request");
        let bytes = Frame::request(id, message).encode()?;
        if let Err(e) = self.transport.send(bytes).await {
            self.pending.lock().remove(&id);
            return Err(if self.is_closed() {
                ReplicationError::Disconnected
            } else {
                e
            });
        }

        match rx.await {
            Ok(SyncMessage::Error {
                code,
                message,
                transient,
            }) => Err(ReplicationError::Remote {
                code,
                message,
                transient,
            }),
            Ok(reply) => Ok(reply),
            Err(_) => Err(ReplicationError::Disconnected),
        }
    }

    /// Answers a request.
    pub(crate) async fn respond(&self, id: u64, message: SyncMessage) -> ReplicationResult<()> {
        if self.is_closed() {
            return Err(ReplicationError::Disconnected);
        }
        let bytes = Frame::response(id, message).encode()?;
        self.transport.send(bytes).await
    }

    /// Answers a request with an error.
    pub(crate) async fn respond_error(
        &self,
        id: u64,
        error: &ReplicationError,
    ) -> ReplicationResult<()> {
        self.respond(
            id,
            SyncMessage::error(error.code(), error.to_string(), error.is_transient()),
        )
        .await
    }

    /// Closes the connection.
    pub(crate) async fn close(&self, code: u16, reason: &str) {
        self.transport.close(code, reason).await;
    }
}
