//! In-memory loopback transport.
//!
//! A [`LoopbackTransport::pair`] connects two replicators in one process:
//! whatever one end sends, the other end receives after a fixed latency.
//! Messages keep their order because each one carries its delivery time
//! and the receiver waits for it in FIFO order.

use crate::error::{ReplicationError, ReplicationResult};
use crate::transport::{CloseStatus, HandshakeResponse, Transport, TransportEvent, CLOSE_ABNORMAL};
use async_trait::async_trait;
use docsync_protocol::Role;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
enum Wire {
    Hello {
        url: String,
        headers: BTreeMap<String, String>,
    },
    Welcome(HandshakeResponse),
    Message(Vec<u8>),
    Close {
        code: u16,
        reason: String,
    },
}

#[derive(Debug)]
struct Delivery {
    at: Instant,
    wire: Wire,
}

/// One end of an in-memory connection.
#[derive(Debug)]
pub struct LoopbackTransport {
    outgoing: mpsc::UnboundedSender<Delivery>,
    incoming: Mutex<mpsc::UnboundedReceiver<Delivery>>,
    latency: Duration,
    response: HandshakeResponse,
    local_close: watch::Sender<Option<CloseStatus>>,
    peer_closed: AtomicBool,
    delivered: AtomicBool,
}

impl LoopbackTransport {
    /// Creates two connected ends.
    pub fn pair(latency: Duration) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::end(a_tx, b_rx, latency), Self::end(b_tx, a_rx, latency))
    }

    fn end(
        outgoing: mpsc::UnboundedSender<Delivery>,
        incoming: mpsc::UnboundedReceiver<Delivery>,
        latency: Duration,
    ) -> Self {
        let (local_close, _) = watch::channel(None);
        Self {
            outgoing,
            incoming: Mutex::new(incoming),
            latency,
            response: HandshakeResponse::ok(),
            local_close,
            peer_closed: AtomicBool::new(false),
            delivered: AtomicBool::new(false),
        }
    }

    /// Sets the handshake response this end sends when it accepts a connection.
    #[must_use]
    pub fn with_response(mut self, response: HandshakeResponse) -> Self {
        self.response = response;
        self
    }

    fn post(&self, wire: Wire) -> ReplicationResult<()> {
        self.outgoing
            .send(Delivery {
                at: Instant::now() + self.latency,
                wire,
            })
            .map_err(|_| ReplicationError::transport_fatal("peer is gone"))
    }

    async fn next_wire(&self) -> Option<Wire> {
        let mut incoming = self.incoming.lock().await;
        let delivery = incoming.recv().await?;
        tokio::time::sleep_until(delivery.at).await;
        Some(delivery.wire)
    }

    fn deliver_close(&self, status: CloseStatus) -> Option<TransportEvent> {
        if self.delivered.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(TransportEvent::Closed(status))
        }
    }

    fn is_closed_locally(&self) -> bool {
        self.local_close.borrow().is_some()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        url: &str,
        role: Role,
        headers: BTreeMap<String, String>,
    ) -> ReplicationResult<HandshakeResponse> {
        match role {
            Role::Client => {
                self.post(Wire::Hello {
                    url: url.to_string(),
                    headers,
                })?;
                match self.next_wire().await {
                    Some(Wire::Welcome(response)) => Ok(response),
                    Some(other) => Err(ReplicationError::Protocol(format!(
                        "expected handshake response, got {other:?}"
                    ))),
                    None => Err(ReplicationError::transport_fatal("connection refused")),
                }
            }
            Role::Server => match self.next_wire().await {
                Some(Wire::Hello { url, headers }) => {
                    debug!(%url, ?headers, "accepting loopback connection");
                    self.post(Wire::Welcome(self.response.clone()))?;
                    Ok(self.response.clone())
                }
                Some(other) => Err(ReplicationError::Protocol(format!(
                    "expected handshake request, got {other:?}"
                ))),
                None => Err(ReplicationError::transport_fatal("peer went away")),
            },
        }
    }

    async fn send(&self, message: Vec<u8>) -> ReplicationResult<()> {
        if self.is_closed_locally() {
            return Err(ReplicationError::transport_fatal("connection closed"));
        }
        self.post(Wire::Message(message))
    }

    async fn recv(&self) -> Option<TransportEvent> {
        if self.delivered.load(Ordering::SeqCst) {
            return None;
        }
        let mut local = self.local_close.subscribe();
        let mut incoming = self.incoming.lock().await;
        loop {
            let closed_locally = local.borrow_and_update().clone();
            if let Some(status) = closed_locally {
                return self.deliver_close(status);
            }
            tokio::select! {
                delivery = incoming.recv() => {
                    let Some(Delivery { at, wire }) = delivery else {
                        return self.deliver_close(CloseStatus::new(
                            CLOSE_ABNORMAL,
                            "",
                            "peer disconnected",
                        ));
                    };
                    tokio::time::sleep_until(at).await;
                    match wire {
                        Wire::Message(bytes) => return Some(TransportEvent::Message(bytes)),
                        Wire::Close { code, reason } => {
                            self.peer_closed.store(true, Ordering::SeqCst);
                            return self.deliver_close(CloseStatus::new(code, reason, "closed by peer"));
                        }
                        Wire::Hello { .. } | Wire::Welcome(_) => continue,
                    }
                }
                changed = local.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.is_closed_locally() {
            return;
        }
        if !self.peer_closed.load(Ordering::SeqCst) {
            let _ = self.post(Wire::Close {
                code,
                reason: reason.to_string(),
            });
        }
        self.local_close
            .send_replace(Some(CloseStatus::new(code, reason, "closed locally")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CLOSE_NORMAL;

    #[tokio::test]
    async fn handshake_returns_server_response() {
        let (client, server) = LoopbackTransport::pair(Duration::from_millis(1));
        let server = server.with_response(HandshakeResponse::ok().with_header("Set-Cookie", "x=1"));

        let (client_side, server_side) = tokio::join!(
            client.connect("loopback://db", Role::Client, BTreeMap::new()),
            server.connect("", Role::Server, BTreeMap::new()),
        );
        let response = client_side.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("Set-Cookie").map(String::as_str), Some("x=1"));
        assert_eq!(server_side.unwrap(), response);
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let (a, b) = LoopbackTransport::pair(Duration::from_millis(2));
        for i in 0..10u8 {
            a.send(vec![i]).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(b.recv().await, Some(TransportEvent::Message(vec![i])));
        }
    }

    #[tokio::test]
    async fn close_is_delivered_once_to_both_ends() {
        let (a, b) = LoopbackTransport::pair(Duration::ZERO);
        a.close(CLOSE_NORMAL, "done").await;
        a.close(CLOSE_NORMAL, "again").await;

        match a.recv().await {
            Some(TransportEvent::Closed(status)) => {
                assert_eq!(status.code, CLOSE_NORMAL);
                assert_eq!(status.reason, "done");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(a.recv().await, None);

        match b.recv().await {
            Some(TransportEvent::Closed(status)) => assert_eq!(status.message, "closed by peer"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(b.recv().await, None);
        assert!(a.send(vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn dropped_peer_is_an_abnormal_close() {
        let (a, b) = LoopbackTransport::pair(Duration::ZERO);
        drop(a);
        match b.recv().await {
            Some(TransportEvent::Closed(status)) => assert_eq!(status.code, CLOSE_ABNORMAL),
            other => panic!("unexpected {other:?}"),
        }
    }
}
