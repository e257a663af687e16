//! Transport layer abstraction for replication.

use crate::error::ReplicationResult;
use async_trait::async_trait;
use docsync_protocol::Role;
use std::collections::BTreeMap;

/// Close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code used when a peer goes away while a session is running.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code for a rejected handshake.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code for a connection that dropped without a close message.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Close code for an internal error.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// The response to the connection handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// HTTP-like status code.
    pub status: u16,
    /// Response headers.
    pub headers: BTreeMap<String, String>,
}

impl HandshakeResponse {
    /// A successful response with no headers.
    pub fn ok() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
        }
    }

    /// A response with the given status.
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns true for 1xx and 2xx statuses.
    pub fn is_success(&self) -> bool {
        (100..300).contains(&self.status)
    }
}

/// The terminal outcome of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    /// Close code.
    pub code: u16,
    /// Reason given by the closing side.
    pub reason: String,
    /// Description of how the connection ended.
    pub message: String,
}

impl CloseStatus {
    /// Creates a close status.
    pub fn new(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Returns true for a normal closure.
    pub fn is_normal(&self) -> bool {
        self.code == CLOSE_NORMAL
    }
}

/// Something received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete message.
    Message(Vec<u8>),
    /// The connection closed. Delivered exactly once per session.
    Closed(CloseStatus),
}

/// An ordered, reliable, bidirectional message channel.
///
/// The active side's `connect` opens the connection and returns the passive
/// side's handshake response; the passive side's `connect` waits for the
/// connection request and returns the response it sent.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connects and performs the handshake.
    async fn connect(
        &self,
        url: &str,
        role: Role,
        headers: BTreeMap<String, String>,
    ) -> ReplicationResult<HandshakeResponse>;

    /// Sends one message.
    async fn send(&self, message: Vec<u8>) -> ReplicationResult<()>;

    /// Receives the next event; `None` once the close event was delivered.
    async fn recv(&self) -> Option<TransportEvent>;

    /// Closes the connection. Calling it more than once has no effect.
    async fn close(&self, code: u16, reason: &str);
}
