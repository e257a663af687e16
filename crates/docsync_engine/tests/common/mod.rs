//! Loopback harness: two replicators on opposite ends of an in-process
//! transport, with every event recorded and the status invariants checked on
//! each observation.

#![allow(dead_code)]

use async_trait::async_trait;
use docsync_engine::{
    ActivityLevel, BlobProgress, CloseStatus, DocumentEnded, EventReceiver, HandshakeResponse,
    LoopbackTransport, ReplicationError, ReplicationResult, ReplicationStatus, Replicator,
    ReplicatorConfig, ReplicatorEvent, ReplicatorOptions, Transport, TransportEvent,
    CLOSE_ABNORMAL,
};
use docsync_protocol::{Direction, Role};
use docsync_store::MemoryStore;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Default one-way latency of the loopback transport.
pub const LATENCY: Duration = Duration::from_millis(10);

/// Upper bound for any single scenario.
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(30);

/// URL the client connects to; also its peer identity.
pub const SERVER_URL: &str = "loopback://server/db";

/// Everything one side reported during a session.
#[derive(Debug, Default)]
pub struct SideLog {
    pub events: Vec<ReplicatorEvent>,
    pub statuses: Vec<ReplicationStatus>,
    pub ended: Vec<DocumentEnded>,
    pub blobs: Vec<BlobProgress>,
    pub handshake: Option<HandshakeResponse>,
    pub closed: Option<CloseStatus>,
}

impl SideLog {
    pub fn final_status(&self) -> &ReplicationStatus {
        self.statuses.last().expect("no status was reported")
    }

    pub fn ended_ids(&self, direction: Direction) -> Vec<String> {
        let mut ids: Vec<String> = self
            .ended
            .iter()
            .filter(|d| d.direction == direction)
            .map(|d| d.doc_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn failures(&self) -> Vec<&DocumentEnded> {
        self.ended.iter().filter(|d| !d.succeeded()).collect()
    }

    /// Activity levels in the order they were reported, without repeats.
    pub fn levels(&self) -> Vec<ActivityLevel> {
        let mut levels: Vec<ActivityLevel> = self.statuses.iter().map(|s| s.level).collect();
        levels.dedup();
        levels
    }

    /// Position of the first event matching `f`.
    pub fn position(&self, f: impl Fn(&ReplicatorEvent) -> bool) -> Option<usize> {
        self.events.iter().position(f)
    }

    /// Asserts the session ended cleanly with every counter balanced.
    pub fn assert_clean_stop(&self) {
        let status = self.final_status();
        assert_eq!(status.level, ActivityLevel::Stopped);
        assert_eq!(status.error, None, "unexpected session error");
        assert_eq!(status.progress.units_completed, status.progress.units_total);
        assert_eq!(self.closed.as_ref().map(|c| c.code), Some(1000));
    }
}

/// Records events until the replicator reports `Stopped`.
pub fn collect(mut events: EventReceiver) -> JoinHandle<SideLog> {
    tokio::spawn(async move {
        let mut log = SideLog::default();
        while let Some(event) = events.recv().await {
            log.events.push(event.clone());
            match event {
                ReplicatorEvent::HandshakeReceived(response) => {
                    assert!(log.handshake.is_none(), "handshake reported twice");
                    assert!(log.statuses.is_empty(), "status reported before handshake");
                    log.handshake = Some(response);
                }
                ReplicatorEvent::StatusChanged(status) => {
                    check_status(&log, &status);
                    let stopped = status.level == ActivityLevel::Stopped;
                    log.statuses.push(status);
                    if stopped {
                        break;
                    }
                }
                ReplicatorEvent::DocumentEnded(ended) => log.ended.push(ended),
                ReplicatorEvent::BlobProgress(progress) => log.blobs.push(progress),
                ReplicatorEvent::ConnectionClosed(close) => {
                    assert!(log.closed.is_none(), "close reported twice");
                    log.closed = Some(close);
                }
            }
        }
        log
    })
}

fn check_status(log: &SideLog, status: &ReplicationStatus) {
    let progress = status.progress;
    assert!(
        progress.units_completed <= progress.units_total,
        "completed {} exceeds total {}",
        progress.units_completed,
        progress.units_total
    );
    if let Some(previous) = log.statuses.last() {
        let before = previous.progress;
        assert!(progress.units_completed >= before.units_completed);
        assert!(progress.units_total >= before.units_total);
        assert!(progress.document_count >= before.document_count);
    }
    assert!(
        log.statuses
            .last()
            .map_or(true, |s| s.level != ActivityLevel::Stopped),
        "status reported after stop"
    );
}

/// A running client/server pair.
pub struct Running {
    pub client: Replicator<MemoryStore>,
    pub server: Replicator<MemoryStore>,
    client_log: JoinHandle<SideLog>,
    server_log: JoinHandle<SideLog>,
}

/// What both sides reported.
pub struct Outcome {
    pub client: SideLog,
    pub server: SideLog,
    pub client_checkpoint: Option<String>,
    pub server_checkpoint: Option<String>,
}

/// Builder for one loopback session.
pub struct Session {
    client_store: Arc<MemoryStore>,
    client_options: ReplicatorOptions,
    server_store: Arc<MemoryStore>,
    server_options: ReplicatorOptions,
    server_response: HandshakeResponse,
    latency: Duration,
}

impl Session {
    pub fn new(
        client_store: &Arc<MemoryStore>,
        client_options: ReplicatorOptions,
        server_store: &Arc<MemoryStore>,
    ) -> Self {
        Self {
            client_store: Arc::clone(client_store),
            client_options,
            server_store: Arc::clone(server_store),
            server_options: ReplicatorOptions::passive(),
            server_response: HandshakeResponse::ok(),
            latency: LATENCY,
        }
    }

    pub fn server_options(mut self, options: ReplicatorOptions) -> Self {
        self.server_options = options;
        self
    }

    pub fn server_response(mut self, response: HandshakeResponse) -> Self {
        self.server_response = response;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn start(self) -> Running {
        let (client_end, server_end) = LoopbackTransport::pair(self.latency);
        self.launch(client_end, server_end)
    }

    /// Starts with a client link that the test can cut.
    pub fn start_severable(self) -> (Running, Link) {
        let (client_end, server_end) = LoopbackTransport::pair(self.latency);
        let (cut, cut_rx) = watch::channel(false);
        let client_end = SeverableTransport {
            inner: client_end,
            cut: cut_rx,
            delivered: AtomicBool::new(false),
        };
        (self.launch(client_end, server_end), Link { cut })
    }

    fn launch<T: Transport>(self, client_end: T, server_end: LoopbackTransport) -> Running {
        let server_end = server_end.with_response(self.server_response);

        let (server, server_events) = Replicator::new(
            ReplicatorConfig::server(self.server_options),
            self.server_store,
            server_end,
        );
        let (client, client_events) = Replicator::new(
            ReplicatorConfig::client(SERVER_URL, self.client_options),
            self.client_store,
            client_end,
        );
        let server_log = collect(server_events);
        let client_log = collect(client_events);
        server.start();
        client.start();
        Running {
            client,
            server,
            client_log,
            server_log,
        }
    }

    pub async fn run(self) -> Outcome {
        self.start().finish().await
    }
}

impl Running {
    /// Waits for both sides to stop.
    pub async fn finish(self) -> Outcome {
        within(async {
            self.client.wait().await;
            self.server.wait().await;
        })
        .await;
        let client = within(self.client_log).await.expect("client collector panicked");
        let server = within(self.server_log).await.expect("server collector panicked");
        Outcome {
            client,
            server,
            client_checkpoint: self.client.checkpoint_id(),
            server_checkpoint: self.server.checkpoint_id(),
        }
    }
}

/// Fails the test if `future` does not finish within the scenario timeout.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(SCENARIO_TIMEOUT, future)
        .await
        .expect("scenario timed out")
}

/// Polls `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

/// Cuts the client's link without a close handshake.
pub struct Link {
    cut: watch::Sender<bool>,
}

impl Link {
    pub fn cut(&self) {
        self.cut.send_replace(true);
    }
}

/// A loopback end that reports an abnormal close once its link is cut.
struct SeverableTransport {
    inner: LoopbackTransport,
    cut: watch::Receiver<bool>,
    delivered: AtomicBool,
}

impl SeverableTransport {
    fn is_cut(&self) -> bool {
        *self.cut.borrow()
    }
}

#[async_trait]
impl Transport for SeverableTransport {
    async fn connect(
        &self,
        url: &str,
        role: Role,
        headers: BTreeMap<String, String>,
    ) -> ReplicationResult<HandshakeResponse> {
        self.inner.connect(url, role, headers).await
    }

    async fn send(&self, message: Vec<u8>) -> ReplicationResult<()> {
        if self.is_cut() {
            return Err(ReplicationError::transport_fatal("link cut"));
        }
        self.inner.send(message).await
    }

    async fn recv(&self) -> Option<TransportEvent> {
        if self.delivered.load(Ordering::SeqCst) {
            return None;
        }
        let mut cut = self.cut.clone();
        let event = tokio::select! {
            event = self.inner.recv() => event,
            _ = async { let _ = cut.wait_for(|cut| *cut).await; } => {
                Some(TransportEvent::Closed(CloseStatus::new(CLOSE_ABNORMAL, "", "link cut")))
            }
        };
        if matches!(event, Some(TransportEvent::Closed(_))) {
            self.delivered.store(true, Ordering::SeqCst);
        }
        event
    }

    async fn close(&self, code: u16, reason: &str) {
        self.inner.close(code, reason).await;
    }
}
