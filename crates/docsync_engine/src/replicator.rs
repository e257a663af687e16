//! The replicator: one session's lifecycle, from handshake to `Stopped`.

use crate::checkpoint::{CheckpointStore, SequenceTracker};
use crate::config::ReplicatorConfig;
use crate::connection::{Connection, Inbound};
use crate::error::{ReplicationError, ReplicationResult};
use crate::events::EventReceiver;
use crate::puller::Puller;
use crate::pusher::{ChangeFilter, Pusher};
use crate::session::{handle_request, SessionContext};
use crate::status::{ActivityLevel, ReplicationStatus, StatusAggregator};
use crate::transport::{
    CloseStatus, Transport, TransportEvent, CLOSE_ABNORMAL, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
    CLOSE_POLICY_VIOLATION,
};
use docsync_protocol::{CheckpointRecord, Direction, SyncMessage, PROTOCOL_VERSION};
use docsync_store::Store;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Header carrying the protocol version in the handshake request.
pub const PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

struct Shared<S: Store> {
    config: ReplicatorConfig,
    store: Arc<S>,
    transport: Arc<dyn Transport>,
    status: Arc<Mutex<StatusAggregator>>,
    stop: watch::Sender<bool>,
    checkpoint_id: Arc<Mutex<Option<String>>>,
}

/// Replicates a local store with one peer over one transport.
///
/// A replicator is either the active side, which drives the session and
/// owns the checkpoint, or the passive side, which serves requests. Both
/// report through the same [`ReplicatorEvent`](crate::ReplicatorEvent)
/// stream and [`ReplicationStatus`].
///
/// # Example
///
/// ```rust,no_run
/// use docsync_engine::{LoopbackTransport, Replicator, ReplicatorConfig, ReplicatorOptions};
/// use docsync_protocol::Mode;
/// use docsync_store::MemoryStore;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() {
/// let (client_end, server_end) = LoopbackTransport::pair(Duration::from_millis(10));
/// let (client, _client_events) = Replicator::new(
///     ReplicatorConfig::client("loopback://server", ReplicatorOptions::pushing(Mode::OneShot)),
///     Arc::new(MemoryStore::new()),
///     client_end,
/// );
/// let (server, _server_events) = Replicator::new(
///     ReplicatorConfig::server(ReplicatorOptions::passive()),
///     Arc::new(MemoryStore::new()),
///     server_end,
/// );
/// server.start();
/// client.start();
/// client.wait().await;
/// server.wait().await;
/// # }
/// ```
pub struct Replicator<S: Store> {
    shared: Arc<Shared<S>>,
    session: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Store> Replicator<S> {
    /// Creates a stopped replicator and the receiver of its events.
    pub fn new<T: Transport>(
        config: ReplicatorConfig,
        store: Arc<S>,
        transport: T,
    ) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let checkpoint_id = config
            .role
            .is_active()
            .then(|| CheckpointStore::<S>::compute_id(&config.peer_identity, &config.options));
        let (stop, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            store,
            transport: Arc::new(transport),
            status: Arc::new(Mutex::new(StatusAggregator::new(events_tx))),
            stop,
            checkpoint_id: Arc::new(Mutex::new(checkpoint_id)),
        });
        let replicator = Self {
            shared,
            session: Mutex::new(None),
        };
        (replicator, events_rx)
    }

    /// Starts a session. Does nothing while one is running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("replicator already running");
            return;
        }
        self.shared.stop.send_replace(false);
        self.shared.status.lock().begin_session();
        *session = Some(tokio::spawn(run_session(Arc::clone(&self.shared))));
    }

    /// Requests the session to stop.
    ///
    /// In-flight documents finish and the checkpoint is saved before the
    /// connection closes. May be called from any thread, any number of times.
    pub fn stop(&self) {
        self.shared.stop.send_replace(true);
    }

    /// Returns the current status.
    pub fn status(&self) -> ReplicationStatus {
        self.shared.status.lock().status()
    }

    /// Returns the checkpoint ID once it is known.
    pub fn checkpoint_id(&self) -> Option<String> {
        self.shared.checkpoint_id.lock().clone()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ReplicatorConfig {
        &self.shared.config
    }

    /// Waits for the running session, if any, to reach `Stopped`.
    pub async fn wait(&self) {
        let handle = self.session.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "replication session panicked");
            }
        }
    }
}

impl<S: Store> Drop for Replicator<S> {
    fn drop(&mut self) {
        self.shared.stop.send_replace(true);
    }
}

async fn run_session<S: Store>(shared: Arc<Shared<S>>) {
    let span = info_span!("replicator", session = %Uuid::new_v4(), role = %shared.config.role);
    session(shared).instrument(span).await
}

fn handshake_headers() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            PROTOCOL_HEADER.to_string(),
            format!("docsync/{PROTOCOL_VERSION}"),
        ),
        (
            "User-Agent".to_string(),
            format!("docsync/{}", env!("CARGO_PKG_VERSION")),
        ),
    ])
}

async fn session<S: Store>(shared: Arc<Shared<S>>) {
    let config = &shared.config;
    let role = config.role;
    info!(url = %config.url, push = %config.options.push, pull = %config.options.pull, "starting");

    let mut stop = shared.stop.subscribe();
    let connected = tokio::select! {
        connected = shared.transport.connect(&config.url, role, handshake_headers()) => connected,
        _ = async { let _ = stop.wait_for(|stopping| *stopping).await; } => {
            info!("stopped before connecting");
            shared.transport.close(CLOSE_NORMAL, "stopped").await;
            let mut status = shared.status.lock();
            status.connection_closed(CloseStatus::new(
                CLOSE_NORMAL,
                "stopped",
                "stopped before connecting",
            ));
            status.stopped(None);
            return;
        }
    };
    let response = match connected {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "connection failed");
            let mut status = shared.status.lock();
            status.connection_closed(CloseStatus::new(CLOSE_ABNORMAL, "", e.to_string()));
            status.stopped(Some(e));
            return;
        }
    };
    shared.status.lock().handshake(response.clone());

    if !response.is_success() {
        warn!(status = response.status, "handshake rejected");
        shared
            .transport
            .close(CLOSE_POLICY_VIOLATION, "handshake rejected")
            .await;
        let close = loop {
            match shared.transport.recv().await {
                Some(TransportEvent::Closed(close)) => break close,
                Some(TransportEvent::Message(_)) => continue,
                None => {
                    break CloseStatus::new(CLOSE_POLICY_VIOLATION, "handshake rejected", "closed")
                }
            }
        };
        let mut status = shared.status.lock();
        status.connection_closed(close);
        status.stopped(Some(ReplicationError::HandshakeRejected {
            status: response.status,
        }));
        return;
    }

    let conn = Connection::new(Arc::clone(&shared.transport));
    let (mut inbox, reader) = conn.spawn_reader();
    let ctx = Arc::new(SessionContext {
        store: Arc::clone(&shared.store),
        conn,
        options: config.options.clone(),
        role,
        status: Arc::clone(&shared.status),
        stop: shared.stop.subscribe(),
        checkpoint_id: Arc::clone(&shared.checkpoint_id),
    });
    let puller = Arc::new(Puller::new(Arc::clone(&ctx)));
    ctx.status.lock().connected();
    info!(status = response.status, "connected");

    let driver = role
        .is_active()
        .then(|| tokio::spawn(drive(Arc::clone(&ctx), Arc::clone(&puller))));
    let mut handlers = JoinSet::new();
    let mut closing = false;

    let close = loop {
        tokio::select! {
            inbound = inbox.recv() => match inbound {
                Some(Inbound::Request { id, message }) => {
                    handlers.spawn(handle_request(Arc::clone(&ctx), Arc::clone(&puller), id, message));
                }
                Some(Inbound::Closed(close)) => break close,
                None => break CloseStatus::new(CLOSE_ABNORMAL, "", "connection reader ended"),
            },
            // The active side's driver handles its own stop.
            _ = async { let _ = stop.wait_for(|stopping| *stopping).await; },
                if driver.is_none() && !closing =>
            {
                closing = true;
                ctx.conn.close(CLOSE_NORMAL, "stopped").await;
            }
        }
    };
    debug!(code = close.code, reason = %close.reason, "connection closed");

    while handlers.join_next().await.is_some() {}
    if let Some(driver) = driver {
        if let Err(e) = driver.await {
            error!(error = %e, "replication driver panicked");
        }
    }
    if let Err(e) = reader.await {
        error!(error = %e, "connection reader panicked");
    }
    puller.abandon(ReplicationError::Disconnected);

    let error = (!close.is_normal()).then(|| {
        ReplicationError::transport_fatal(format!(
            "connection closed with code {}: {}",
            close.code, close.message
        ))
    });
    let mut status = ctx.status.lock();
    if error.is_some() && role.is_active() && ctx.options.is_continuous() {
        status.offline();
    }
    info!(code = close.code, "stopped");
    status.connection_closed(close);
    status.stopped(error);
}

/// Runs the active side of a session and closes the connection when done.
async fn drive<S: Store>(ctx: Arc<SessionContext<S>>, puller: Arc<Puller<S>>) {
    let checkpoint_id = ctx.checkpoint_id.lock().clone().unwrap_or_default();
    let mut driver = Driver {
        checkpoints: CheckpointStore::new(Arc::clone(&ctx.store), checkpoint_id),
        pushers: JoinSet::new(),
        push_tracker: Arc::new(Mutex::new(SequenceTracker::default())),
        start: CheckpointRecord::default(),
        ctx: Arc::clone(&ctx),
        puller,
    };

    let result = driver.run().await;
    if let Err(e) = &result {
        if *e != ReplicationError::Disconnected {
            warn!(error = %e, "replication failed");
            ctx.status.lock().record_error(e.clone());
        }
        ctx.conn.close(CLOSE_INTERNAL_ERROR, &e.to_string()).await;
    }
    // Pushers end once the connection is closed or they observe the stop.
    while let Some(joined) = driver.pushers.join_next().await {
        log_pusher_exit(joined);
    }
    if result.is_ok() {
        ctx.conn.close(CLOSE_NORMAL, "done").await;
    }
}

fn log_pusher_exit(joined: Result<ReplicationResult<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "pusher ended"),
        Err(e) => error!(error = %e, "pusher panicked"),
    }
}

struct Driver<S: Store> {
    ctx: Arc<SessionContext<S>>,
    puller: Arc<Puller<S>>,
    checkpoints: CheckpointStore<S>,
    pushers: JoinSet<ReplicationResult<()>>,
    push_tracker: Arc<Mutex<SequenceTracker>>,
    start: CheckpointRecord,
}

impl<S: Store> Driver<S> {
    async fn run(&mut self) -> ReplicationResult<()> {
        let ctx = Arc::clone(&self.ctx);
        let options = &ctx.options;

        self.start = self
            .checkpoints
            .load(&ctx.conn, options.reset_checkpoint)
            .await?;
        info!(
            checkpoint = %self.checkpoints.id(),
            local = self.start.last_sequence_sent,
            remote = self.start.last_sequence_received,
            "resuming"
        );
        *self.push_tracker.lock() = SequenceTracker::new(self.start.last_sequence_sent);

        let mut level = ctx.status.lock().subscribe_level();
        if options.push.is_active() {
            let pusher = Pusher::new(
                Arc::clone(&ctx),
                self.start.last_sequence_sent,
                options.push.is_continuous(),
                ChangeFilter::new(options.doc_ids.clone(), options.filter_params.clone()),
                Some(Arc::clone(&self.push_tracker)),
            );
            self.pushers.spawn(pusher.run());
        }
        if options.pull.is_active() {
            self.puller.begin_pull(self.start.last_sequence_received);
            let reply = ctx
                .conn
                .request(SyncMessage::SubscribeChanges {
                    since: self.start.last_sequence_received,
                    continuous: options.pull.is_continuous(),
                    doc_ids: options.doc_ids.clone(),
                    filter_params: options.filter_params.clone(),
                })
                .await?;
            if reply != SyncMessage::Ack {
                return Err(ReplicationError::Protocol(format!(
                    "unexpected reply to subChanges: {}",
                    reply.name()
                )));
            }
        }

        let mut stop = ctx.stop.clone();
        if options.is_continuous() {
            loop {
                tokio::select! {
                    _ = async { let _ = stop.wait_for(|stopping| *stopping).await; } => break,
                    _ = ctx.conn.closed() => return Err(ReplicationError::Disconnected),
                    changed = level.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let idle = *level.borrow_and_update() == ActivityLevel::Idle;
                        if idle {
                            self.save_checkpoint().await;
                        }
                    }
                }
            }
        } else {
            let pushers = &mut self.pushers;
            let puller = &self.puller;
            let pull = options.pull.is_active();
            let work = async move {
                while let Some(joined) = pushers.join_next().await {
                    match joined {
                        Ok(result) => result?,
                        Err(e) => return Err(ReplicationError::Protocol(format!("pusher panicked: {e}"))),
                    }
                }
                if pull {
                    puller.wait_caught_up().await;
                }
                Ok::<(), ReplicationError>(())
            };
            tokio::select! {
                done = work => done?,
                _ = async { let _ = stop.wait_for(|stopping| *stopping).await; } => {}
                _ = ctx.conn.closed() => return Err(ReplicationError::Disconnected),
            }
        }

        self.wind_down().await?;
        self.save_checkpoint().await;
        Ok(())
    }

    /// Lets in-flight documents finish once nothing new is accepted.
    async fn wind_down(&mut self) -> ReplicationResult<()> {
        let ctx = Arc::clone(&self.ctx);
        while let Some(joined) = self.pushers.join_next().await {
            log_pusher_exit(joined);
        }
        let mut level = {
            let mut status = ctx.status.lock();
            status.set_catching_up(Direction::Pushing, false);
            status.set_catching_up(Direction::Pulling, false);
            status.subscribe_level()
        };
        tokio::select! {
            _ = async {
                let _ = level.wait_for(|level| *level != ActivityLevel::Busy).await;
            } => Ok(()),
            _ = ctx.conn.closed() => Err(ReplicationError::Disconnected),
        }
    }

    fn current_record(&self) -> CheckpointRecord {
        CheckpointRecord::new(
            self.push_tracker.lock().checkpoint(),
            self.puller.checkpoint().unwrap_or(self.start.last_sequence_received),
        )
    }

    async fn save_checkpoint(&mut self) {
        let record = self.current_record();
        match self.checkpoints.save(&self.ctx.conn, record).await {
            Ok(()) => {}
            // The close status reports a lost connection.
            Err(ReplicationError::Disconnected) => {
                debug!(?record, "connection lost before checkpoint was saved");
            }
            Err(e) => {
                warn!(error = %e, ?record, "could not save checkpoint");
                self.ctx.status.lock().record_error(e);
            }
        }
    }
}
