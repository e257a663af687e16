//! Replication status and its aggregation.

use crate::error::ReplicationError;
use crate::events::{BlobProgress, DocumentEnded, ReplicatorEvent};
use crate::transport::{CloseStatus, HandshakeResponse};
use docsync_protocol::Direction;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// What a replicator is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActivityLevel {
    /// Not running.
    Stopped,
    /// Lost the connection; waiting to stop or reconnect.
    Offline,
    /// Connecting and performing the handshake.
    Connecting,
    /// Connected with nothing in flight.
    Idle,
    /// Connected and transferring.
    Busy,
}

/// Progress counters of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Units of work durably finished.
    pub units_completed: u64,
    /// Units of work discovered so far.
    pub units_total: u64,
    /// Documents whose task ended.
    pub document_count: u64,
}

/// A snapshot of a replicator's status.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationStatus {
    /// Activity level.
    pub level: ActivityLevel,
    /// Progress counters.
    pub progress: Progress,
    /// Session-level error, if any.
    pub error: Option<ReplicationError>,
}

impl Default for ReplicationStatus {
    fn default() -> Self {
        Self {
            level: ActivityLevel::Stopped,
            progress: Progress::default(),
            error: None,
        }
    }
}

/// Identifies a document task for ordered completion reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ticket {
    direction: Direction,
    index: u64,
}

#[derive(Debug, Default)]
struct Reorder {
    next_ticket: u64,
    next_report: u64,
    ready: BTreeMap<u64, DocumentEnded>,
}

fn slot(direction: Direction) -> usize {
    match direction {
        Direction::Pushing => 0,
        Direction::Pulling => 1,
    }
}

/// The single writer of a replicator's status.
///
/// Every mutation and every event emission happens under the caller's lock on
/// the aggregator, so observers see one consistent sequence: unit counters
/// never decrease within a session and `units_completed` never exceeds
/// `units_total`. Document completions of one direction are reported in the
/// order their tasks were created.
#[derive(Debug)]
pub(crate) struct StatusAggregator {
    status: ReplicationStatus,
    connected: bool,
    in_flight: u64,
    catching_up: [bool; 2],
    announced: bool,
    last_emitted: Option<ReplicationStatus>,
    order: [Reorder; 2],
    events: mpsc::UnboundedSender<ReplicatorEvent>,
    level: watch::Sender<ActivityLevel>,
}

impl StatusAggregator {
    pub(crate) fn new(events: mpsc::UnboundedSender<ReplicatorEvent>) -> Self {
        let (level, _) = watch::channel(ActivityLevel::Stopped);
        Self {
            status: ReplicationStatus::default(),
            connected: false,
            in_flight: 0,
            catching_up: [false; 2],
            announced: false,
            last_emitted: None,
            order: Default::default(),
            events,
            level,
        }
    }

    /// Returns the current snapshot.
    pub(crate) fn status(&self) -> ReplicationStatus {
        self.status.clone()
    }

    /// Subscribes to activity level changes.
    pub(crate) fn subscribe_level(&self) -> watch::Receiver<ActivityLevel> {
        self.level.subscribe()
    }

    /// Resets counters and enters `Connecting`. Nothing is announced until
    /// the handshake completes.
    pub(crate) fn begin_session(&mut self) {
        self.status = ReplicationStatus {
            level: ActivityLevel::Connecting,
            ..ReplicationStatus::default()
        };
        self.connected = false;
        self.in_flight = 0;
        self.catching_up = [false; 2];
        self.announced = false;
        self.last_emitted = None;
        self.order = Default::default();
        self.publish();
    }

    pub(crate) fn handshake(&mut self, response: HandshakeResponse) {
        self.emit(ReplicatorEvent::HandshakeReceived(response));
        self.announced = true;
        self.publish();
    }

    pub(crate) fn connected(&mut self) {
        self.connected = true;
        self.publish();
    }

    pub(crate) fn set_catching_up(&mut self, direction: Direction, catching_up: bool) {
        self.catching_up[slot(direction)] = catching_up;
        self.publish();
    }

    pub(crate) fn begin_document(&mut self, direction: Direction) -> Ticket {
        let order = &mut self.order[slot(direction)];
        let ticket = Ticket {
            direction,
            index: order.next_ticket,
        };
        order.next_ticket += 1;
        self.status.progress.units_total += 1;
        self.in_flight += 1;
        self.publish();
        ticket
    }

    pub(crate) fn end_document(&mut self, ticket: Ticket, ended: DocumentEnded) {
        let order = &mut self.order[slot(ticket.direction)];
        order.ready.insert(ticket.index, ended);
        let mut flushed = Vec::new();
        while let Some(next) = order.ready.remove(&order.next_report) {
            order.next_report += 1;
            flushed.push(next);
        }
        for ended in flushed {
            self.report_document(ended);
        }
        self.publish();
    }

    fn report_document(&mut self, ended: DocumentEnded) {
        debug!(doc_id = %ended.doc_id, direction = %ended.direction, error = ?ended.error, "document ended");
        self.in_flight = self.in_flight.saturating_sub(1);
        let progress = &mut self.status.progress;
        progress.units_completed = (progress.units_completed + 1).min(progress.units_total);
        progress.document_count += 1;
        self.emit(ReplicatorEvent::DocumentEnded(ended));
    }

    pub(crate) fn begin_blob(&mut self) {
        self.status.progress.units_total += 1;
        self.in_flight += 1;
        self.publish();
    }

    pub(crate) fn end_blob(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let progress = &mut self.status.progress;
        progress.units_completed = (progress.units_completed + 1).min(progress.units_total);
        self.publish();
    }

    pub(crate) fn blob_progress(&mut self, progress: BlobProgress) {
        self.emit(ReplicatorEvent::BlobProgress(progress));
    }

    /// Records a session-level error; the first one wins.
    pub(crate) fn record_error(&mut self, error: ReplicationError) {
        if self.status.error.is_none() {
            self.status.error = Some(error);
            self.publish();
        }
    }

    pub(crate) fn offline(&mut self) {
        self.connected = false;
        self.status.level = ActivityLevel::Offline;
        self.publish();
    }

    pub(crate) fn connection_closed(&mut self, status: CloseStatus) {
        self.emit(ReplicatorEvent::ConnectionClosed(status));
    }

    /// Ends the session: reports whatever completions are buffered, closes
    /// the books and announces `Stopped`.
    pub(crate) fn stopped(&mut self, error: Option<ReplicationError>) {
        for direction in [Direction::Pushing, Direction::Pulling] {
            let ready = std::mem::take(&mut self.order[slot(direction)].ready);
            for ended in ready.into_values() {
                self.report_document(ended);
            }
        }
        if let Some(error) = error {
            if self.status.error.is_none() {
                self.status.error = Some(error);
            }
        }
        self.connected = false;
        self.in_flight = 0;
        self.catching_up = [false; 2];
        self.status.level = ActivityLevel::Stopped;
        let progress = &mut self.status.progress;
        progress.units_completed = progress.units_total;
        self.announced = true;
        self.publish();
    }

    fn emit(&self, event: ReplicatorEvent) {
        // The owner may have dropped the receiver; status is still tracked.
        let _ = self.events.send(event);
    }

    fn publish(&mut self) {
        if self.connected {
            self.status.level = if self.in_flight > 0 || self.catching_up.iter().any(|c| *c) {
                ActivityLevel::Busy
            } else {
                ActivityLevel::Idle
            };
        }
        let level = self.status.level;
        self.level.send_if_modified(|current| {
            let changed = *current != level;
            *current = level;
            changed
        });

        if self.announced && self.last_emitted.as_ref() != Some(&self.status) {
            self.last_emitted = Some(self.status.clone());
            self.emit(ReplicatorEvent::StatusChanged(self.status.clone()));
        }
    }
}
