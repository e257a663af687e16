//! Loopback command implementation.

use super::documents;
use docsync_engine::{
    ActivityLevel, EventReceiver, LoopbackTransport, Replicator, ReplicatorConfig,
    ReplicatorEvent, ReplicatorOptions,
};
use docsync_protocol::Direction;
use docsync_store::MemoryStore;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Peer identity of the in-process server.
const LOOPBACK_URL: &str = "loopback://server";

/// How a loopback run is configured.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Options of the active side.
    pub options: ReplicatorOptions,
    /// One-way transport latency.
    pub latency: Duration,
    /// How long a continuous session runs before it is stopped.
    pub duration: Duration,
    /// Write both stores back to their files afterwards.
    pub write: bool,
}

/// Outcome of a loopback run.
#[derive(Debug, Default, Serialize)]
pub struct LoopbackReport {
    /// Checkpoint ID shared by both sides.
    pub checkpoint_id: Option<String>,
    /// What the active side reported.
    pub client: SideReport,
    /// What the passive side reported.
    pub server: SideReport,
}

/// Events of one side, summarized.
#[derive(Debug, Default, Serialize)]
pub struct SideReport {
    /// Documents sent successfully.
    pub pushed: usize,
    /// Documents received successfully.
    pub pulled: usize,
    /// Blob bytes moved.
    pub blob_bytes: u64,
    /// Documents that ended with an error.
    pub failures: Vec<Failure>,
    /// Session error, if the side stopped with one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Close code of the connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_code: Option<u16>,
}

/// A document that failed to replicate.
#[derive(Debug, Serialize)]
pub struct Failure {
    /// Document ID.
    pub doc_id: String,
    /// `pushing` or `pulling`.
    pub direction: String,
    /// Error code.
    pub code: u16,
    /// Error message.
    pub message: String,
    /// Whether a later session would retry it.
    pub transient: bool,
}

/// Runs the loopback command.
pub fn run(
    client_path: &Path,
    server_path: &Path,
    settings: Settings,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !settings.options.push.is_active() && !settings.options.pull.is_active() {
        return Err("at least one of --push or --pull must be enabled".into());
    }

    let client = Arc::new(MemoryStore::new());
    let server = Arc::new(MemoryStore::new());
    let loaded = documents::load(client_path, &*client)?;
    info!(path = %client_path.display(), documents = loaded, "loaded client store");
    let loaded = documents::load(server_path, &*server)?;
    info!(path = %server_path.display(), documents = loaded, "loaded server store");

    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(replicate(&client, &server, &settings));

    if settings.write {
        documents::save(client_path, &*client)?;
        documents::save(server_path, &*server)?;
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }

    match &report.client.error {
        Some(error) => Err(format!("replication failed: {error}").into()),
        None => Ok(()),
    }
}

/// Replicates between two stores over a loopback transport.
pub async fn replicate(
    client_store: &Arc<MemoryStore>,
    server_store: &Arc<MemoryStore>,
    settings: &Settings,
) -> LoopbackReport {
    let (client_end, server_end) = LoopbackTransport::pair(settings.latency);
    let (server, server_events) = Replicator::new(
        ReplicatorConfig::server(ReplicatorOptions::passive()),
        Arc::clone(server_store),
        server_end,
    );
    let (client, client_events) = Replicator::new(
        ReplicatorConfig::client(LOOPBACK_URL, settings.options.clone()),
        Arc::clone(client_store),
        client_end,
    );
    let server_report = tokio::spawn(summarize(server_events));
    let client_report = tokio::spawn(summarize(client_events));

    server.start();
    client.start();
    if settings.options.is_continuous() {
        tokio::time::sleep(settings.duration).await;
        client.stop();
    }
    client.wait().await;
    server.wait().await;

    LoopbackReport {
        checkpoint_id: client.checkpoint_id(),
        client: client_report.await.unwrap_or_default(),
        server: server_report.await.unwrap_or_default(),
    }
}

async fn summarize(mut events: EventReceiver) -> SideReport {
    let mut report = SideReport::default();
    while let Some(event) = events.recv().await {
        match event {
            ReplicatorEvent::DocumentEnded(ended) => match &ended.error {
                None if ended.direction == Direction::Pushing => report.pushed += 1,
                None => report.pulled += 1,
                Some(error) => report.failures.push(Failure {
                    doc_id: ended.doc_id.clone(),
                    direction: ended.direction.to_string(),
                    code: error.code(),
                    message: error.to_string(),
                    transient: ended.transient,
                }),
            },
            ReplicatorEvent::BlobProgress(progress)
                if progress.bytes_completed == progress.bytes_total =>
            {
                report.blob_bytes += progress.bytes_total;
            }
            ReplicatorEvent::ConnectionClosed(close) => report.close_code = Some(close.code),
            ReplicatorEvent::StatusChanged(status) if status.level == ActivityLevel::Stopped => {
                report.error = status.error.map(|e| e.to_string());
                break;
            }
            _ => {}
        }
    }
    report
}

fn print_text_output(report: &LoopbackReport) {
    println!("Loopback Replication");
    println!("====================");
    if let Some(id) = &report.checkpoint_id {
        println!("Checkpoint: {id}");
    }
    for (name, side) in [("Client", &report.client), ("Server", &report.server)] {
        println!();
        println!("{name}:");
        println!("  Pushed:     {}", side.pushed);
        println!("  Pulled:     {}", side.pulled);
        println!("  Blob bytes: {}", side.blob_bytes);
        if let Some(code) = side.close_code {
            println!("  Close code: {code}");
        }
        if let Some(error) = &side.error {
            println!("  Error:      {error}");
        }
        for failure in &side.failures {
            println!(
                "  FAILED {} ({}): {} [{}{}]",
                failure.doc_id,
                failure.direction,
                failure.message,
                failure.code,
                if failure.transient { ", transient" } else { "" }
            );
        }
    }
}
