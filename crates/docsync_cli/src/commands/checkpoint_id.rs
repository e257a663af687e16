//! Checkpoint-id command implementation.

use docsync_engine::{CheckpointStore, ReplicatorOptions};
use docsync_store::MemoryStore;

/// Runs the checkpoint-id command.
pub fn run(url: &str, options: &ReplicatorOptions) -> Result<(), Box<dyn std::error::Error>> {
    if !options.push.is_active() && !options.pull.is_active() {
        return Err("at least one of --push or --pull must be enabled".into());
    }
    println!("{}", CheckpointStore::<MemoryStore>::compute_id(url, options));
    Ok(())
}
