//! docsync CLI
//!
//! Command-line tools for docsync replication.
//!
//! # Commands
//!
//! - `checkpoint-id` - Print the checkpoint ID a configuration would use
//! - `loopback` - Replicate between two JSON-lines document files in-process
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use docsync_engine::ReplicatorOptions;
use docsync_protocol::{Mode, PROTOCOL_VERSION};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// docsync command-line replication tools.
#[derive(Parser)]
#[command(name = "docsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Replication mode of one direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Disabled,
    OneShot,
    Continuous,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Disabled => Mode::Disabled,
            ModeArg::OneShot => Mode::OneShot,
            ModeArg::Continuous => Mode::Continuous,
        }
    }
}

/// Options that decide which documents flow.
#[derive(clap::Args)]
struct FlowArgs {
    /// Push mode
    #[arg(long, value_enum, default_value = "disabled")]
    push: ModeArg,

    /// Pull mode
    #[arg(long, value_enum, default_value = "disabled")]
    pull: ModeArg,

    /// Only replicate these document IDs (repeatable)
    #[arg(long = "doc-id")]
    doc_ids: Vec<String>,

    /// Only replicate documents whose property equals a value (KEY=VALUE, repeatable)
    #[arg(long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, String)>,
}

impl FlowArgs {
    fn options(&self) -> ReplicatorOptions {
        let mut options = ReplicatorOptions::new(self.push.into(), self.pull.into());
        if !self.doc_ids.is_empty() {
            options = options.with_doc_ids(self.doc_ids.iter().cloned());
        }
        for (key, value) in &self.filters {
            options = options.with_filter_param(key, value);
        }
        options
    }
}

fn parse_filter(arg: &str) -> Result<(String, String), String> {
    arg.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {arg:?}"))
}

#[derive(Subcommand)]
enum Commands {
    /// Print the checkpoint ID a configuration would use
    CheckpointId {
        /// Remote URL (the peer identity)
        #[arg(short, long)]
        url: String,

        #[command(flatten)]
        flow: FlowArgs,
    },

    /// Replicate between two JSON-lines document files over a loopback transport
    Loopback {
        /// Documents of the active side
        #[arg(long)]
        client: PathBuf,

        /// Documents of the passive side
        #[arg(long)]
        server: PathBuf,

        #[command(flatten)]
        flow: FlowArgs,

        /// Minimum body size for delta-encoded revisions
        #[arg(long)]
        min_delta_size: Option<usize>,

        /// One-way transport latency in milliseconds
        #[arg(long, default_value = "0")]
        latency_ms: u64,

        /// How long a continuous session runs before it is stopped, in milliseconds
        #[arg(long, default_value = "1000")]
        duration_ms: u64,

        /// Write the resulting stores back to their files
        #[arg(short, long)]
        write: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::CheckpointId { url, flow } => {
            commands::checkpoint_id::run(&url, &flow.options())?;
        }
        Commands::Loopback {
            client,
            server,
            flow,
            min_delta_size,
            latency_ms,
            duration_ms,
            write,
            format,
        } => {
            let mut options = flow.options();
            if let Some(size) = min_delta_size {
                options = options.with_min_body_size_for_delta(size);
            }
            let settings = commands::loopback::Settings {
                options,
                latency: std::time::Duration::from_millis(latency_ms),
                duration: std::time::Duration::from_millis(duration_ms),
                write,
            };
            commands::loopback::run(&client, &server, settings, &format)?;
        }
        Commands::Version => {
            println!("docsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("docsync protocol v{PROTOCOL_VERSION}");
        }
    }

    Ok(())
}
