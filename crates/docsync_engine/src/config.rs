//! Configuration for the replication engine.

use docsync_protocol::{Direction, Mode, Role};
use std::collections::BTreeMap;
use std::time::Duration;

/// Per-session replication options.
///
/// Options are fixed for the lifetime of a session. The subset that decides
/// which documents flow (modes and filters) also determines the checkpoint ID.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatorOptions {
    /// Push mode.
    pub push: Mode,
    /// Pull mode.
    pub pull: Mode,
    /// Only replicate these documents, if set.
    pub doc_ids: Option<Vec<String>>,
    /// Only replicate documents whose properties equal these values.
    pub filter_params: BTreeMap<String, String>,
    /// Bodies at least this large are sent as deltas when a base is known.
    pub min_body_size_for_delta: usize,
    /// Maximum number of changes offered per batch.
    pub changes_batch_size: usize,
    /// Maximum number of documents transferred concurrently per direction.
    pub max_in_flight: usize,
    /// Size of blob chunks requested from the peer.
    pub blob_chunk_size: u64,
    /// Maximum number of ancestor revision IDs sent with a revision.
    pub max_rev_history: usize,
    /// Ignore saved checkpoints and start from the beginning.
    pub reset_checkpoint: bool,
    /// Retry policy for transient per-document failures.
    pub retry: RetryConfig,
}

impl ReplicatorOptions {
    /// Creates options with the given push and pull modes.
    pub fn new(push: Mode, pull: Mode) -> Self {
        Self {
            push,
            pull,
            doc_ids: None,
            filter_params: BTreeMap::new(),
            min_body_size_for_delta: 200,
            changes_batch_size: 200,
            max_in_flight: 8,
            blob_chunk_size: 16 * 1024,
            max_rev_history: 20,
            reset_checkpoint: false,
            retry: RetryConfig::default(),
        }
    }

    /// Push-only options.
    pub fn pushing(mode: Mode) -> Self {
        Self::new(mode, Mode::Disabled)
    }

    /// Pull-only options.
    pub fn pulling(mode: Mode) -> Self {
        Self::new(Mode::Disabled, mode)
    }

    /// Options for a passive peer serving both directions.
    pub fn passive() -> Self {
        Self::new(Mode::Passive, Mode::Passive)
    }

    /// Restricts replication to the given document IDs.
    pub fn with_doc_ids<I, S>(mut self, doc_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.doc_ids = Some(doc_ids.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a property-equality filter.
    pub fn with_filter_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter_params.insert(key.into(), value.into());
        self
    }

    /// Sets the delta-eligibility threshold (0 forces deltas).
    pub fn with_min_body_size_for_delta(mut self, size: usize) -> Self {
        self.min_body_size_for_delta = size;
        self
    }

    /// Sets the changes batch size.
    pub fn with_changes_batch_size(mut self, size: usize) -> Self {
        self.changes_batch_size = size.max(1);
        self
    }

    /// Sets the number of concurrent document transfers.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Sets the blob chunk size.
    pub fn with_blob_chunk_size(mut self, size: u64) -> Self {
        self.blob_chunk_size = size.max(1);
        self
    }

    /// Sets the maximum revision history sent with a revision.
    pub fn with_max_rev_history(mut self, max: usize) -> Self {
        self.max_rev_history = max.max(1);
        self
    }

    /// Ignores saved checkpoints.
    pub fn with_reset_checkpoint(mut self, reset: bool) -> Self {
        self.reset_checkpoint = reset;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the mode of a direction.
    pub fn mode(&self, direction: Direction) -> Mode {
        match direction {
            Direction::Pushing => self.push,
            Direction::Pulling => self.pull,
        }
    }

    /// Returns true if either direction runs continuously.
    pub fn is_continuous(&self) -> bool {
        self.push.is_continuous() || self.pull.is_continuous()
    }
}

impl Default for ReplicatorOptions {
    fn default() -> Self {
        Self::passive()
    }
}

/// Configuration of one replicator instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatorConfig {
    /// Remote endpoint handed to the transport.
    pub url: String,
    /// Which side of the connection this replicator plays.
    pub role: Role,
    /// Stable identity of the peer, used for the checkpoint ID.
    pub peer_identity: String,
    /// Replication options.
    pub options: ReplicatorOptions,
}

impl ReplicatorConfig {
    /// Configuration for the active side; the URL doubles as peer identity.
    pub fn client(url: impl Into<String>, options: ReplicatorOptions) -> Self {
        let url = url.into();
        Self {
            peer_identity: url.clone(),
            url,
            role: Role::Client,
            options,
        }
    }

    /// Configuration for the passive side.
    pub fn server(options: ReplicatorOptions) -> Self {
        Self {
            url: String::new(),
            role: Role::Server,
            peer_identity: String::new(),
            options,
        }
    }

    /// Overrides the peer identity.
    pub fn with_peer_identity(mut self, identity: impl Into<String>) -> Self {
        self.peer_identity = identity.into();
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
