//! Checkpoint records exchanged between peers.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// Suffix of checkpoint generation markers (`"<generation>-cc"`).
const GENERATION_SUFFIX: &str = "-cc";

/// The last synchronized position of one peer pairing.
///
/// Serialized as `{"local":N,"remote":M}`; both fields default to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Highest local sequence whose document (and every earlier one) was pushed.
    #[serde(rename = "local", default)]
    pub last_sequence_sent: u64,
    /// Highest remote sequence whose document (and every earlier one) was pulled.
    #[serde(rename = "remote", default)]
    pub last_sequence_received: u64,
}

impl CheckpointRecord {
    /// Creates a record.
    pub fn new(last_sequence_sent: u64, last_sequence_received: u64) -> Self {
        Self {
            last_sequence_sent,
            last_sequence_received,
        }
    }

    /// Serializes to the persisted JSON form.
    pub fn to_json(&self) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::encoding_failed(e.to_string()))
    }

    /// Parses the persisted JSON form.
    pub fn from_json(bytes: &[u8]) -> ProtocolResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
    }

    /// Reconciles the locally saved copy with the copy the peer holds.
    ///
    /// Any direction on which the two disagree restarts from zero: the
    /// positions are only trustworthy when both sides agree on them.
    pub fn reconcile(local: Option<Self>, remote: Option<Self>) -> Self {
        match (local, remote) {
            (Some(local), Some(remote)) => Self {
                last_sequence_sent: if local.last_sequence_sent == remote.last_sequence_sent {
                    local.last_sequence_sent
                } else {
                    0
                },
                last_sequence_received: if local.last_sequence_received
                    == remote.last_sequence_received
                {
                    local.last_sequence_received
                } else {
                    0
                },
            },
            _ => Self::default(),
        }
    }
}

/// Returns the generation number of a checkpoint marker (`"3-cc"` ⇒ 3).
pub fn checkpoint_generation(marker: &str) -> u64 {
    marker
        .strip_suffix(GENERATION_SUFFIX)
        .and_then(|g| g.parse().ok())
        .unwrap_or(0)
}

/// Returns the marker that follows `current` (`None` ⇒ `"1-cc"`).
pub fn next_checkpoint_marker(current: Option<&str>) -> String {
    let generation = current.map_or(0, checkpoint_generation) + 1;
    format!("{generation}{GENERATION_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_form() {
        let record = CheckpointRecord::new(7, 3);
        let json = record.to_json().unwrap();
        assert_eq!(json, br#"{"local":7,"remote":3}"#.to_vec());
        assert_eq!(CheckpointRecord::from_json(&json).unwrap(), record);

        let partial = CheckpointRecord::from_json(br#"{"local":2}"#).unwrap();
        assert_eq!(partial, CheckpointRecord::new(2, 0));

        assert!(CheckpointRecord::from_json(b"not json").is_err());
    }

    #[test]
    fn reconcile_resets_mismatched_directions() {
        let local = CheckpointRecord::new(10, 4);
        let remote = CheckpointRecord::new(10, 2);
        assert_eq!(
            CheckpointRecord::reconcile(Some(local), Some(remote)),
            CheckpointRecord::new(10, 0)
        );
        assert_eq!(
            CheckpointRecord::reconcile(Some(local), None),
            CheckpointRecord::default()
        );
        assert_eq!(
            CheckpointRecord::reconcile(Some(local), Some(local)),
            local
        );
    }

    #[test]
    fn markers_increment() {
        assert_eq!(next_checkpoint_marker(None), "1-cc");
        assert_eq!(next_checkpoint_marker(Some("1-cc")), "2-cc");
        assert_eq!(checkpoint_generation("41-cc"), 41);
        assert_eq!(checkpoint_generation("garbage"), 0);
    }
}
