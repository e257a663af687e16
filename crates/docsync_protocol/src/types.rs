//! Roles, modes and directions shared by both peers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the connection an engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Active side: opens the connection and drives checkpoints and offers.
    Client,
    /// Passive side: accepts the connection and answers requests.
    Server,
}

impl Role {
    /// Returns true for the active role.
    pub fn is_active(&self) -> bool {
        matches!(self, Role::Client)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Replication mode for one direction.
///
/// Modes are ordered: anything above `Passive` actively initiates work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Direction is switched off.
    Disabled,
    /// Serves the peer's requests but never initiates.
    Passive,
    /// Runs until caught up, then stops.
    OneShot,
    /// Stays connected and resumes whenever new changes appear.
    Continuous,
}

impl Mode {
    /// Returns true if this mode initiates replication.
    pub fn is_active(&self) -> bool {
        *self > Mode::Passive
    }

    /// Returns true if this mode keeps the session open after catching up.
    pub fn is_continuous(&self) -> bool {
        matches!(self, Mode::Continuous)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Disabled => "disabled",
            Mode::Passive => "passive",
            Mode::OneShot => "one-shot",
            Mode::Continuous => "continuous",
        };
        f.write_str(name)
    }
}

/// Direction a document or blob moves, seen from the reporting engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Local store to peer.
    Pushing,
    /// Peer to local store.
    Pulling,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Pushing => write!(f, "pushing"),
            Direction::Pulling => write!(f, "pulling"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_ordering() {
        assert!(Mode::Continuous > Mode::OneShot);
        assert!(Mode::OneShot > Mode::Passive);
        assert!(Mode::Passive > Mode::Disabled);

        assert!(Mode::OneShot.is_active());
        assert!(Mode::Continuous.is_active());
        assert!(!Mode::Passive.is_active());
        assert!(!Mode::Disabled.is_active());
    }

    #[test]
    fn role_checks() {
        assert!(Role::Client.is_active());
        assert!(!Role::Server.is_active());
        assert_eq!(Role::Server.to_string(), "server");
    }

    #[test]
    fn direction_display() {
        assert_eq!(Direction::Pushing.to_string(), "pushing");
        assert_eq!(Direction::Pulling.to_string(), "pulling");
    }
}
