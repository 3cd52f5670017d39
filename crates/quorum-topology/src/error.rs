//! Error types for topology operations.

use std::time::Duration;

use crate::address::{AddressParseError, ServerAddress};
use crate::controller::TopologyState;

/// No member currently satisfies the requested read preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    /// `Primary` mode and no primary is known.
    #[error("no primary available")]
    NoPrimaryAvailable,

    /// `Secondary` mode and no secondary matches the tag sets.
    #[error("no secondary available")]
    NoSecondaryAvailable,

    /// A preferred mode found neither a matching secondary nor a primary.
    #[error("no secondary or primary available")]
    NoSecondaryOrPrimaryAvailable,

    /// `Nearest` found no candidate and there is no primary to fall back to.
    #[error("no member available")]
    NoMemberAvailable,
}

/// The initial connect attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// Every seed (and every member discovered from them) failed to answer.
    #[error("no seed reachable (failed: {})", join_addrs(.failed))]
    NoReachableSeeds { failed: Vec<ServerAddress> },

    /// Some servers answered, but none of them could serve as required.
    #[error("no primary found among {responded} responding server(s)")]
    NoPrimaryFound { responded: usize },

    /// A seed belongs to a different replica set and strict checking is on.
    #[error("member {address} belongs to set '{found}', expected '{expected}'")]
    SetNameMismatch {
        address: ServerAddress,
        expected: String,
        found: String,
    },

    #[error("initial connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("cannot connect while topology is {0}")]
    InvalidState(TopologyState),

    #[error("topology was destroyed during connect")]
    Destroyed,
}

fn join_addrs(addrs: &[ServerAddress]) -> String {
    addrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failures reported by a connection pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The pool couldn't open a connection to the member.
    #[error("connection to {address} failed: {reason}")]
    ConnectFailed {
        address: ServerAddress,
        reason: String,
    },

    /// An established connection failed mid-request.
    #[error("i/o error: {0}")]
    Io(String),

    /// The pool was destroyed or the peer hung up.
    #[error("connection closed")]
    Closed,

    /// No reply within the allotted time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A reply arrived but couldn't be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// The wire codec couldn't make sense of a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed reply: {0}")]
pub struct CodecError(pub String);

/// Invalid topology options.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("seed list is empty")]
    EmptySeedList,

    #[error("invalid seed '{seed}': {source}")]
    InvalidSeed {
        seed: String,
        #[source]
        source: AddressParseError,
    },

    #[error("replica set name is required")]
    MissingSetName,

    #[error("{0}")]
    InvalidValue(String),

    #[error("failed to parse options: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Errors surfaced to callers of the topology.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("topology is destroyed")]
    Destroyed,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation buffer is full")]
    BufferFull,

    #[error("operation was dropped before completing")]
    Abandoned,

    #[error("sessions are not supported by this replica set")]
    SessionsUnsupported,
}

impl TopologyError {
    /// Returns true if no member satisfied the read preference.
    pub fn is_selection(&self) -> bool {
        matches!(self, TopologyError::Selection(_))
    }

    /// Returns true if a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TopologyError::Selection(_)
                | TopologyError::Timeout(_)
                | TopologyError::Transport(
                    TransportError::Io(_) | TransportError::Closed | TransportError::Timeout(_)
                )
        )
    }
}
