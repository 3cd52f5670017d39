//! Decoded role-probe replies.
//!
//! The wire codec turns the raw bytes of a hello reply into a [`HelloReply`];
//! everything in this module works on that decoded form. The member's role
//! is derived here, and the list of hosts it advertises is what drives
//! discovery of new members.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::ServerAddress;

/// Upper bound on advertised hosts taken from a single reply. A replica set
/// can't have more voting and non-voting members than this, so anything
/// beyond it is a malformed or hostile reply.
pub const MAX_ADVERTISED_HOSTS: usize = 64;

/// Identifier of the election that produced the current primary.
///
/// Twelve opaque bytes compared lexicographically; a later election always
/// carries a greater id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElectionId(pub [u8; 12]);

impl ElectionId {
    /// Parses a 24-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 24 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }

    /// Builds an id whose trailing eight bytes hold `n`. Handy for ordering
    /// ids numerically.
    pub fn from_counter(n: u64) -> Self {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&n.to_be_bytes());
        Self(bytes)
    }
}

impl fmt::Display for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// The role a member holds, as far as this client knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberRole {
    /// Not probed yet, unreachable, or in a transitional state.
    Unknown,
    /// Accepts writes.
    Primary,
    /// Replicates from the primary and serves reads.
    Secondary,
    /// Votes in elections, holds no data.
    Arbiter,
    /// Priority-zero secondary that can never become primary.
    Passive,
    /// Started with replication enabled but not yet configured.
    Ghost,
    /// Standalone server, hidden member, or member of another set.
    RemovedOrStandalone,
}

impl MemberRole {
    /// Returns true for roles that hold data and can serve reads.
    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            MemberRole::Primary | MemberRole::Secondary | MemberRole::Passive
        )
    }

    /// Returns true for roles that make a server part of the set. Ghosts,
    /// standalones and hidden members answer heartbeats without belonging.
    pub fn is_member(self) -> bool {
        matches!(
            self,
            MemberRole::Primary | MemberRole::Secondary | MemberRole::Passive | MemberRole::Arbiter
        )
    }

    /// Returns true for roles that count as secondaries for selection.
    pub fn is_secondary(self) -> bool {
        matches!(self, MemberRole::Secondary | MemberRole::Passive)
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberRole::Unknown => "unknown",
            MemberRole::Primary => "primary",
            MemberRole::Secondary => "secondary",
            MemberRole::Arbiter => "arbiter",
            MemberRole::Passive => "passive",
            MemberRole::Ghost => "ghost",
            MemberRole::RemovedOrStandalone => "removed",
        };
        f.write_str(s)
    }
}

/// A role probe reply after decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    pub is_writable_primary: bool,
    pub secondary: bool,
    pub arbiter_only: bool,
    pub passive: bool,
    pub hidden: bool,
    /// Member runs with replication enabled but has no config yet.
    pub is_replica_set: bool,
    pub set_name: Option<String>,
    pub set_version: Option<u64>,
    pub election_id: Option<ElectionId>,
    /// The address the member believes it is reachable at.
    pub me: Option<ServerAddress>,
    /// The member's view of who is primary.
    pub primary: Option<ServerAddress>,
    pub hosts: Vec<ServerAddress>,
    pub passives: Vec<ServerAddress>,
    pub arbiters: Vec<ServerAddress>,
    pub tags: BTreeMap<String, String>,
    pub max_wire_version: i32,
    pub logical_session_timeout_minutes: Option<u64>,
}

impl HelloReply {
    /// Derives the member's role from the reply flags.
    pub fn role(&self) -> MemberRole {
        if self.is_replica_set {
            return MemberRole::Ghost;
        }
        if self.set_name.is_none() || self.hidden {
            return MemberRole::RemovedOrStandalone;
        }
        if self.is_writable_primary {
            MemberRole::Primary
        } else if self.secondary && self.passive {
            MemberRole::Passive
        } else if self.secondary {
            MemberRole::Secondary
        } else if self.arbiter_only {
            MemberRole::Arbiter
        } else {
            MemberRole::Unknown
        }
    }

    /// Every address this member believes belongs to the set, including its
    /// view of the primary. Capped at [`MAX_ADVERTISED_HOSTS`].
    pub fn advertised_hosts(&self) -> BTreeSet<ServerAddress> {
        self.hosts
            .iter()
            .chain(&self.passives)
            .chain(&self.arbiters)
            .chain(self.primary.iter())
            .take(MAX_ADVERTISED_HOSTS)
            .cloned()
            .collect()
    }
}
