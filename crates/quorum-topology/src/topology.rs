//! Replica set membership table.
//!
//! [`ClusterState`] is the authoritative view of who belongs to the set and
//! which role each member holds. It is mutated only by heartbeat results and
//! membership reconciliation, and it enforces its consistency rules on every
//! update:
//!
//! - at most one member holds the primary role, and a competing primary claim
//!   wins only with a strictly greater `(set_version, election_id)`
//! - replies from a different replica set never grow the membership
//! - hosts advertised by an accepted reply are added as unknown members
//! - members disappear when the primary stops listing them, or after
//!   repeated heartbeat failures outside the initial connect
//!
//! Role buckets (primary, secondaries, arbiters, passives, unknown) are never
//! stored; they are computed from the table on demand.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::address::ServerAddress;
use crate::reply::{ElectionId, HelloReply, MemberRole};

/// Everything known about one member.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberDescriptor {
    /// Table key.
    pub address: ServerAddress,
    /// Role from the last successful heartbeat, `Unknown` after a failure.
    pub role: MemberRole,
    /// Replica set the member reported belonging to.
    pub set_name: Option<String>,
    /// Config version, the first half of a primary's election key.
    pub set_version: Option<u64>,
    /// Election id, the second half of a primary's election key.
    pub election_id: Option<ElectionId>,
    /// Attributes matched against read preference tag sets.
    pub tags: BTreeMap<String, String>,
    /// Addresses this member believes belong to the set.
    pub advertised_hosts: BTreeSet<ServerAddress>,
    /// Round trip of the last successful heartbeat. Drives `Nearest`.
    pub last_heartbeat_latency: Option<Duration>,
    /// When the last successful heartbeat was applied.
    pub last_seen_at: Option<Instant>,
    /// Bumped whenever the member's connection is recreated. Heartbeat
    /// results carrying an older generation are discarded.
    pub generation: u64,
    /// Failed heartbeats since the last success, not counting the initial
    /// connect.
    pub consecutive_failures: u32,
    pub max_wire_version: i32,
    /// Session timeout advertised by the member, `None` if unsupported.
    pub logical_session_timeout_minutes: Option<u64>,
    /// Error from the most recent failed heartbeat.
    pub last_error: Option<String>,
}

impl MemberDescriptor {
    /// Creates a descriptor for an address that hasn't been probed yet.
    pub fn unknown(address: ServerAddress, generation: u64) -> Self {
        Self {
            address,
            role: MemberRole::Unknown,
            set_name: None,
            set_version: None,
            election_id: None,
            tags: BTreeMap::new(),
            advertised_hosts: BTreeSet::new(),
            last_heartbeat_latency: None,
            last_seen_at: None,
            generation,
            consecutive_failures: 0,
            max_wire_version: 0,
            logical_session_timeout_minutes: None,
            last_error: None,
        }
    }

    /// The pair used to decide between competing primary claims.
    pub fn election_key(&self) -> (Option<u64>, Option<ElectionId>) {
        (self.set_version, self.election_id)
    }

    /// Returns true if every pair in `tags` is present with the same value.
    pub fn matches_tags(&self, tags: &BTreeMap<String, String>) -> bool {
        tags.iter().all(|(k, v)| self.tags.get(k) == Some(v))
    }
}

/// A successful heartbeat, ready to be applied.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub address: ServerAddress,
    pub reply: HelloReply,
    pub latency: Duration,
}

/// Why an update was not applied as the member asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The address is no longer part of the table.
    UnknownMember,
    /// A primary claim lost the `(set_version, election_id)` tie-break.
    StalePrimary,
    /// The member reported a different replica set name.
    SetNameMismatch { found: String },
}

/// A member moving from one role to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTransition {
    pub address: ServerAddress,
    pub from: MemberRole,
    pub to: MemberRole,
}

/// What an update did to the table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateChange {
    /// True when any derived view changed.
    pub membership_changed: bool,
    pub rejection: Option<Rejection>,
    pub transitions: Vec<RoleTransition>,
    /// Addresses added as unknown members.
    pub discovered: Vec<ServerAddress>,
    /// Members dropped during reconciliation, with their last role.
    pub removed: Vec<(ServerAddress, MemberRole)>,
}

impl StateChange {
    fn rejected(reason: Rejection) -> Self {
        Self {
            rejection: Some(reason),
            ..Self::default()
        }
    }

    /// Returns true if the probe result was applied.
    pub fn accepted(&self) -> bool {
        !matches!(
            self.rejection,
            Some(Rejection::UnknownMember | Rejection::StalePrimary)
        )
    }
}

/// Result of recording a heartbeat failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The address isn't in the table.
    Ignored,
    /// Member kept, role reset to unknown.
    Demoted { previous: MemberRole },
    /// Member kept and listed as failed (initial connect).
    RecordedFailed { previous: MemberRole },
    /// Member dropped after too many consecutive failures.
    Removed { previous: MemberRole },
}

/// Bucket counts, used in topology-description events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySummary {
    pub set_name: String,
    pub primary: Option<ServerAddress>,
    pub secondaries: usize,
    pub arbiters: usize,
    pub passives: usize,
    pub unknown: usize,
    pub total: usize,
}

/// The membership table of one replica set.
#[derive(Debug)]
pub struct ClusterState {
    set_name: String,
    members: BTreeMap<ServerAddress, MemberDescriptor>,
    /// Seeds that failed during the initial connect.
    failed: BTreeSet<ServerAddress>,
    last_primary: Option<MemberDescriptor>,
    next_generation: u64,
}

impl ClusterState {
    /// Creates an empty table for the named set.
    pub fn new(set_name: impl Into<String>) -> Self {
        Self {
            set_name: set_name.into(),
            members: BTreeMap::new(),
            failed: BTreeSet::new(),
            last_primary: None,
            next_generation: 1,
        }
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Adds an address as an unknown member. Returns false if it was
    /// already present.
    pub fn insert_unknown(&mut self, address: ServerAddress) -> bool {
        if self.members.contains_key(&address) {
            return false;
        }
        let generation = self.bump_generation();
        self.members
            .insert(address.clone(), MemberDescriptor::unknown(address, generation));
        true
    }

    /// Gives a member a fresh generation, so results from probes issued
    /// before the reset are discarded.
    pub fn reset_generation(&mut self, address: &ServerAddress) -> Option<u64> {
        let generation = self.bump_generation();
        let member = self.members.get_mut(address)?;
        member.generation = generation;
        Some(generation)
    }

    pub fn generation_of(&self, address: &ServerAddress) -> Option<u64> {
        self.members.get(address).map(|m| m.generation)
    }

    /// Applies a successful heartbeat.
    pub fn update(&mut self, probe: ProbeResult) -> StateChange {
        let ProbeResult {
            address,
            reply,
            latency,
        } = probe;

        let Some(previous_role) = self.members.get(&address).map(|m| m.role) else {
            debug!(%address, "dropping heartbeat for member no longer in the table");
            return StateChange::rejected(Rejection::UnknownMember);
        };

        let mut rejection = None;
        let mut role = reply.role();

        if let Some(found) = reply.set_name.as_deref() {
            if found != self.set_name {
                warn!(
                    %address,
                    expected = %self.set_name,
                    found,
                    "member belongs to a different replica set"
                );
                role = MemberRole::RemovedOrStandalone;
                rejection = Some(Rejection::SetNameMismatch {
                    found: found.to_string(),
                });
            }
        }

        // a member reached through an alias is not the member itself, but
        // its host list still leads to the canonical address
        let mut aliased = false;
        if let Some(me) = &reply.me {
            if *me != address && role != MemberRole::RemovedOrStandalone {
                debug!(%address, %me, "member reports a different canonical address");
                role = MemberRole::RemovedOrStandalone;
                aliased = true;
            }
        }

        let mut change = StateChange::default();
        let incoming = (reply.set_version, reply.election_id);

        if role == MemberRole::Primary {
            if let Some(current) = self.primary() {
                let current_key = current.election_key();
                let same_member = current.address == address;
                let stale = if same_member {
                    incoming < current_key
                } else {
                    incoming <= current_key
                };
                if stale {
                    debug!(
                        %address,
                        current = %current.address,
                        "rejecting stale primary claim"
                    );
                    return StateChange::rejected(Rejection::StalePrimary);
                }
                if !same_member {
                    let old = current.address.clone();
                    if let Some(m) = self.members.get_mut(&old) {
                        m.role = MemberRole::Unknown;
                    }
                    info!(old = %old, new = %address, "primary replaced");
                    change.transitions.push(RoleTransition {
                        address: old,
                        from: MemberRole::Primary,
                        to: MemberRole::Unknown,
                    });
                }
            }
        }

        let advertised = reply.advertised_hosts();
        let accept_hosts =
            rejection.is_none() && (role != MemberRole::RemovedOrStandalone || aliased);

        if let Some(member) = self.members.get_mut(&address) {
            member.role = role;
            member.set_name = reply.set_name.clone();
            member.set_version = reply.set_version;
            member.election_id = reply.election_id;
            member.tags = reply.tags.clone();
            member.advertised_hosts = advertised.clone();
            member.last_heartbeat_latency = Some(latency);
            member.last_seen_at = Some(Instant::now());
            member.consecutive_failures = 0;
            member.max_wire_version = reply.max_wire_version;
            member.logical_session_timeout_minutes = reply.logical_session_timeout_minutes;
            member.last_error = None;

            if role == MemberRole::Primary {
                self.last_primary = Some(member.clone());
            }
        }
        self.failed.remove(&address);

        if previous_role != role {
            info!(%address, from = %previous_role, to = %role, "member role changed");
            change.transitions.push(RoleTransition {
                address: address.clone(),
                from: previous_role,
                to: role,
            });
        }

        if accept_hosts {
            for host in &advertised {
                if self.insert_unknown(host.clone()) {
                    debug!(%address, discovered = %host, "discovered member");
                    change.discovered.push(host.clone());
                }
            }
        }

        // the primary's host list is authoritative
        if role == MemberRole::Primary {
            let stale: Vec<ServerAddress> = self
                .members
                .keys()
                .filter(|a| **a != address && !advertised.contains(*a))
                .cloned()
                .collect();
            for gone in stale {
                if let Some(m) = self.members.remove(&gone) {
                    info!(address = %gone, primary = %address, "member no longer listed by primary");
                    change.removed.push((gone, m.role));
                }
            }
        }

        change.rejection = rejection;
        change.membership_changed = !change.transitions.is_empty()
            || !change.discovered.is_empty()
            || !change.removed.is_empty();
        change
    }

    /// Records a failed heartbeat for `address`.
    pub fn record_failure(
        &mut self,
        address: &ServerAddress,
        initial_connect: bool,
        max_failures: u32,
        error: &str,
    ) -> FailureOutcome {
        let Some(member) = self.members.get_mut(address) else {
            return FailureOutcome::Ignored;
        };

        let previous = member.role;
        member.role = MemberRole::Unknown;
        member.consecutive_failures = member.consecutive_failures.saturating_add(1);
        member.last_error = Some(error.to_string());

        if initial_connect {
            self.failed.insert(address.clone());
            return FailureOutcome::RecordedFailed { previous };
        }

        if member.consecutive_failures >= max_failures {
            self.members.remove(address);
            return FailureOutcome::Removed { previous };
        }

        FailureOutcome::Demoted { previous }
    }

    /// Drops a member entirely.
    pub fn remove(&mut self, address: &ServerAddress) -> Option<MemberDescriptor> {
        self.members.remove(address)
    }

    /// Empties the table. Used on destroy.
    pub fn clear(&mut self) {
        self.members.clear();
        self.failed.clear();
    }

    pub fn get(&self, address: &ServerAddress) -> Option<&MemberDescriptor> {
        self.members.get(address)
    }

    pub fn contains(&self, address: &ServerAddress) -> bool {
        self.members.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    // -- derived views --

    pub fn primary(&self) -> Option<&MemberDescriptor> {
        self.members.values().find(|m| m.role == MemberRole::Primary)
    }

    /// Secondaries, including passive members.
    pub fn secondaries(&self) -> impl Iterator<Item = &MemberDescriptor> {
        self.members.values().filter(|m| m.role.is_secondary())
    }

    pub fn arbiters(&self) -> impl Iterator<Item = &MemberDescriptor> {
        self.members
            .values()
            .filter(|m| m.role == MemberRole::Arbiter)
    }

    pub fn passives(&self) -> impl Iterator<Item = &MemberDescriptor> {
        self.members
            .values()
            .filter(|m| m.role == MemberRole::Passive)
    }

    pub fn unknown_members(&self) -> impl Iterator<Item = &MemberDescriptor> {
        self.members
            .values()
            .filter(|m| m.role == MemberRole::Unknown)
    }

    pub fn all_members(&self) -> impl Iterator<Item = &MemberDescriptor> {
        self.members.values()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.members.keys()
    }

    pub fn has_primary(&self) -> bool {
        self.primary().is_some()
    }

    pub fn has_secondary(&self) -> bool {
        self.secondaries().next().is_some()
    }

    pub fn has_primary_and_secondary(&self) -> bool {
        self.has_primary() && self.has_secondary()
    }

    /// Set members whose last heartbeat succeeded.
    pub fn reachable_count(&self) -> usize {
        self.members.values().filter(|m| m.role.is_member()).count()
    }

    /// Servers whose last heartbeat succeeded, members or not.
    pub fn responded_count(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.role != MemberRole::Unknown)
            .count()
    }

    /// Clears every failure streak. Failures seen while the initial
    /// connect was in progress don't count toward removal.
    pub fn reset_failure_counts(&mut self) {
        for member in self.members.values_mut() {
            member.consecutive_failures = 0;
        }
    }

    /// Seeds that failed while the initial connect was in progress.
    pub fn failed_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.failed.iter()
    }

    /// The most recently accepted primary, even if it has since gone away.
    pub fn last_known_primary(&self) -> Option<&MemberDescriptor> {
        self.last_primary.as_ref()
    }

    /// Session timeout the set supports: the smallest value advertised by
    /// any data-bearing member, or `None` if any of them doesn't support
    /// sessions.
    pub fn logical_session_timeout(&self) -> Option<Duration> {
        let mut data_bearing = self
            .members
            .values()
            .filter(|m| m.role.is_data_bearing())
            .peekable();
        data_bearing.peek()?;

        let mut min: Option<u64> = None;
        for m in data_bearing {
            let minutes = m.logical_session_timeout_minutes?;
            min = Some(min.map_or(minutes, |cur| cur.min(minutes)));
        }
        min.map(|m| Duration::from_secs(m * 60))
    }

    pub fn summary(&self) -> TopologySummary {
        TopologySummary {
            set_name: self.set_name.clone(),
            primary: self.primary().map(|m| m.address.clone()),
            secondaries: self.secondaries().count(),
            arbiters: self.arbiters().count(),
            passives: self.passives().count(),
            unknown: self.unknown_members().count(),
            total: self.members.len(),
        }
    }
}
