//! Read preferences and server selection.
//!
//! Selection is a pure function of a [`ClusterState`] snapshot and a
//! [`ReadPreference`]; the only state it touches is the pair of round-robin
//! counters owned by the caller, so repeated reads spread across every
//! eligible member instead of always landing on the first.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SelectionError;
use crate::topology::{ClusterState, MemberDescriptor};

/// A set of key/value pairs a member must carry to be eligible.
pub type TagSet = BTreeMap<String, String>;

/// Which members an operation may be sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadMode::Primary => "primary",
            ReadMode::PrimaryPreferred => "primaryPreferred",
            ReadMode::Secondary => "secondary",
            ReadMode::SecondaryPreferred => "secondaryPreferred",
            ReadMode::Nearest => "nearest",
        };
        f.write_str(s)
    }
}

impl ReadMode {
    /// The error reported when nothing satisfies this mode.
    pub fn unavailable(self) -> SelectionError {
        match self {
            ReadMode::Primary => SelectionError::NoPrimaryAvailable,
            ReadMode::Secondary => SelectionError::NoSecondaryAvailable,
            ReadMode::PrimaryPreferred | ReadMode::SecondaryPreferred => {
                SelectionError::NoSecondaryOrPrimaryAvailable
            }
            ReadMode::Nearest => SelectionError::NoMemberAvailable,
        }
    }
}

/// A read mode plus an ordered list of tag sets.
///
/// Tag sets are tried in order and the first one that matches at least one
/// member wins. An empty list, or an empty tag set, matches every member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPreference {
    pub mode: ReadMode,
    #[serde(default)]
    pub tag_sets: Vec<TagSet>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            tag_sets: Vec::new(),
        }
    }

    pub fn primary() -> Self {
        Self::new(ReadMode::Primary)
    }

    pub fn primary_preferred() -> Self {
        Self::new(ReadMode::PrimaryPreferred)
    }

    pub fn secondary() -> Self {
        Self::new(ReadMode::Secondary)
    }

    pub fn secondary_preferred() -> Self {
        Self::new(ReadMode::SecondaryPreferred)
    }

    pub fn nearest() -> Self {
        Self::new(ReadMode::Nearest)
    }

    /// Appends a tag set built from `(key, value)` pairs.
    pub fn with_tags<K, V>(mut self, tags: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tag_sets
            .push(tags.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }
}

/// Rotating indices for the round-robin modes.
#[derive(Debug, Default)]
pub struct SelectionCounters {
    secondary: AtomicUsize,
    nearest: AtomicUsize,
}

impl SelectionCounters {
    fn next(counter: &AtomicUsize, len: usize) -> usize {
        counter.fetch_add(1, Ordering::Relaxed) % len
    }
}

/// Picks members for operations.
#[derive(Debug, Clone, Copy)]
pub struct ServerSelector {
    /// How far behind the fastest member a `Nearest` candidate may be.
    local_threshold: Duration,
}

impl ServerSelector {
    pub fn new(local_threshold: Duration) -> Self {
        Self { local_threshold }
    }

    pub fn local_threshold(&self) -> Duration {
        self.local_threshold
    }

    /// Chooses one member for `pref`, advancing the round-robin counter of
    /// the mode used.
    pub fn select<'a>(
        &self,
        state: &'a ClusterState,
        pref: &ReadPreference,
        counters: &SelectionCounters,
    ) -> Result<&'a MemberDescriptor, SelectionError> {
        match pref.mode {
            ReadMode::Primary => state.primary().ok_or(SelectionError::NoPrimaryAvailable),

            ReadMode::PrimaryPreferred => state
                .primary()
                .or_else(|| self.pick_secondary(state, pref, counters))
                .ok_or(SelectionError::NoSecondaryOrPrimaryAvailable),

            ReadMode::Secondary => self
                .pick_secondary(state, pref, counters)
                .ok_or(SelectionError::NoSecondaryAvailable),

            ReadMode::SecondaryPreferred => self
                .pick_secondary(state, pref, counters)
                .or_else(|| state.primary())
                .ok_or(SelectionError::NoSecondaryOrPrimaryAvailable),

            ReadMode::Nearest => {
                let window = self.nearest_window(state, pref);
                if window.is_empty() {
                    return state.primary().ok_or(SelectionError::NoMemberAvailable);
                }
                let idx = SelectionCounters::next(&counters.nearest, window.len());
                Ok(window[idx])
            }
        }
    }

    /// The set `select` draws from for `pref`, without advancing any
    /// counter. Fallbacks are not applied.
    pub fn eligible<'a>(
        &self,
        state: &'a ClusterState,
        pref: &ReadPreference,
    ) -> Vec<&'a MemberDescriptor> {
        match pref.mode {
            ReadMode::Primary => state.primary().into_iter().collect(),
            ReadMode::PrimaryPreferred => match state.primary() {
                Some(p) => vec![p],
                None => self.matching_secondaries(state, pref),
            },
            ReadMode::Secondary | ReadMode::SecondaryPreferred => {
                self.matching_secondaries(state, pref)
            }
            ReadMode::Nearest => self.nearest_window(state, pref),
        }
    }

    fn matching_secondaries<'a>(
        &self,
        state: &'a ClusterState,
        pref: &ReadPreference,
    ) -> Vec<&'a MemberDescriptor> {
        filter_by_tag_sets(state.secondaries().collect(), &pref.tag_sets)
    }

    fn pick_secondary<'a>(
        &self,
        state: &'a ClusterState,
        pref: &ReadPreference,
        counters: &SelectionCounters,
    ) -> Option<&'a MemberDescriptor> {
        let candidates = self.matching_secondaries(state, pref);
        if candidates.is_empty() {
            return None;
        }
        let idx = SelectionCounters::next(&counters.secondary, candidates.len());
        Some(candidates[idx])
    }

    /// Primary and secondaries matching the tag sets, sorted by latency and
    /// cut to those within `local_threshold` of the fastest.
    fn nearest_window<'a>(
        &self,
        state: &'a ClusterState,
        pref: &ReadPreference,
    ) -> Vec<&'a MemberDescriptor> {
        let pool: Vec<_> = state.primary().into_iter().chain(state.secondaries()).collect();
        let mut candidates = filter_by_tag_sets(pool, &pref.tag_sets);
        candidates.sort_by_key(|m| latency_of(m));

        let Some(fastest) = candidates.first().map(|m| latency_of(m)) else {
            return candidates;
        };
        let limit = fastest.saturating_add(self.local_threshold);
        candidates.retain(|m| latency_of(m) <= limit);
        candidates
    }
}

impl Default for ServerSelector {
    fn default() -> Self {
        Self::new(Duration::from_millis(15))
    }
}

fn latency_of(member: &MemberDescriptor) -> Duration {
    member.last_heartbeat_latency.unwrap_or(Duration::MAX)
}

/// Applies the first tag set that matches anything. Later tag sets are
/// only consulted while earlier ones match nothing.
fn filter_by_tag_sets<'a>(
    candidates: Vec<&'a MemberDescriptor>,
    tag_sets: &[TagSet],
) -> Vec<&'a MemberDescriptor> {
    if tag_sets.is_empty() {
        return candidates;
    }
    for tags in tag_sets {
        let matched: Vec<_> = candidates
            .iter()
            .copied()
            .filter(|m| m.matches_tags(tags))
            .collect();
        if !matched.is_empty() {
            return matched;
        }
    }
    Vec::new()
}
