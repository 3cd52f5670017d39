//! Live topology and member counts.
//!
//! A registry is created by the application and shared by every topology
//! it builds. Nothing here is process-global; two registries never see each
//! other's counts.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts of live topologies and member handles.
#[derive(Debug, Default)]
pub struct TopologyRegistry {
    topologies: AtomicUsize,
    members: AtomicUsize,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_topologies(&self) -> usize {
        self.topologies.load(Ordering::Relaxed)
    }

    pub fn live_members(&self) -> usize {
        self.members.load(Ordering::Relaxed)
    }

    pub(crate) fn topology_opened(&self) {
        self.topologies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn topology_closed(&self) {
        decrement(&self.topologies);
    }

    pub(crate) fn member_opened(&self) {
        self.members.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn member_closed(&self) {
        decrement(&self.members);
    }
}

fn decrement(counter: &AtomicUsize) {
    // saturating: a double close must not wrap
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
}
