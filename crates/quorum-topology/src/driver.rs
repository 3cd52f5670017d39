//! The task that owns membership changes.
//!
//! Heartbeat monitors report into a bounded queue; the driver applies each
//! report to the membership table, starts and stops monitors as members
//! come and go, decides when the initial connect has succeeded or failed,
//! runs the reconnect loop once every member is lost, and retries buffered
//! operations after each change.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::address::ServerAddress;
use crate::controller::{Inner, MemberEntry, TopologyState};
use crate::error::{ConnectError, TopologyError, TransportError};
use crate::events::TopologyEvent;
use crate::member::MemberHandle;
use crate::monitor::{HeartbeatMonitor, MonitorConfig, MonitorReport, ProbeOutcome};
use crate::reply::{HelloReply, MemberRole};
use crate::topology::{FailureOutcome, ProbeResult, Rejection, StateChange, TopologySummary};

/// Bookkeeping while the first connect is in flight.
struct InitialConnect {
    /// Members that have answered or failed at least once.
    probed: HashSet<ServerAddress>,
    result: oneshot::Sender<Result<(), ConnectError>>,
}

pub(crate) struct Driver {
    inner: Arc<Inner>,
    reports_tx: mpsc::Sender<MonitorReport>,
    reports_rx: mpsc::Receiver<MonitorReport>,
    monitor_config: MonitorConfig,
    initial: Option<InitialConnect>,
    /// Every member address not retired by a primary's host list. The
    /// reconnect loop recreates handles for all of them.
    last_known: BTreeSet<ServerAddress>,
    reconnecting: bool,
    reconnect_timer: Interval,
    full_setup_announced: bool,
    all_connected_announced: bool,
}

impl Driver {
    pub(crate) fn new(
        inner: Arc<Inner>,
        reports_tx: mpsc::Sender<MonitorReport>,
        reports_rx: mpsc::Receiver<MonitorReport>,
        result: oneshot::Sender<Result<(), ConnectError>>,
    ) -> Self {
        let mut reconnect_timer = tokio::time::interval(inner.options.heartbeat_frequency());
        reconnect_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            monitor_config: MonitorConfig::from(&inner.options),
            last_known: inner.seeds.iter().cloned().collect(),
            inner,
            reports_tx,
            reports_rx,
            initial: Some(InitialConnect {
                probed: HashSet::new(),
                result,
            }),
            reconnecting: false,
            reconnect_timer,
            full_setup_announced: false,
            all_connected_announced: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let seeds = self.inner.seeds.clone();
        for seed in &seeds {
            self.inner.write_state().insert_unknown(seed.clone());
            self.start_member(seed).await;
        }

        let deadline = tokio::time::sleep(self.inner.options.connect_timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                _ = &mut deadline, if self.initial.is_some() => self.connect_timed_out().await,
                Some(report) = self.reports_rx.recv() => self.apply(report).await,
                _ = self.reconnect_timer.tick(), if self.reconnecting => self.reconnect_round().await,
                _ = self.inner.flush.notified() => self.flush_buffer(),
            }
        }

        if let Some(initial) = self.initial.take() {
            let _ = initial.result.send(Err(ConnectError::Destroyed));
        }
        debug!(set_name = %self.inner.options.set_name, "topology driver stopped");
    }

    async fn apply(&mut self, report: MonitorReport) {
        let MonitorReport {
            address,
            generation,
            outcome,
        } = report;

        let current = self.inner.read_state().generation_of(&address);
        if current != Some(generation) {
            debug!(%address, generation, ?current, "discarding stale heartbeat result");
            return;
        }
        if let Some(initial) = &mut self.initial {
            initial.probed.insert(address.clone());
        }

        match outcome {
            ProbeOutcome::Reply { reply, latency } => {
                self.apply_reply(address, reply, latency).await
            }
            ProbeOutcome::Failed { error, .. } => self.apply_failure(address, error).await,
        }
        self.after_update().await;
    }

    async fn apply_reply(&mut self, address: ServerAddress, reply: HelloReply, latency: Duration) {
        let (change, previous, current) = {
            let mut state = self.inner.write_state();
            let previous = state.summary();
            let change = state.update(ProbeResult {
                address: address.clone(),
                reply,
                latency,
            });
            (change, previous, state.summary())
        };

        if let Some(Rejection::SetNameMismatch { found }) = &change.rejection {
            if self.initial.is_some() && self.inner.options.strict_set_name {
                let error = ConnectError::SetNameMismatch {
                    address,
                    expected: self.inner.options.set_name.clone(),
                    found: found.clone(),
                };
                self.fail_connect(error).await;
                return;
            }
        }

        self.publish_change(&change, previous, current);

        for discovered in &change.discovered {
            self.last_known.insert(discovered.clone());
            self.start_member(discovered).await;
        }
        for (removed, _) in &change.removed {
            self.last_known.remove(removed);
            self.stop_member(removed).await;
        }
    }

    async fn apply_failure(&mut self, address: ServerAddress, error: TransportError) {
        let initial = self.initial.is_some();
        let (outcome, before, after) = {
            let mut state = self.inner.write_state();
            let before = state.summary();
            let outcome = state.record_failure(
                &address,
                initial,
                self.inner.options.max_heartbeat_failures,
                &error.to_string(),
            );
            (outcome, before, state.summary())
        };

        let role = match outcome {
            FailureOutcome::Ignored => return,
            FailureOutcome::Demoted { previous }
            | FailureOutcome::RecordedFailed { previous } => previous,
            FailureOutcome::Removed { previous } => {
                info!(%address, %error, "member removed after repeated heartbeat failures");
                if counts_as_member(previous) {
                    self.inner.events.publish(TopologyEvent::MemberLeft {
                        role: previous,
                        address: address.clone(),
                    });
                }
                self.stop_member(&address).await;
                self.inner
                    .events
                    .publish(TopologyEvent::TopologyDescriptionChanged {
                        previous: before,
                        current: after,
                    });
                return;
            }
        };

        if role != MemberRole::Unknown {
            info!(%address, from = %role, %error, "member unreachable");
            self.inner
                .events
                .publish(TopologyEvent::ServerDescriptionChanged {
                    address: address.clone(),
                    previous: role,
                    current: MemberRole::Unknown,
                });
            if counts_as_member(role) {
                self.inner.events.publish(TopologyEvent::MemberLeft {
                    role,
                    address: address.clone(),
                });
            }
            self.inner
                .events
                .publish(TopologyEvent::TopologyDescriptionChanged {
                    previous: before,
                    current: after,
                });
        }
    }

    fn publish_change(&self, change: &StateChange, previous: TopologySummary, current: TopologySummary) {
        if !change.membership_changed {
            return;
        }
        let events = &self.inner.events;
        for t in &change.transitions {
            events.publish(TopologyEvent::ServerDescriptionChanged {
                address: t.address.clone(),
                previous: t.from,
                current: t.to,
            });
            if counts_as_member(t.from) {
                events.publish(TopologyEvent::MemberLeft {
                    role: t.from,
                    address: t.address.clone(),
                });
            }
            if counts_as_member(t.to) {
                events.publish(TopologyEvent::MemberJoined {
                    role: t.to,
                    address: t.address.clone(),
                });
            }
        }
        for (address, role) in &change.removed {
            if counts_as_member(*role) {
                events.publish(TopologyEvent::MemberLeft {
                    role: *role,
                    address: address.clone(),
                });
            }
        }
        events.publish(TopologyEvent::TopologyDescriptionChanged { previous, current });
    }

    /// Re-evaluates connect progress, the reconnect loop and the
    /// announcements after any report.
    async fn after_update(&mut self) {
        let (has_primary, has_secondary, reachable, responded, total, all_probed) = {
            let state = self.inner.read_state();
            let all_probed = match &self.initial {
                Some(initial) => state.addresses().all(|a| initial.probed.contains(a)),
                None => true,
            };
            (
                state.has_primary(),
                state.has_secondary(),
                state.reachable_count(),
                state.responded_count(),
                state.len(),
                all_probed,
            )
        };

        if self.initial.is_some() {
            let usable = has_primary
                || (self.inner.options.secondary_only_connection_allowed && has_secondary);
            if usable {
                self.finish_connect();
            } else if all_probed {
                let error = if responded == 0 {
                    ConnectError::NoReachableSeeds {
                        failed: self.inner.read_state().failed_addresses().cloned().collect(),
                    }
                } else {
                    ConnectError::NoPrimaryFound { responded }
                };
                self.fail_connect(error).await;
                return;
            }
        } else if self.reconnecting {
            if reachable > 0 {
                self.reconnecting = false;
                self.inner.transition(TopologyState::Connecting);
                self.inner.transition(TopologyState::Connected);
                info!(reachable, "member reachable again, leaving reconnect loop");
                self.inner.events.publish(TopologyEvent::Reconnected);
            }
        } else if reachable == 0 && self.inner.lifecycle() == TopologyState::Connected {
            warn!(
                set_name = %self.inner.options.set_name,
                "every member unreachable, starting reconnect loop"
            );
            self.reconnecting = true;
            self.reconnect_timer.reset();
            self.inner.transition(TopologyState::Disconnected);
            self.inner.events.publish(TopologyEvent::Disconnected);
        }

        if self.inner.lifecycle() == TopologyState::Connected {
            if !self.full_setup_announced && has_primary && has_secondary {
                self.full_setup_announced = true;
                self.inner.events.publish(TopologyEvent::FullSetup);
            }
            if !self.all_connected_announced && total > 0 && reachable == total {
                self.all_connected_announced = true;
                self.inner.events.publish(TopologyEvent::AllConnected);
            }
        }

        self.flush_buffer();
    }

    fn finish_connect(&mut self) {
        let Some(initial) = self.initial.take() else {
            return;
        };
        self.inner.write_state().reset_failure_counts();
        if !self.inner.transition(TopologyState::Connected) {
            let _ = initial
                .result
                .send(Err(ConnectError::InvalidState(self.inner.lifecycle())));
            return;
        }
        info!(set_name = %self.inner.options.set_name, "connected to replica set");
        self.inner.events.publish(TopologyEvent::Connected);
        let _ = initial.result.send(Ok(()));
    }

    async fn fail_connect(&mut self, error: ConnectError) {
        let Some(initial) = self.initial.take() else {
            return;
        };
        error!(set_name = %self.inner.options.set_name, %error, "initial connect failed");
        self.inner.events.publish(TopologyEvent::ConnectFailed {
            error: error.clone(),
        });
        self.inner.shutdown().await;
        let _ = initial.result.send(Err(error));
    }

    async fn connect_timed_out(&mut self) {
        let responded = self.inner.read_state().responded_count();
        let error = if responded > 0 {
            ConnectError::NoPrimaryFound { responded }
        } else {
            ConnectError::Timeout(self.inner.options.connect_timeout())
        };
        self.fail_connect(error).await;
    }

    /// Recreates a handle and monitor for every last-known member.
    async fn reconnect_round(&mut self) {
        let targets: BTreeSet<ServerAddress> = {
            let state = self.inner.read_state();
            self.last_known
                .iter()
                .chain(state.addresses())
                .cloned()
                .collect()
        };
        self.inner.transition(TopologyState::Connecting);
        info!(members = targets.len(), "reconnect round");

        for address in &targets {
            self.stop_member(address).await;
            {
                let mut state = self.inner.write_state();
                if !state.insert_unknown(address.clone()) {
                    state.reset_generation(address);
                }
            }
            self.start_member(address).await;
        }
    }

    /// Creates the handle and monitor for a member already in the table.
    async fn start_member(&mut self, address: &ServerAddress) {
        let Some(generation) = self.inner.read_state().generation_of(address) else {
            return;
        };
        let handle = Arc::new(MemberHandle::new(
            address.clone(),
            generation,
            self.inner.factory.create(address),
            self.inner.codec.clone(),
            self.inner.registry.clone(),
        ));
        let cancel = self.inner.cancel.child_token();

        let replaced = {
            let mut members = self.inner.members();
            // checked under the lock so shutdown can't miss this entry
            if self.inner.cancel.is_cancelled() {
                drop(members);
                handle.destroy().await;
                return;
            }
            members.insert(
                address.clone(),
                MemberEntry {
                    handle: handle.clone(),
                    cancel: cancel.clone(),
                },
            )
        };
        if let Some(old) = replaced {
            old.cancel.cancel();
            old.handle.destroy().await;
        }

        HeartbeatMonitor::new(
            handle,
            self.monitor_config,
            self.reports_tx.clone(),
            self.inner.events.clone(),
            cancel,
            self.inner.wake.clone(),
        )
        .spawn();
        debug!(%address, generation, "member monitor started");
        self.inner.events.publish(TopologyEvent::ServerOpened {
            address: address.clone(),
        });
    }

    async fn stop_member(&mut self, address: &ServerAddress) {
        let entry = self.inner.members().remove(address);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            entry.handle.destroy().await;
            self.inner.events.publish(TopologyEvent::ServerClosed {
                address: address.clone(),
            });
        }
    }

    /// Sends every buffered operation that can now be placed. The rest go
    /// back into the buffer; operations whose caller stopped waiting are
    /// dropped.
    fn flush_buffer(&self) {
        let Some(buffer) = &self.inner.buffer else {
            return;
        };
        if buffer.is_empty() || self.inner.is_destroyed() {
            return;
        }

        let mut dispatched = 0usize;
        for op in buffer.drain() {
            if op.is_abandoned() {
                continue;
            }
            match self.inner.select_handle(&op.read_preference) {
                Ok(handle) => {
                    dispatched += 1;
                    tokio::spawn(async move {
                        let result = handle
                            .execute(&op.operation)
                            .await
                            .map_err(TopologyError::from);
                        let _ = op.reply.send(result);
                    });
                }
                Err(_) => {
                    if let Err(op) = buffer.add(op) {
                        let _ = op.reply.send(Err(TopologyError::BufferFull));
                    }
                }
            }
        }
        if dispatched > 0 {
            debug!(dispatched, remaining = buffer.len(), "re-dispatched buffered operations");
        }
    }
}

/// Roles that make a member part of a selectable bucket.
fn counts_as_member(role: MemberRole) -> bool {
    role.is_member()
}
