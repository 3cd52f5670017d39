//! Per-member heartbeat loop.
//!
//! Each known member gets one [`HeartbeatMonitor`] running as its own task.
//! The monitor never touches the membership table; it only sends
//! [`MonitorReport`]s to the topology driver, tagged with the generation
//! of the handle it probed so the driver can discard results that arrive
//! after the member was reconnected or removed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::address::ServerAddress;
use crate::config::TopologyOptions;
use crate::error::TransportError;
use crate::events::{EventBus, TopologyEvent};
use crate::member::MemberHandle;
use crate::reply::HelloReply;

/// Heartbeat cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Delay between probes of a healthy member.
    pub frequency: Duration,
    /// Delay after a failed probe, and the minimum gap between any two.
    pub min_frequency: Duration,
    /// Per-probe timeout, connect included.
    pub timeout: Duration,
}

impl From<&TopologyOptions> for MonitorConfig {
    fn from(opts: &TopologyOptions) -> Self {
        Self {
            frequency: opts.heartbeat_frequency(),
            min_frequency: opts.min_heartbeat_frequency(),
            timeout: opts.heartbeat_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Reply { reply: HelloReply, latency: Duration },
    Failed { error: TransportError, latency: Duration },
}

impl ProbeOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ProbeOutcome::Failed { .. })
    }
}

/// One finished heartbeat.
#[derive(Debug, Clone)]
pub struct MonitorReport {
    pub address: ServerAddress,
    /// Generation of the handle that was probed.
    pub generation: u64,
    pub outcome: ProbeOutcome,
}

pub struct HeartbeatMonitor {
    handle: Arc<MemberHandle>,
    config: MonitorConfig,
    reports: mpsc::Sender<MonitorReport>,
    events: EventBus,
    cancel: CancellationToken,
    wake: Arc<Notify>,
}

impl HeartbeatMonitor {
    pub fn new(
        handle: Arc<MemberHandle>,
        config: MonitorConfig,
        reports: mpsc::Sender<MonitorReport>,
        events: EventBus,
        cancel: CancellationToken,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            handle,
            config,
            reports,
            events,
            cancel,
            wake,
        }
    }

    /// Starts the loop. The first probe is sent immediately.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let address = self.handle.address().clone();
        let generation = self.handle.generation();
        debug!(%address, generation, "heartbeat monitor started");

        loop {
            let started = Instant::now();
            self.events.publish(TopologyEvent::HeartbeatStarted {
                address: address.clone(),
            });

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = self.handle.probe(self.config.timeout) => r,
            };

            let outcome = match result {
                Ok((reply, latency)) => {
                    trace!(%address, latency_ms = latency.as_millis() as u64, "heartbeat succeeded");
                    self.events.publish(TopologyEvent::HeartbeatSucceeded {
                        address: address.clone(),
                        latency,
                        reply: Box::new(reply.clone()),
                    });
                    ProbeOutcome::Reply { reply, latency }
                }
                Err(error) => {
                    let latency = started.elapsed();
                    debug!(%address, generation, %error, "heartbeat failed");
                    self.events.publish(TopologyEvent::HeartbeatFailed {
                        address: address.clone(),
                        latency,
                        error: error.to_string(),
                    });
                    ProbeOutcome::Failed { error, latency }
                }
            };

            let failed = outcome.is_failure();
            let report = MonitorReport {
                address: address.clone(),
                generation,
                outcome,
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                sent = self.reports.send(report) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }

            let delay = if failed {
                self.config.min_frequency
            } else {
                self.config.frequency
            };
            let woken = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => false,
                _ = self.wake.notified() => true,
            };
            if woken {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(started + self.config.min_frequency) => {}
                }
            }
        }

        debug!(%address, generation, "heartbeat monitor stopped");
    }
}
