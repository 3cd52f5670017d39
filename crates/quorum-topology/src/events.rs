//! Lifecycle and monitoring events.
//!
//! The topology publishes typed records on a broadcast channel. Publishing
//! never blocks and never fails: with no subscribers an event is simply
//! dropped, and a slow subscriber sees `RecvError::Lagged` rather than
//! holding up heartbeat processing.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::address::ServerAddress;
use crate::error::ConnectError;
use crate::reply::{HelloReply, MemberRole};
use crate::topology::TopologySummary;

/// Everything the topology reports to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    TopologyOpened {
        set_name: String,
    },
    TopologyClosed {
        set_name: String,
    },
    /// A member handle was created.
    ServerOpened {
        address: ServerAddress,
    },
    /// A member handle was destroyed.
    ServerClosed {
        address: ServerAddress,
    },
    ServerDescriptionChanged {
        address: ServerAddress,
        previous: MemberRole,
        current: MemberRole,
    },
    TopologyDescriptionChanged {
        previous: TopologySummary,
        current: TopologySummary,
    },
    HeartbeatStarted {
        address: ServerAddress,
    },
    HeartbeatSucceeded {
        address: ServerAddress,
        latency: Duration,
        reply: Box<HelloReply>,
    },
    HeartbeatFailed {
        address: ServerAddress,
        latency: Duration,
        error: String,
    },
    /// A member took on a role that makes it selectable.
    MemberJoined {
        role: MemberRole,
        address: ServerAddress,
    },
    /// A member lost the role it held.
    MemberLeft {
        role: MemberRole,
        address: ServerAddress,
    },
    /// The initial connect criteria were met.
    Connected,
    /// A primary and at least one secondary are known.
    FullSetup,
    /// Every known member has answered a heartbeat.
    AllConnected,
    /// A member answered after every member had become unreachable.
    Reconnected,
    /// Every member became unreachable.
    Disconnected,
    ConnectFailed {
        error: ConnectError,
    },
}

impl TopologyEvent {
    /// Short name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            TopologyEvent::TopologyOpened { .. } => "topology_opened",
            TopologyEvent::TopologyClosed { .. } => "topology_closed",
            TopologyEvent::ServerOpened { .. } => "server_opened",
            TopologyEvent::ServerClosed { .. } => "server_closed",
            TopologyEvent::ServerDescriptionChanged { .. } => "server_description_changed",
            TopologyEvent::TopologyDescriptionChanged { .. } => "topology_description_changed",
            TopologyEvent::HeartbeatStarted { .. } => "heartbeat_started",
            TopologyEvent::HeartbeatSucceeded { .. } => "heartbeat_succeeded",
            TopologyEvent::HeartbeatFailed { .. } => "heartbeat_failed",
            TopologyEvent::MemberJoined { .. } => "member_joined",
            TopologyEvent::MemberLeft { .. } => "member_left",
            TopologyEvent::Connected => "connected",
            TopologyEvent::FullSetup => "full_setup",
            TopologyEvent::AllConnected => "all_connected",
            TopologyEvent::Reconnected => "reconnected",
            TopologyEvent::Disconnected => "disconnected",
            TopologyEvent::ConnectFailed { .. } => "connect_failed",
        }
    }
}

/// Sending half of the event channel. Cheap to clone; every monitor holds
/// one.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TopologyEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: TopologyEvent) {
        // an error only means nobody is listening
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.tx.subscribe()
    }
}
