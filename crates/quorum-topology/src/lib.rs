//! quorum-topology: replica set discovery, monitoring and server selection.
//!
//! This crate is the part of a database driver that decides where each
//! operation goes. It discovers the members of a replica set from a seed
//! list, keeps probing every member for its role and latency, maintains a
//! consistent view of who is primary, and picks a member for each
//! operation according to its read preference.
//!
//! # Architecture
//!
//! - **Membership table** ([`ClusterState`]): one descriptor per member,
//!   updated only from heartbeat results. Enforces a single primary,
//!   rejects stale primary claims and replies from other sets, and grows
//!   from the hosts members advertise.
//! - **Heartbeats** ([`HeartbeatMonitor`]): one task per member, probing at
//!   a steady cadence and quickly after a failure.
//! - **Selection** ([`ServerSelector`]): a pure function of the table and a
//!   [`ReadPreference`].
//! - **Topology** ([`Topology`]): lifecycle, the reconnect loop, operation
//!   dispatch and events.
//!
//! Encoding messages and moving bytes are left to the caller through the
//! [`WireCodec`], [`PoolFactory`] and [`ConnectionPool`] traits.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use quorum_topology::{ReadPreference, Topology, TopologyOptions, OperationOptions};
//!
//! let options = TopologyOptions::new("rs0", ["db1:27017", "db2:27017"]);
//! let topology = Topology::builder(options, pool_factory, codec).build()?;
//! topology.connect().await?;
//!
//! let opts = OperationOptions::with_read_preference(ReadPreference::nearest());
//! let reply = topology.command("app.$cmd", cmd, opts).await?;
//! topology.destroy().await;
//! ```

mod address;
mod config;
mod controller;
mod cursor;
mod driver;
mod error;
mod events;
mod member;
mod monitor;
mod registry;
mod reply;
mod selector;
mod session;
mod topology;
mod transport;


pub use address::{AddressParseError, ServerAddress, DEFAULT_PORT};
pub use config::TopologyOptions;
pub use controller::{Topology, TopologyBuilder, TopologyState};
pub use cursor::Cursor;
pub use error::{
    CodecError, ConfigError, ConnectError, SelectionError, TopologyError, TransportError,
};
pub use events::{EventBus, TopologyEvent};
pub use member::MemberHandle;
pub use monitor::{HeartbeatMonitor, MonitorConfig, MonitorReport, ProbeOutcome};
pub use registry::TopologyRegistry;
pub use reply::{ElectionId, HelloReply, MemberRole, MAX_ADVERTISED_HOSTS};
pub use selector::{ReadMode, ReadPreference, SelectionCounters, ServerSelector, TagSet};
pub use session::{ServerSession, SessionPool};
pub use topology::{
    ClusterState, FailureOutcome, MemberDescriptor, ProbeResult, Rejection, RoleTransition,
    StateChange, TopologySummary,
};
pub use transport::{
    BufferedOperation, ConnectionPool, DisconnectBuffer, OpKind, Operation, OperationBuffer,
    OperationOptions, PoolFactory, WireCodec, WriteOptions,
};
