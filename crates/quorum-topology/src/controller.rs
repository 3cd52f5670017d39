//! The replica set topology: lifecycle, monitoring and operation dispatch.
//!
//! A [`Topology`] is a cheap, cloneable handle. Behind it sit the
//! membership table, the member handles, and a single driver task that
//! consumes heartbeat reports and is the only writer of the table. Callers
//! never wait on the driver to select a member; selection reads the table
//! under a short read lock and never suspends.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!       ^            |  ^          |
//!       +------------+  +----------+--> Disconnected (all members lost)
//!
//! any state -> Destroyed (terminal)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::ServerAddress;
use crate::config::TopologyOptions;
use crate::cursor::Cursor;
use crate::driver::Driver;
use crate::error::{ConfigError, ConnectError, SelectionError, TopologyError};
use crate::events::{EventBus, TopologyEvent};
use crate::member::MemberHandle;
use crate::registry::TopologyRegistry;
use crate::selector::{ReadPreference, SelectionCounters, ServerSelector};
use crate::session::{ServerSession, SessionPool};
use crate::topology::{ClusterState, MemberDescriptor, TopologySummary};
use crate::transport::{
    BufferedOperation, DisconnectBuffer, OpKind, Operation, OperationOptions, PoolFactory,
    WireCodec,
};

/// Lifecycle state of a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyState {
    Disconnected,
    Connecting,
    Connected,
    Destroyed,
}

impl TopologyState {
    /// Returns true if moving from `self` to `next` is legal.
    pub fn can_transition_to(self, next: TopologyState) -> bool {
        use TopologyState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected | Disconnected) => true,
            (Connected, Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TopologyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopologyState::Disconnected => "disconnected",
            TopologyState::Connecting => "connecting",
            TopologyState::Connected => "connected",
            TopologyState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// A member handle and the token that stops its monitor.
pub(crate) struct MemberEntry {
    pub(crate) handle: Arc<MemberHandle>,
    pub(crate) cancel: CancellationToken,
}

pub(crate) struct Inner {
    pub(crate) options: TopologyOptions,
    pub(crate) seeds: Vec<ServerAddress>,
    state: RwLock<ClusterState>,
    members: RwLock<HashMap<ServerAddress, MemberEntry>>,
    lifecycle: watch::Sender<TopologyState>,
    started: AtomicBool,
    selector: ServerSelector,
    counters: SelectionCounters,
    pub(crate) events: EventBus,
    pub(crate) factory: Arc<dyn PoolFactory>,
    pub(crate) codec: Arc<dyn WireCodec>,
    pub(crate) buffer: Option<Arc<dyn DisconnectBuffer>>,
    sessions: SessionPool,
    pub(crate) registry: Arc<TopologyRegistry>,
    /// Root token; every monitor runs under a child of it.
    pub(crate) cancel: CancellationToken,
    /// Wakes monitors for an immediate heartbeat.
    pub(crate) wake: Arc<Notify>,
    /// Asks the driver to retry buffered operations.
    pub(crate) flush: Notify,
}

impl Inner {
    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, ClusterState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, ClusterState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn members(&self) -> RwLockWriteGuard<'_, HashMap<ServerAddress, MemberEntry>> {
        self.members.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn lifecycle(&self) -> TopologyState {
        *self.lifecycle.borrow()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.lifecycle() == TopologyState::Destroyed
    }

    /// Moves to `next` if the transition table allows it. Asking for the
    /// current state is a no-op; anything else illegal is logged and
    /// ignored.
    pub(crate) fn transition(&self, next: TopologyState) -> bool {
        let mut applied = false;
        self.lifecycle.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                warn!(from = %current, to = %next, "ignoring illegal topology state transition");
                return false;
            }
            debug!(from = %current, to = %next, "topology state changed");
            *current = next;
            applied = true;
            true
        });
        applied
    }

    /// Picks a member for `pref` and returns its live handle.
    pub(crate) fn select_handle(
        &self,
        pref: &ReadPreference,
    ) -> Result<Arc<MemberHandle>, SelectionError> {
        let address = {
            let state = self.read_state();
            self.selector
                .select(&state, pref, &self.counters)?
                .address
                .clone()
        };
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        members
            .get(&address)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| pref.mode.unavailable())
    }

    /// Tears everything down. Only the first call does any work.
    pub(crate) async fn shutdown(&self) {
        if !self.transition(TopologyState::Destroyed) {
            return;
        }
        info!(set_name = %self.options.set_name, "destroying topology");
        self.cancel.cancel();

        let entries: Vec<_> = self.members().drain().collect();
        for (address, entry) in entries {
            entry.cancel.cancel();
            entry.handle.destroy().await;
            self.events.publish(TopologyEvent::ServerClosed { address });
        }
        self.write_state().clear();

        if let Some(buffer) = &self.buffer {
            for op in buffer.drain() {
                let _ = op.reply.send(Err(TopologyError::Destroyed));
            }
        }

        let ended = self.sessions.drain();
        if !ended.is_empty() {
            debug!(sessions = ended.len(), "drained session pool");
        }

        self.registry.topology_closed();
        self.events.publish(TopologyEvent::TopologyClosed {
            set_name: self.options.set_name.clone(),
        });
    }
}

/// Builds a [`Topology`] from options and collaborators.
pub struct TopologyBuilder {
    options: TopologyOptions,
    factory: Arc<dyn PoolFactory>,
    codec: Arc<dyn WireCodec>,
    buffer: Option<Arc<dyn DisconnectBuffer>>,
    registry: Option<Arc<TopologyRegistry>>,
}

impl TopologyBuilder {
    /// Parks operations here while no member can take them, instead of
    /// failing them with a selection error.
    pub fn disconnect_buffer(mut self, buffer: Arc<dyn DisconnectBuffer>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    /// Counts this topology and its members in a shared registry.
    pub fn registry(mut self, registry: Arc<TopologyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validates the options and builds the topology. No I/O happens until
    /// [`Topology::connect`].
    pub fn build(self) -> Result<Topology, ConfigError> {
        let seeds = self.options.validate()?;
        let registry = self.registry.unwrap_or_default();
        registry.topology_opened();

        let (lifecycle, _) = watch::channel(TopologyState::Disconnected);
        let inner = Inner {
            state: RwLock::new(ClusterState::new(self.options.set_name.clone())),
            members: RwLock::new(HashMap::new()),
            lifecycle,
            started: AtomicBool::new(false),
            selector: ServerSelector::new(self.options.local_threshold()),
            counters: SelectionCounters::default(),
            events: EventBus::new(self.options.event_capacity),
            factory: self.factory,
            codec: self.codec,
            buffer: self.buffer,
            sessions: SessionPool::new(),
            registry,
            cancel: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
            flush: Notify::new(),
            seeds,
            options: self.options,
        };
        Ok(Topology {
            inner: Arc::new(inner),
        })
    }
}

/// Client-side view of one replica set.
///
/// Clones share the same underlying topology. Call [`Topology::destroy`]
/// when done; background tasks run until then.
#[derive(Clone)]
pub struct Topology {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("set_name", &self.inner.options.set_name)
            .field("state", &self.inner.lifecycle())
            .finish()
    }
}

impl Topology {
    pub fn builder(
        options: TopologyOptions,
        factory: Arc<dyn PoolFactory>,
        codec: Arc<dyn WireCodec>,
    ) -> TopologyBuilder {
        TopologyBuilder {
            options,
            factory,
            codec,
            buffer: None,
            registry: None,
        }
    }

    pub fn set_name(&self) -> &str {
        &self.inner.options.set_name
    }

    pub fn options(&self) -> &TopologyOptions {
        &self.inner.options
    }

    /// Probes the seeds and waits until the set is usable.
    ///
    /// Succeeds once a primary is known, or a secondary if
    /// `secondary_only_connection_allowed` is set. Fails, and destroys the
    /// topology, if every member has answered or failed without meeting
    /// that bar, or the connect timeout passes first. A topology connects
    /// at most once.
    pub async fn connect(&self) -> Result<(), TopologyError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(ConnectError::InvalidState(inner.lifecycle()).into());
        }
        if !inner.transition(TopologyState::Connecting) {
            return Err(ConnectError::InvalidState(inner.lifecycle()).into());
        }
        info!(set_name = %inner.options.set_name, seeds = inner.seeds.len(), "connecting to replica set");
        inner.events.publish(TopologyEvent::TopologyOpened {
            set_name: inner.options.set_name.clone(),
        });

        let (reports_tx, reports_rx) = mpsc::channel(inner.options.report_capacity);
        let (result_tx, result_rx) = oneshot::channel();
        let driver = Driver::new(inner.clone(), reports_tx, reports_rx, result_tx);
        tokio::spawn(driver.run());

        match result_rx.await {
            Ok(result) => result.map_err(TopologyError::from),
            Err(_) => Err(ConnectError::Destroyed.into()),
        }
    }

    /// Stops every monitor, closes every member and fails any buffered
    /// operations. Idempotent.
    pub async fn destroy(&self) {
        self.inner.shutdown().await;
    }

    pub fn state(&self) -> TopologyState {
        self.inner.lifecycle()
    }

    /// A receiver that observes every lifecycle change.
    pub fn watch_state(&self) -> watch::Receiver<TopologyState> {
        self.inner.lifecycle.subscribe()
    }

    /// Returns true if connected and some member satisfies `pref` right
    /// now.
    pub fn is_connected(&self, pref: &ReadPreference) -> bool {
        if self.inner.lifecycle() != TopologyState::Connected {
            return false;
        }
        let state = self.inner.read_state();
        // scratch counters so probing doesn't disturb the rotation
        self.inner
            .selector
            .select(&state, pref, &SelectionCounters::default())
            .is_ok()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.inner.events.subscribe()
    }

    /// Asks every idle monitor to probe now, subject to the minimum
    /// heartbeat interval.
    pub fn request_check(&self) {
        self.inner.wake.notify_waiters();
    }

    /// The last member accepted as primary, even if it's gone since.
    pub fn last_known_primary_description(&self) -> Option<MemberDescriptor> {
        self.inner.read_state().last_known_primary().cloned()
    }

    /// Selects a member for `pref`, as an operation would.
    pub fn get_server(&self, pref: &ReadPreference) -> Result<MemberDescriptor, SelectionError> {
        let state = self.inner.read_state();
        self.inner
            .selector
            .select(&state, pref, &self.inner.counters)
            .cloned()
    }

    pub fn get_servers(&self) -> Vec<MemberDescriptor> {
        self.inner.read_state().all_members().cloned().collect()
    }

    pub fn summary(&self) -> TopologySummary {
        self.inner.read_state().summary()
    }

    /// Runs a command. Reads honor `options.read_preference`.
    pub async fn command(
        &self,
        ns: impl Into<String>,
        cmd: Bytes,
        options: OperationOptions,
    ) -> Result<Bytes, TopologyError> {
        self.dispatch(Operation::new(OpKind::Command, ns, vec![cmd]), options)
            .await
    }

    /// Inserts documents. Always sent to the primary.
    pub async fn insert(
        &self,
        ns: impl Into<String>,
        docs: Vec<Bytes>,
        options: OperationOptions,
    ) -> Result<Bytes, TopologyError> {
        self.dispatch(Operation::new(OpKind::Insert, ns, docs), options)
            .await
    }

    /// Applies update statements. Always sent to the primary.
    pub async fn update(
        &self,
        ns: impl Into<String>,
        updates: Vec<Bytes>,
        options: OperationOptions,
    ) -> Result<Bytes, TopologyError> {
        self.dispatch(Operation::new(OpKind::Update, ns, updates), options)
            .await
    }

    /// Applies delete statements. Always sent to the primary.
    pub async fn remove(
        &self,
        ns: impl Into<String>,
        deletes: Vec<Bytes>,
        options: OperationOptions,
    ) -> Result<Bytes, TopologyError> {
        self.dispatch(Operation::new(OpKind::Remove, ns, deletes), options)
            .await
    }

    /// A cursor over the results of `cmd`. Nothing is sent until the first
    /// [`Cursor::next_batch`].
    pub fn cursor(&self, ns: impl Into<String>, cmd: Bytes, options: OperationOptions) -> Cursor {
        Cursor::new(self.clone(), ns.into(), cmd, options)
    }

    async fn dispatch(
        &self,
        op: Operation,
        options: OperationOptions,
    ) -> Result<Bytes, TopologyError> {
        match options.timeout {
            Some(limit) => tokio::time::timeout(limit, self.dispatch_inner(op, &options))
                .await
                .map_err(|_| TopologyError::Timeout(limit))?,
            None => self.dispatch_inner(op, &options).await,
        }
    }

    async fn dispatch_inner(
        &self,
        op: Operation,
        options: &OperationOptions,
    ) -> Result<Bytes, TopologyError> {
        if self.is_destroyed() {
            return Err(TopologyError::Destroyed);
        }
        let pref = if op.kind.is_write() {
            ReadPreference::primary()
        } else {
            options.read_preference.clone()
        };

        let err = match self.inner.select_handle(&pref) {
            Ok(handle) => return Ok(handle.execute(&op).await?),
            Err(err) => err,
        };
        self.request_check();

        let Some(buffer) = &self.inner.buffer else {
            return Err(err.into());
        };
        debug!(kind = %op.kind, ns = %op.ns, mode = %pref.mode, "no member selectable, buffering operation");
        let (tx, rx) = oneshot::channel();
        buffer
            .add(BufferedOperation {
                operation: op,
                read_preference: pref,
                reply: tx,
            })
            .map_err(|_| TopologyError::BufferFull)?;

        // destroy may have drained the buffer before our add landed
        if self.is_destroyed() {
            for op in buffer.drain() {
                let _ = op.reply.send(Err(TopologyError::Destroyed));
            }
        }
        self.inner.flush.notify_one();

        rx.await.map_err(|_| TopologyError::Abandoned)?
    }

    /// Session timeout advertised by the set.
    pub fn logical_session_timeout(&self) -> Option<Duration> {
        self.inner.read_state().logical_session_timeout()
    }

    /// Takes a session from the pool, or starts a new one.
    pub fn acquire_session(&self) -> Result<ServerSession, TopologyError> {
        if self.is_destroyed() {
            return Err(TopologyError::Destroyed);
        }
        let timeout = self
            .logical_session_timeout()
            .ok_or(TopologyError::SessionsUnsupported)?;
        Ok(self.inner.sessions.acquire(timeout))
    }

    /// Returns a session for reuse.
    pub fn release_session(&self, session: ServerSession) {
        if let Some(timeout) = self.logical_session_timeout() {
            self.inner.sessions.release(session, timeout);
        }
    }

    /// Stops session pooling and returns the ids of pooled sessions so they
    /// can be ended on the server.
    pub fn drain_sessions(&self) -> Vec<uuid::Uuid> {
        self.inner.sessions.drain()
    }

    pub fn registry(&self) -> &Arc<TopologyRegistry> {
        &self.inner.registry
    }
}
