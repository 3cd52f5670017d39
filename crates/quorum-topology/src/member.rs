//! One network endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::address::ServerAddress;
use crate::error::TransportError;
use crate::registry::TopologyRegistry;
use crate::reply::HelloReply;
use crate::transport::{ConnectionPool, Operation, WireCodec, WriteOptions};

/// A member's connection pool plus the codec needed to talk to it.
///
/// A handle is tied to one generation of its member. When the member is
/// reconnected the old handle is destroyed and a new one created, so a
/// handle never outlives the generation it was built for.
pub struct MemberHandle {
    address: ServerAddress,
    generation: u64,
    pool: Arc<dyn ConnectionPool>,
    codec: Arc<dyn WireCodec>,
    registry: Arc<TopologyRegistry>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for MemberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberHandle")
            .field("address", &self.address)
            .field("generation", &self.generation)
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemberHandle {
    pub fn new(
        address: ServerAddress,
        generation: u64,
        pool: Arc<dyn ConnectionPool>,
        codec: Arc<dyn WireCodec>,
        registry: Arc<TopologyRegistry>,
    ) -> Self {
        registry.member_opened();
        Self {
            address,
            generation,
            pool,
            codec,
            registry,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_connected(&self) -> bool {
        !self.is_destroyed() && self.pool.is_connected()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    async fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Closed);
        }
        if !self.pool.is_connected() {
            debug!(address = %self.address, generation = self.generation, "connecting");
            self.pool.connect().await?;
        }
        Ok(())
    }

    /// Sends a role probe and returns the decoded reply with its round-trip
    /// time. Connecting, if needed, counts against `timeout` but not
    /// against the measured latency.
    pub async fn probe(&self, timeout: Duration) -> Result<(HelloReply, Duration), TransportError> {
        let deadline = Instant::now() + timeout;

        tokio::time::timeout_at(deadline, self.ensure_connected())
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        let request = self.codec.probe_request();
        let started = Instant::now();
        let raw = tokio::time::timeout_at(
            deadline,
            self.pool.write(request, WriteOptions { monitoring: true }),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;
        let latency = started.elapsed();

        let reply = self.codec.parse_probe_reply(&raw)?;
        trace!(address = %self.address, latency_ms = latency.as_millis() as u64, "probe reply");
        Ok((reply, latency))
    }

    /// Runs one application operation against this member.
    pub async fn execute(&self, op: &Operation) -> Result<Bytes, TransportError> {
        self.ensure_connected().await?;
        let request = self.codec.encode_operation(op);
        trace!(address = %self.address, kind = %op.kind, ns = %op.ns, "dispatching operation");
        self.pool.write(request, WriteOptions::default()).await
    }

    pub(crate) fn codec(&self) -> &Arc<dyn WireCodec> {
        &self.codec
    }

    /// Closes the pool. Safe to call more than once.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(address = %self.address, generation = self.generation, "destroying member handle");
        self.pool.destroy().await;
        self.registry.member_closed();
    }
}
