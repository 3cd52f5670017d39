//! An in-process replica set for driving a topology end to end.
//!
//! Every member is a scripted node: its probe reply, latency and
//! reachability can be changed at any point and the next heartbeat sees
//! the change. Probe replies travel as bincode; application operations are
//! answered with a [`WireReply`] naming the member that served them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quorum_topology::{
    CodecError, ConnectionPool, ElectionId, HelloReply, OpKind, Operation, PoolFactory,
    ServerAddress, Topology, TopologyEvent, TopologyOptions, TransportError, WireCodec,
    WriteOptions,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const SET: &str = "rs0";

pub fn addr(name: &str) -> ServerAddress {
    ServerAddress::new(name, 27017)
}

fn hosts(names: &[&str]) -> Vec<ServerAddress> {
    names.iter().map(|n| addr(n)).collect()
}

pub fn primary(set_version: u64, election: u64, members: &[&str]) -> HelloReply {
    HelloReply {
        is_writable_primary: true,
        set_name: Some(SET.into()),
        set_version: Some(set_version),
        election_id: Some(ElectionId::from_counter(election)),
        hosts: hosts(members),
        max_wire_version: 17,
        logical_session_timeout_minutes: Some(30),
        ..HelloReply::default()
    }
}

pub fn secondary(members: &[&str]) -> HelloReply {
    HelloReply {
        secondary: true,
        set_name: Some(SET.into()),
        hosts: hosts(members),
        max_wire_version: 17,
        logical_session_timeout_minutes: Some(30),
        ..HelloReply::default()
    }
}

pub fn with_tags(mut reply: HelloReply, tags: &[(&str, &str)]) -> HelloReply {
    reply.tags = tags
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    reply
}

/// Operation as it travels to a simulated node.
#[derive(Debug, Serialize, Deserialize)]
struct WireOp {
    kind: String,
    cursor_id: i64,
}

/// Reply from a simulated node to an application operation.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireReply {
    pub served_by: String,
    pub kind: String,
    pub cursor_id: i64,
}

pub fn decode_reply(bytes: &[u8]) -> WireReply {
    bincode::deserialize(bytes).unwrap()
}

/// Codec shared by the simulated set and the topology.
pub struct TestCodec;

impl WireCodec for TestCodec {
    fn probe_request(&self) -> Bytes {
        Bytes::from_static(b"hello")
    }

    fn parse_probe_reply(&self, reply: &[u8]) -> Result<HelloReply, CodecError> {
        bincode::deserialize(reply).map_err(|e| CodecError(e.to_string()))
    }

    fn encode_operation(&self, op: &Operation) -> Bytes {
        let cursor_id = match op.kind {
            OpKind::GetMore { cursor_id } => cursor_id,
            _ => 0,
        };
        let wire = WireOp {
            kind: op.kind.to_string(),
            cursor_id,
        };
        Bytes::from(bincode::serialize(&wire).unwrap())
    }

    fn cursor_id(&self, reply: &[u8]) -> Result<i64, CodecError> {
        bincode::deserialize::<WireReply>(reply)
            .map(|r| r.cursor_id)
            .map_err(|e| CodecError(e.to_string()))
    }
}

struct Node {
    /// `None` while the node is down.
    reply: Option<HelloReply>,
    latency: Duration,
    /// Batches a query on this node returns.
    cursor_batches: u32,
}

/// Scripted nodes, keyed by address.
#[derive(Default)]
pub struct SimulatedSet {
    nodes: Mutex<HashMap<ServerAddress, Node>>,
    ops: Mutex<Vec<(ServerAddress, String)>>,
}

impl SimulatedSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, name: &str, reply: HelloReply) {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.entry(addr(name)).or_insert(Node {
            reply: None,
            latency: Duration::ZERO,
            cursor_batches: 1,
        });
        node.reply = Some(reply);
    }

    pub fn down(&self, name: &str) {
        if let Some(node) = self.nodes.lock().unwrap().get_mut(&addr(name)) {
            node.reply = None;
        }
    }

    pub fn set_latency(&self, name: &str, latency: Duration) {
        if let Some(node) = self.nodes.lock().unwrap().get_mut(&addr(name)) {
            node.latency = latency;
        }
    }

    pub fn set_cursor_batches(&self, name: &str, batches: u32) {
        if let Some(node) = self.nodes.lock().unwrap().get_mut(&addr(name)) {
            node.cursor_batches = batches;
        }
    }

    /// Application operations served so far, as `(member, kind)`.
    pub fn ops(&self) -> Vec<(ServerAddress, String)> {
        self.ops.lock().unwrap().clone()
    }

    fn script(&self, address: &ServerAddress) -> (Option<HelloReply>, Duration, u32) {
        let nodes = self.nodes.lock().unwrap();
        match nodes.get(address) {
            Some(node) => (node.reply.clone(), node.latency, node.cursor_batches),
            None => (None, Duration::ZERO, 0),
        }
    }
}

/// Hands out pools backed by a [`SimulatedSet`].
pub struct SimFactory {
    set: Arc<SimulatedSet>,
}

impl PoolFactory for SimFactory {
    fn create(&self, address: &ServerAddress) -> Arc<dyn ConnectionPool> {
        Arc::new(SimPool {
            address: address.clone(),
            set: self.set.clone(),
            connected: AtomicBool::new(false),
            remaining: AtomicU32::new(0),
        })
    }
}

/// Connection pool to one simulated node.
struct SimPool {
    address: ServerAddress,
    set: Arc<SimulatedSet>,
    connected: AtomicBool,
    /// Batches left on the open cursor.
    remaining: AtomicU32,
}

#[async_trait]
impl ConnectionPool for SimPool {
    async fn connect(&self) -> Result<(), TransportError> {
        let (reply, _, _) = self.set.script(&self.address);
        if reply.is_none() {
            return Err(TransportError::ConnectFailed {
                address: self.address.clone(),
                reason: "connection refused".into(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, request: Bytes, options: WriteOptions) -> Result<Bytes, TransportError> {
        let (_, latency, _) = self.set.script(&self.address);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        // reachability is checked after the round trip
        let (reply, _, batches) = self.set.script(&self.address);
        let Some(reply) = reply else {
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::Io("connection reset by peer".into()));
        };

        if options.monitoring {
            return Ok(Bytes::from(bincode::serialize(&reply).unwrap()));
        }

        let op: WireOp = bincode::deserialize(&request).map_err(|e| CodecError(e.to_string()))?;
        self.set
            .ops
            .lock()
            .unwrap()
            .push((self.address.clone(), op.kind.clone()));

        let cursor_id = match op.kind.as_str() {
            "query" => {
                let left = batches.saturating_sub(1);
                self.remaining.store(left, Ordering::SeqCst);
                if left > 0 { 42 } else { 0 }
            }
            "getMore" => {
                let left = self.remaining.load(Ordering::SeqCst).saturating_sub(1);
                self.remaining.store(left, Ordering::SeqCst);
                if left > 0 { op.cursor_id } else { 0 }
            }
            _ => 0,
        };
        let wire = WireReply {
            served_by: self.address.to_string(),
            kind: op.kind,
            cursor_id,
        };
        Ok(Bytes::from(bincode::serialize(&wire).unwrap()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn destroy(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

pub fn options(seeds: &[&str]) -> TopologyOptions {
    let mut options = TopologyOptions::new(SET, seeds.iter().map(|s| format!("{s}:27017")));
    // roomy enough that a test reading events never lags
    options.event_capacity = 4096;
    options
}

pub fn factory(set: &Arc<SimulatedSet>) -> Arc<SimFactory> {
    Arc::new(SimFactory { set: set.clone() })
}

/// Builds a topology against `set`.
pub fn topology(set: &Arc<SimulatedSet>, options: TopologyOptions) -> Topology {
    Topology::builder(options, factory(set), Arc::new(TestCodec))
        .build()
        .unwrap()
}

/// Polls `check` every 100ms of (virtual) time until it holds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..1200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Receives events until one matches `pred`.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<TopologyEvent>,
    what: &str,
    pred: impl Fn(&TopologyEvent) -> bool,
) -> TopologyEvent {
    let deadline = Duration::from_secs(120);
    tokio::time::timeout(deadline, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}
