//! Seams to the collaborators that move bytes.
//!
//! The topology never encodes a message or opens a socket itself. A
//! [`PoolFactory`] hands out one [`ConnectionPool`] per member, a
//! [`WireCodec`] builds and parses messages, and an optional
//! [`DisconnectBuffer`] holds operations while no member can take them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::address::ServerAddress;
use crate::error::{CodecError, TopologyError, TransportError};
use crate::reply::HelloReply;
use crate::selector::ReadPreference;

/// Per-write flags passed to the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Heartbeat traffic. Pools must not queue it behind application
    /// operations or apply backpressure to it.
    pub monitoring: bool,
}

/// Connections to a single member.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Sends one request and waits for its reply.
    async fn write(&self, request: Bytes, options: WriteOptions) -> Result<Bytes, TransportError>;

    fn is_connected(&self) -> bool;

    async fn destroy(&self);
}

/// Creates pools for newly discovered members.
pub trait PoolFactory: Send + Sync {
    fn create(&self, address: &ServerAddress) -> Arc<dyn ConnectionPool>;
}

/// Message encoding, owned by the wire layer.
pub trait WireCodec: Send + Sync {
    /// The role-probe request sent on every heartbeat.
    fn probe_request(&self) -> Bytes;

    fn parse_probe_reply(&self, reply: &[u8]) -> Result<HelloReply, CodecError>;

    fn encode_operation(&self, op: &Operation) -> Bytes;

    /// Cursor id carried by a query or get-more reply. Zero means the
    /// cursor is exhausted.
    fn cursor_id(&self, reply: &[u8]) -> Result<i64, CodecError>;
}

/// The kinds of operation the topology dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Command,
    Insert,
    Update,
    Remove,
    Query,
    GetMore { cursor_id: i64 },
}

impl OpKind {
    /// Writes can only go to the primary.
    pub fn is_write(self) -> bool {
        matches!(self, OpKind::Insert | OpKind::Update | OpKind::Remove)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Command => f.write_str("command"),
            OpKind::Insert => f.write_str("insert"),
            OpKind::Update => f.write_str("update"),
            OpKind::Remove => f.write_str("remove"),
            OpKind::Query => f.write_str("query"),
            OpKind::GetMore { .. } => f.write_str("getMore"),
        }
    }
}

/// An application operation. Payloads are already-encoded documents.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OpKind,
    /// Namespace, `db.collection` or `db.$cmd`.
    pub ns: String,
    pub payload: Vec<Bytes>,
}

impl Operation {
    pub fn new(kind: OpKind, ns: impl Into<String>, payload: Vec<Bytes>) -> Self {
        Self {
            kind,
            ns: ns.into(),
            payload,
        }
    }
}

/// Caller options for one operation.
#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    /// Ignored for writes, which always go to the primary.
    pub read_preference: ReadPreference,
    /// How long the caller is willing to wait, including time spent in the
    /// disconnect buffer.
    pub timeout: Option<Duration>,
}

impl OperationOptions {
    pub fn with_read_preference(read_preference: ReadPreference) -> Self {
        Self {
            read_preference,
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// An operation parked until a member becomes selectable.
#[derive(Debug)]
pub struct BufferedOperation {
    pub operation: Operation,
    pub read_preference: ReadPreference,
    pub reply: oneshot::Sender<Result<Bytes, TopologyError>>,
}

impl BufferedOperation {
    /// Returns true if the caller stopped waiting.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// Holds operations while no member satisfies their read preference.
pub trait DisconnectBuffer: Send + Sync {
    /// Parks an operation. Returns it back if the buffer can't take it.
    fn add(&self, op: BufferedOperation) -> Result<(), BufferedOperation>;

    /// Takes every parked operation so the topology can retry them.
    fn drain(&self) -> Vec<BufferedOperation>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded FIFO [`DisconnectBuffer`].
#[derive(Debug)]
pub struct OperationBuffer {
    ops: Mutex<VecDeque<BufferedOperation>>,
    capacity: usize,
}

impl OperationBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Mutex::new(VecDeque::new()),
            capacity,
        }
    }
}

impl DisconnectBuffer for OperationBuffer {
    fn add(&self, op: BufferedOperation) -> Result<(), BufferedOperation> {
        let mut ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        if ops.len() >= self.capacity {
            return Err(op);
        }
        ops.push_back(op);
        Ok(())
    }

    fn drain(&self) -> Vec<BufferedOperation> {
        let mut ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        ops.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
