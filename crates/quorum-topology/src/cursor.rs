//! Lazily-started cursors.

use std::sync::Arc;

use bytes::Bytes;

use crate::address::ServerAddress;
use crate::controller::Topology;
use crate::error::{TopologyError, TransportError};
use crate::member::MemberHandle;
use crate::transport::{OpKind, Operation, OperationOptions};

/// A query whose results are fetched in batches from a single member.
///
/// The member is chosen on the first [`next_batch`](Cursor::next_batch)
/// and every later batch is fetched from that same member. Cursors never
/// wait in the disconnect buffer.
#[derive(Debug)]
pub struct Cursor {
    topology: Topology,
    ns: String,
    command: Bytes,
    options: OperationOptions,
    member: Option<Arc<MemberHandle>>,
    cursor_id: Option<i64>,
}

impl Cursor {
    pub(crate) fn new(topology: Topology, ns: String, command: Bytes, options: OperationOptions) -> Self {
        Self {
            topology,
            ns,
            command,
            options,
            member: None,
            cursor_id: None,
        }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// Server-side cursor id, once the first batch has arrived.
    pub fn id(&self) -> Option<i64> {
        self.cursor_id
    }

    /// The member this cursor is pinned to.
    pub fn member(&self) -> Option<&ServerAddress> {
        self.member.as_ref().map(|m| m.address())
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor_id == Some(0)
    }

    /// Fetches the next batch. Returns `None` once the server has reported
    /// the cursor exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Bytes>, TopologyError> {
        if self.is_exhausted() {
            return Ok(None);
        }
        if self.topology.is_destroyed() {
            return Err(TopologyError::Destroyed);
        }

        let (handle, op) = match (&self.member, self.cursor_id) {
            (Some(handle), Some(cursor_id)) => (
                handle.clone(),
                Operation::new(OpKind::GetMore { cursor_id }, self.ns.clone(), Vec::new()),
            ),
            _ => {
                let handle = match self
                    .topology
                    .inner
                    .select_handle(&self.options.read_preference)
                {
                    Ok(handle) => handle,
                    Err(err) => {
                        self.topology.request_check();
                        return Err(err.into());
                    }
                };
                let op = Operation::new(OpKind::Query, self.ns.clone(), vec![self.command.clone()]);
                (handle, op)
            }
        };

        let reply = match self.options.timeout {
            Some(limit) => tokio::time::timeout(limit, handle.execute(&op))
                .await
                .map_err(|_| TopologyError::Timeout(limit))??,
            None => handle.execute(&op).await?,
        };
        let cursor_id = handle
            .codec()
            .cursor_id(&reply)
            .map_err(TransportError::from)?;

        self.member = Some(handle);
        self.cursor_id = Some(cursor_id);
        Ok(Some(reply))
    }
}
