//! Logical session pooling.
//!
//! Server sessions are cheap to create but the server keeps state for each
//! one, so released sessions are kept and handed out again while they still
//! have enough life left. A session is considered stale once it is within a
//! minute of the server-advertised idle timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Margin kept before the server's idle timeout.
const STALE_MARGIN: Duration = Duration::from_secs(60);

/// One logical session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSession {
    id: Uuid,
    last_use: Instant,
    txn_number: u64,
}

impl ServerSession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            last_use: Instant::now(),
            txn_number: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn last_use(&self) -> Instant {
        self.last_use
    }

    pub fn txn_number(&self) -> u64 {
        self.txn_number
    }

    /// Advances and returns the transaction number.
    pub fn next_txn_number(&mut self) -> u64 {
        self.txn_number += 1;
        self.txn_number
    }

    /// Marks the session as used now.
    pub fn touch(&mut self) {
        self.last_use = Instant::now();
    }

    /// Returns true if the session is too close to `timeout` to reuse.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_use.elapsed() + STALE_MARGIN >= timeout
    }
}

/// Pool of released sessions, most recently used first.
#[derive(Debug, Default)]
pub struct SessionPool {
    sessions: Mutex<VecDeque<ServerSession>>,
    draining: AtomicBool,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a pooled session that is still fresh enough for `timeout`, or
    /// creates one. Stale sessions found on the way are dropped.
    pub fn acquire(&self, timeout: Duration) -> ServerSession {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(mut session) = sessions.pop_front() {
            if session.is_stale(timeout) {
                debug!(id = %session.id, "discarding stale session");
                continue;
            }
            session.touch();
            return session;
        }
        ServerSession::new()
    }

    /// Returns a session to the pool. Dropped instead if it is stale or the
    /// pool is draining.
    pub fn release(&self, session: ServerSession, timeout: Duration) {
        if self.is_draining() {
            return;
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        // the back of the queue is the oldest; trim what has expired there
        while sessions.back().is_some_and(|s| s.is_stale(timeout)) {
            sessions.pop_back();
        }
        if !session.is_stale(timeout) {
            sessions.push_front(session);
        }
    }

    /// Stops pooling and returns the ids of every pooled session so the
    /// caller can end them on the server.
    pub fn drain(&self) -> Vec<Uuid> {
        self.draining.store(true, Ordering::Release);
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.drain(..).map(|s| s.id).collect()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
