//! Connection state shared between a connection's pump and supervisor.
//!
//! The socket itself is owned by the pump. What the two tasks share is
//! the connection's open/closed status: whichever path claims the close
//! first wins and every later attempt is a silent no-op.

use crate::notify::NotificationSink;
use chrono::{DateTime, Local};
use slab::Slab;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent the sentinel and the final reply went out.
    Completed,
    /// The idle supervisor reaped the connection.
    Timeout,
    /// Receive or send failed.
    Error,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Completed => "completed",
            CloseReason::Timeout => "timeout",
            CloseReason::Error => "error",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Shared per-connection record.
pub struct Connection {
    /// Slot in the connection registry.
    pub id: usize,
    pub peer: SocketAddr,
    /// Wall-clock time of accept, for display.
    pub accepted_at: DateTime<Local>,
    created: Instant,
    timed_out: AtomicBool,
    closed: AtomicBool,
    close_tx: watch::Sender<Option<CloseReason>>,
    sink: Arc<dyn NotificationSink>,
}

impl Connection {
    pub fn new(id: usize, peer: SocketAddr, sink: Arc<dyn NotificationSink>) -> Self {
        let (close_tx, _) = watch::channel(None);
        Self {
            id,
            peer,
            accepted_at: Local::now(),
            created: Instant::now(),
            timed_out: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_tx,
            sink,
        }
    }

    /// Time since accept.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Set the timeout flag. Returns `false` if it was already set.
    pub fn mark_timed_out(&self) -> bool {
        !self.timed_out.swap(true, Ordering::AcqRel)
    }

    /// Claim the close.
    ///
    /// Returns `true` for the single caller that actually closes the
    /// connection; that caller's reason is what observers see. Every
    /// other call returns `false` and has no side effects.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.close_tx.send_replace(Some(reason));
        debug!(conn = self.id, peer = %self.peer, %reason, "Connection closed");
        self.sink
            .connection_event(&format!("{} ConnectionClose ({reason}).", self.peer));
        true
    }

    /// Reason the connection was closed, if it has been.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_tx.borrow()
    }

    /// Watch for the close signal.
    pub fn subscribe(&self) -> watch::Receiver<Option<CloseReason>> {
        self.close_tx.subscribe()
    }

    pub fn sink(&self) -> &Arc<dyn NotificationSink> {
        &self.sink
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("timed_out", &self.is_timed_out())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Wait until `rx` reports the connection closed, returning the reason.
pub async fn closed(rx: &mut watch::Receiver<Option<CloseReason>>) -> CloseReason {
    match rx.wait_for(Option::is_some).await {
        Ok(reason) => (*reason).unwrap_or(CloseReason::Error),
        // Sender dropped with the connection record: nothing left to watch.
        Err(_) => CloseReason::Error,
    }
}

/// Registry of live connections using slab allocation.
///
/// Provides O(1) insert and remove and bounds the number of live
/// connections.
pub struct ConnectionRegistry {
    connections: Mutex<Slab<Arc<Connection>>>,
    max_connections: usize,
    empty_tx: watch::Sender<usize>,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        let (empty_tx, _) = watch::channel(0);
        Self {
            connections: Mutex::new(Slab::with_capacity(max_connections.min(1024))),
            max_connections,
            empty_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Arc<Connection>>> {
        // A panic while holding the lock cannot leave the slab inconsistent.
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new connection for `peer`.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn register(
        &self,
        peer: SocketAddr,
        sink: Arc<dyn NotificationSink>,
    ) -> Option<Arc<Connection>> {
        let mut connections = self.lock();
        if connections.len() >= self.max_connections {
            return None;
        }
        let entry = connections.vacant_entry();
        let conn = Arc::new(Connection::new(entry.key(), peer, sink));
        entry.insert(Arc::clone(&conn));
        self.empty_tx.send_replace(connections.len());
        Some(conn)
    }

    /// Remove a retired connection.
    pub fn remove(&self, id: usize) -> Option<Arc<Connection>> {
        let mut connections = self.lock();
        let removed = connections.try_remove(id);
        self.empty_tx.send_replace(connections.len());
        removed
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Snapshot of the live connections.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().iter().map(|(_, c)| Arc::clone(c)).collect()
    }

    /// Close every live connection. Returns how many closes this call won.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.snapshot()
            .iter()
            .filter(|conn| conn.close(reason))
            .count()
    }

    /// Wait until no connections remain registered.
    pub async fn drained(&self) {
        let mut rx = self.empty_tx.subscribe();
        let _ = rx.wait_for(|len| *len == 0).await;
    }
}
