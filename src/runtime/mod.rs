//! Per-connection runtime.
//!
//! Every accepted socket becomes one connection unit:
//! - `Connection`: shared open/closed status, timeout flag, creation time
//! - `Pump`: the receive/decide/reply state machine, owns the socket
//! - `supervise`: the idle timer that reaps connections past the ceiling
//!
//! Pump and supervisor run as two independent tasks. The connection is
//! retired from the registry once its pump has finished.

mod connection;
mod pump;
mod supervisor;

pub use connection::{closed, CloseReason, Connection, ConnectionRegistry};
pub use pump::{PendingReply, Pump, PumpError, PumpState};
pub use supervisor::supervise;

use crate::protocol::Protocol;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::debug;

/// Per-connection tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Receive buffer capacity in bytes.
    pub buffer_size: usize,
    /// Maximum connection age before it is reaped.
    pub idle_timeout: Duration,
    /// Idle supervisor tick period.
    pub supervisor_tick: Duration,
    /// Pacing bound for a single receive wait.
    pub receive_wait: Duration,
    /// Pacing bound for a single send wait.
    pub send_wait: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            idle_timeout: Duration::from_secs(120),
            supervisor_tick: Duration::from_secs(1),
            receive_wait: Duration::from_millis(1000),
            send_wait: Duration::from_millis(1000),
        }
    }
}

/// Start the pump and supervisor for an accepted connection.
///
/// The returned handle resolves once the pump has retired and the
/// connection has been removed from `registry`.
pub fn spawn_connection<S>(
    stream: S,
    conn: Arc<Connection>,
    protocol: Arc<Protocol>,
    settings: ConnectionSettings,
    registry: Arc<ConnectionRegistry>,
) -> JoinHandle<CloseReason>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(supervise(
        Arc::clone(&conn),
        settings.idle_timeout,
        settings.supervisor_tick,
    ));

    tokio::spawn(async move {
        let reason = Pump::new(stream, Arc::clone(&conn), protocol, settings)
            .run()
            .await;
        registry.remove(conn.id);
        debug!(conn = conn.id, peer = %conn.peer, %reason, "Connection retired");
        reason
    })
}
