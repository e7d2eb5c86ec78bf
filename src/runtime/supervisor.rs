//! Idle timeout supervisor.
//!
//! One periodic timer per connection. On every tick the connection's age
//! is compared against the idle ceiling; once exceeded the supervisor sets
//! the timeout flag, closes the connection and retires. It also retires as
//! soon as it sees the connection closed by any other path.

use super::connection::{closed, CloseReason, Connection};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Supervise `conn` until it closes. Returns `true` if the supervisor
/// closed it.
pub async fn supervise(conn: Arc<Connection>, idle_timeout: Duration, tick: Duration) -> bool {
    let mut close_rx = conn.subscribe();
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if conn.is_closed() {
                    break;
                }
                if conn.age() > idle_timeout {
                    conn.mark_timed_out();
                    let won = conn.close(CloseReason::Timeout);
                    if won {
                        info!(
                            conn = conn.id,
                            peer = %conn.peer,
                            age_secs = conn.age().as_secs(),
                            "Idle connection reaped"
                        );
                    }
                    return won;
                }
            }
            reason = closed(&mut close_rx) => {
                debug!(conn = conn.id, %reason, "Supervisor retired");
                break;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelSink, NotificationKind};
    use std::net::SocketAddr;

    use crate::notify::Notification;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn conn() -> (Arc<Connection>, UnboundedReceiver<Notification>) {
        let (sink, rx) = ChannelSink::new();
        let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        (Arc::new(Connection::new(3, peer, Arc::new(sink))), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaps_after_ceiling() {
        let (conn, mut rx) = conn();
        let task = tokio::spawn(supervise(
            Arc::clone(&conn),
            Duration::from_secs(120),
            Duration::from_secs(1),
        ));

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert!(!conn.is_closed());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(conn.is_closed());
        assert!(conn.is_timed_out());
        assert_eq!(conn.close_reason(), Some(CloseReason::Timeout));
        assert!(task.await.unwrap());

        let n = rx.try_recv().unwrap();
        assert_eq!(n.kind, NotificationKind::Connection);
        assert!(n.text.contains("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retires_when_closed_elsewhere() {
        let (conn, _rx) = conn();
        let task = tokio::spawn(supervise(
            Arc::clone(&conn),
            Duration::from_secs(120),
            Duration::from_secs(1),
        ));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(conn.close(CloseReason::Completed));

        assert!(!task.await.unwrap());
        assert!(!conn.is_timed_out());
        assert_eq!(conn.close_reason(), Some(CloseReason::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_close_is_noop() {
        let (conn, mut rx) = conn();
        conn.close(CloseReason::Error);
        let _ = rx.try_recv();

        let won = supervise(Arc::clone(&conn), Duration::ZERO, Duration::from_millis(10)).await;
        assert!(!won);
        assert_eq!(conn.close_reason(), Some(CloseReason::Error));
        assert!(rx.try_recv().is_err());
    }
}
