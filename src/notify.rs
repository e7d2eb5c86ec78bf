//! Notification sink for server observers.
//!
//! The server never reads back what it reports. Everything it wants an
//! observer to see goes through one of three write-only streams:
//! - connection lifecycle text (listening, accepted, chunk received, closed)
//! - exception text (any caught failure, stringified)
//! - finished-exchange transcripts (peer address + full accumulated message)
//!
//! Sinks are shared by every connection task, so implementations must
//! tolerate concurrent calls from many connections at once.

use chrono::{DateTime, Local};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Write-only destination for server notifications.
pub trait NotificationSink: Send + Sync {
    /// Connection lifecycle text.
    fn connection_event(&self, text: &str);

    /// A caught failure, stringified.
    fn exception(&self, text: &str);

    /// A finished exchange: the peer and everything it sent.
    fn transcript(&self, peer: SocketAddr, message: &str);
}

/// Sink that writes every stream to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn connection_event(&self, text: &str) {
        info!(target: "eofd::connstat", "{text}");
    }

    fn exception(&self, text: &str) {
        warn!(target: "eofd::exclog", "{text}");
    }

    fn transcript(&self, peer: SocketAddr, message: &str) {
        info!(target: "eofd::recvlog", peer = %peer, "{peer}->{message}");
    }
}

/// Which stream a notification was emitted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    Connection,
    Exception,
    Transcript { peer: SocketAddr },
}

/// A single timestamped notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub at: DateTime<Local>,
    pub kind: NotificationKind,
    pub text: String,
}

impl Notification {
    fn now(kind: NotificationKind, text: impl Into<String>) -> Self {
        Self {
            at: Local::now(),
            kind,
            text: text.into(),
        }
    }

    /// Render as a single display line.
    ///
    /// Lifecycle and exception lines carry a `HH:MM:SS->` prefix,
    /// transcripts are rendered as `peer->message`.
    pub fn render(&self) -> String {
        match &self.kind {
            NotificationKind::Transcript { peer } => format!("{peer}->{}", self.text),
            _ => format!("{}->{}", self.at.format("%H:%M:%S"), self.text),
        }
    }
}

/// Sink that forwards notifications into an unbounded channel.
///
/// Lets a front end (or a test) consume the three streams as values.
/// Sending on a closed channel is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    /// Create a sink along with the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

impl NotificationSink for ChannelSink {
    fn connection_event(&self, text: &str) {
        self.send(Notification::now(NotificationKind::Connection, text));
    }

    fn exception(&self, text: &str) {
        self.send(Notification::now(NotificationKind::Exception, text));
    }

    fn transcript(&self, peer: SocketAddr, message: &str) {
        self.send(Notification::now(
            NotificationKind::Transcript { peer },
            message,
        ));
    }
}
