//! Receive/send pump: drives one connection through its exchange.
//!
//! ```text
//! AwaitingData -> Processing -> Replying -> AwaitingData
//!                      |            |
//!                      +------------+-----> Closed
//! ```
//!
//! Every suspension (receive, send) is bounded by a pacing wait. An
//! elapsed pacing wait is not a cancellation: the pump re-checks the close
//! signal and waits again. tokio's `read` and `write` are cancel-safe, so
//! nothing is lost or duplicated when a wait elapses.
//!
//! Before touching the socket after any completion the pump checks whether
//! the connection was closed elsewhere (idle supervisor, shutdown) and, if
//! so, stops without further I/O.

use super::connection::{closed, CloseReason, Connection};
use super::ConnectionSettings;
use crate::protocol::{decode, encode, Decision, Protocol};
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Pump state.
#[derive(Debug)]
pub enum PumpState {
    /// Waiting for the next receive to complete.
    AwaitingData,
    /// Bytes `..n` of the receive buffer hold a fresh chunk.
    Processing(usize),
    /// Sending a reply.
    Replying(PendingReply),
    /// Terminal.
    Closed(CloseReason),
}

/// A reply in flight.
#[derive(Debug)]
pub struct PendingReply {
    text: String,
    payload: Bytes,
    written: usize,
    /// Close the connection once the whole payload is out.
    close_after: bool,
}

impl PendingReply {
    pub fn new(text: String, close_after: bool) -> Self {
        let payload = encode(&text);
        Self {
            text,
            payload,
            written: 0,
            close_after,
        }
    }

    fn remaining(&self) -> &[u8] {
        &self.payload[self.written..]
    }

    fn advance(&mut self, n: usize) {
        self.written = (self.written + n).min(self.payload.len());
    }

    fn is_done(&self) -> bool {
        self.written >= self.payload.len()
    }
}

/// Errors that end a connection from inside the pump.
#[derive(Debug)]
pub enum PumpError {
    Receive(io::Error),
    Send(io::Error),
    /// The reply function panicked.
    Exchange(String),
}

impl fmt::Display for PumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpError::Receive(e) => write!(f, "receive failed: {e}"),
            PumpError::Send(e) => write!(f, "send failed: {e}"),
            PumpError::Exchange(msg) => write!(f, "reply function failed: {msg}"),
        }
    }
}

impl std::error::Error for PumpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PumpError::Receive(e) | PumpError::Send(e) => Some(e),
            PumpError::Exchange(_) => None,
        }
    }
}

/// Per-connection pump.
pub struct Pump<S> {
    stream: S,
    conn: Arc<Connection>,
    protocol: Arc<Protocol>,
    settings: ConnectionSettings,
    close_rx: watch::Receiver<Option<CloseReason>>,
    recv_buf: Vec<u8>,
    accumulated: String,
    /// Peer half-closed; nothing more will arrive.
    peer_done: bool,
}

impl<S> Pump<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        conn: Arc<Connection>,
        protocol: Arc<Protocol>,
        settings: ConnectionSettings,
    ) -> Self {
        let close_rx = conn.subscribe();
        Self {
            stream,
            recv_buf: vec![0u8; settings.buffer_size],
            conn,
            protocol,
            settings,
            close_rx,
            accumulated: String::new(),
            peer_done: false,
        }
    }

    /// Run until the connection closes. Returns the winning close reason.
    pub async fn run(mut self) -> CloseReason {
        let mut state = PumpState::AwaitingData;
        loop {
            trace!(conn = self.conn.id, ?state, "Pump step");
            state = match state {
                PumpState::AwaitingData => self.receive().await,
                PumpState::Processing(n) => self.process(n),
                PumpState::Replying(reply) => self.send(reply).await,
                PumpState::Closed(reason) => return reason,
            };
        }
    }

    async fn receive(&mut self) -> PumpState {
        loop {
            if let Some(state) = self.interrupted() {
                return state;
            }

            if self.peer_done {
                // A zero-byte receive is not a transition. Park until some
                // other path closes the connection.
                closed(&mut self.close_rx).await;
                continue;
            }

            tokio::select! {
                biased;
                _ = closed(&mut self.close_rx) => continue,
                res = timeout(self.settings.receive_wait, self.stream.read(&mut self.recv_buf)) => {
                    match res {
                        Err(_) => trace!(conn = self.conn.id, "Receive still pending"),
                        Ok(Ok(0)) => {
                            debug!(conn = self.conn.id, peer = %self.conn.peer, "Peer stopped sending");
                            self.peer_done = true;
                        }
                        Ok(Ok(n)) => return PumpState::Processing(n),
                        Ok(Err(e)) => return self.fail(PumpError::Receive(e)),
                    }
                }
            }
        }
    }

    fn process(&mut self, n: usize) -> PumpState {
        if let Some(state) = self.interrupted() {
            return state;
        }

        let peer = self.conn.peer;
        let chunk = decode(&self.recv_buf[..n]);
        self.accumulated.push_str(&chunk);
        self.conn
            .sink()
            .connection_event(&format!("{peer} -> {chunk}"));

        let protocol = &self.protocol;
        let accumulated = &self.accumulated;
        let decided = catch_unwind(AssertUnwindSafe(|| protocol.decide(&chunk, accumulated)));
        let decision = match decided {
            Ok(decision) => decision,
            Err(panic) => return self.fail(PumpError::Exchange(panic_message(&*panic))),
        };

        let Decision { reply, complete } = decision;
        if complete {
            debug!(
                conn = self.conn.id,
                peer = %peer,
                bytes = self.accumulated.len(),
                "Exchange complete"
            );
            self.conn.sink().transcript(peer, &self.accumulated);
        }

        match reply {
            Some(text) => PumpState::Replying(PendingReply::new(text, complete)),
            None if complete => self.finish(),
            None => PumpState::AwaitingData,
        }
    }

    async fn send(&mut self, mut reply: PendingReply) -> PumpState {
        loop {
            if let Some(state) = self.interrupted() {
                return state;
            }
            if reply.is_done() {
                break;
            }

            tokio::select! {
                biased;
                _ = closed(&mut self.close_rx) => continue,
                res = timeout(self.settings.send_wait, self.stream.write(reply.remaining())) => {
                    match res {
                        Err(_) => trace!(conn = self.conn.id, "Send still pending"),
                        Ok(Ok(0)) => {
                            return self.fail(PumpError::Send(io::ErrorKind::WriteZero.into()))
                        }
                        Ok(Ok(n)) => reply.advance(n),
                        Ok(Err(e)) => return self.fail(PumpError::Send(e)),
                    }
                }
            }
        }

        if let Err(e) = self.stream.flush().await {
            return self.fail(PumpError::Send(e));
        }

        self.conn
            .sink()
            .connection_event(&format!("{} -< {}", self.conn.peer, reply.text));

        if reply.close_after {
            self.finish()
        } else {
            PumpState::AwaitingData
        }
    }

    /// Close after a completed exchange.
    fn finish(&self) -> PumpState {
        self.conn.close(CloseReason::Completed);
        PumpState::Closed(self.conn.close_reason().unwrap_or(CloseReason::Completed))
    }

    /// Close after a failure. The failure is only reported when this
    /// close wins; errors on a connection already closed elsewhere are
    /// swallowed.
    fn fail(&self, err: PumpError) -> PumpState {
        if let Some(state) = self.interrupted() {
            debug!(conn = self.conn.id, error = %err, "Error after close ignored");
            return state;
        }

        warn!(conn = self.conn.id, peer = %self.conn.peer, error = %err, "Connection failed");
        if self.conn.close(CloseReason::Error) {
            self.conn
                .sink()
                .exception(&format!("{}: {err}", self.conn.peer));
        }
        PumpState::Closed(self.conn.close_reason().unwrap_or(CloseReason::Error))
    }

    /// Closed state if the connection was closed (or timed out) elsewhere.
    fn interrupted(&self) -> Option<PumpState> {
        if self.conn.is_timed_out() {
            self.conn.close(CloseReason::Timeout);
        }
        let reason = self.conn.close_reason()?;
        if reason == CloseReason::Timeout {
            self.conn
                .sink()
                .connection_event(&format!("{} Connection timeout.", self.conn.peer));
        }
        Some(PumpState::Closed(reason))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
