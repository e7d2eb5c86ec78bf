//! TCP server for sentinel-delimited exchanges.
//!
//! Binds the listening socket, runs the accept loop in the background and
//! hands every accepted socket to its own pump and idle supervisor.

use crate::notify::NotificationSink;
use crate::protocol::Protocol;
use crate::runtime::{spawn_connection, CloseReason, ConnectionRegistry, ConnectionSettings};
use std::fmt;
use std::io;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed accept before accepting again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Listener and lifecycle tunables.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Listen backlog.
    pub backlog: u32,
    /// Maximum number of live connections.
    pub max_connections: usize,
    /// Pacing bound for a single accept wait.
    pub accept_wait: Duration,
    /// How long shutdown waits for live connections before force-closing.
    pub shutdown_grace: Duration,
    pub connection: ConnectionSettings,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            backlog: 100,
            max_connections: 10_000,
            accept_wait: Duration::from_millis(1000),
            shutdown_grace: Duration::from_secs(5),
            connection: ConnectionSettings::default(),
        }
    }
}

/// Server startup errors
#[derive(Debug)]
pub enum ServerError {
    InvalidAddress(String, AddrParseError),
    InvalidPort(u16),
    Bind(SocketAddr, io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::InvalidAddress(host, e) => {
                write!(f, "Invalid bind address '{host}': {e}")
            }
            ServerError::InvalidPort(port) => write!(f, "Invalid bind port {port}"),
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {addr}: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::InvalidAddress(_, e) => Some(e),
            ServerError::InvalidPort(_) => None,
            ServerError::Bind(_, e) => Some(e),
        }
    }
}

/// Server instance
pub struct Server {
    host: String,
    port: u16,
    options: ServerOptions,
    protocol: Arc<Protocol>,
    sink: Arc<dyn NotificationSink>,
}

impl Server {
    /// Create a new server instance
    pub fn new(
        host: impl Into<String>,
        port: u16,
        protocol: Protocol,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Server {
            host: host.into(),
            port,
            options: ServerOptions::default(),
            protocol: Arc::new(protocol),
            sink,
        }
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Bind the listener and start accepting in the background.
    ///
    /// Must be called from within a tokio runtime. Returns as soon as the
    /// socket is listening. On failure a startup failure is reported on the
    /// exception stream and nothing is left running.
    pub fn start(self) -> Result<RunningServer, ServerError> {
        let (listener, local_addr) = match self.bind() {
            Ok(bound) => bound,
            Err(e) => {
                error!(error = %e, "Server failed to start");
                self.sink.exception(&format!("Startup failure: {e}"));
                return Err(e);
            }
        };

        info!(address = %local_addr, backlog = self.options.backlog, "Server listening");
        self.sink
            .connection_event(&format!("Start listen at {local_addr}."));

        let registry = Arc::new(ConnectionRegistry::new(self.options.max_connections));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let acceptor = Acceptor {
            registry: Arc::clone(&registry),
            protocol: self.protocol,
            sink: Arc::clone(&self.sink),
            options: self.options,
        };
        let accept_task = tokio::spawn(Arc::new(acceptor).run(listener, shutdown_rx));

        Ok(RunningServer {
            local_addr,
            shutdown_tx,
            accept_task,
            registry,
            sink: self.sink,
            shutdown_grace: self.options.shutdown_grace,
        })
    }

    fn bind(&self) -> Result<(TcpListener, SocketAddr), ServerError> {
        let ip: IpAddr = self
            .host
            .trim()
            .parse()
            .map_err(|e| ServerError::InvalidAddress(self.host.clone(), e))?;
        if self.port == 0 {
            return Err(ServerError::InvalidPort(self.port));
        }
        let addr = SocketAddr::new(ip, self.port);

        let listener = create_listener(addr, self.options.backlog)
            .and_then(TcpListener::from_std)
            .map_err(|e| ServerError::Bind(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(addr, e))?;
        Ok((listener, local_addr))
    }
}

fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

/// Handle to a listening server.
///
/// Dropping the handle stops the accept loop; connections already
/// accepted keep running to their own end. Use [`RunningServer::shutdown`]
/// to also retire live connections.
pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    registry: Arc<ConnectionRegistry>,
    sink: Arc<dyn NotificationSink>,
    shutdown_grace: Duration,
}

impl RunningServer {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop accepting, give live connections the grace period to finish,
    /// then force-close whatever is left.
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.accept_task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }
        info!(address = %self.local_addr, live = self.registry.len(), "Server stopped listening");
        self.sink
            .connection_event(&format!("Stop listen at {}.", self.local_addr));

        if timeout(self.shutdown_grace, self.registry.drained())
            .await
            .is_err()
        {
            let closed = self.registry.close_all(CloseReason::Shutdown);
            info!(closed, "Force-closed live connections");
            self.registry.drained().await;
        }
    }
}

/// Accept loop state.
struct Acceptor {
    registry: Arc<ConnectionRegistry>,
    protocol: Arc<Protocol>,
    sink: Arc<dyn NotificationSink>,
    options: ServerOptions,
}

impl Acceptor {
    async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown_rx) => break,
                res = timeout(self.options.accept_wait, listener.accept()) => {
                    match res {
                        Err(_) => trace!("Accept still pending"),
                        Ok(accepted) => self.on_accept(accepted).await,
                    }
                }
            }
        }
        debug!("Accept loop stopped");
    }

    /// Handle one accept completion. An accept error is reported and
    /// followed by a short backoff; it never ends the loop.
    async fn on_accept(self: &Arc<Self>, accepted: io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((stream, peer)) => {
                // `admit` never awaits, but it takes the registry lock and
                // calls into the sink. Run it on its own task so the next
                // accept is issued before any per-connection work.
                let acceptor = Arc::clone(self);
                tokio::spawn(async move { acceptor.admit(stream, peer) });
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                self.sink.exception(&format!("Accept failed: {e}"));
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        self.sink.connection_event("Incoming connection.");

        let Some(conn) = self.registry.register(peer, Arc::clone(&self.sink)) else {
            warn!(peer = %peer, limit = self.registry.capacity(), "Connection limit reached");
            self.sink.exception(&format!(
                "{peer} rejected: connection limit {} reached",
                self.registry.capacity()
            ));
            return;
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        debug!(conn = conn.id, peer = %peer, accepted_at = %conn.accepted_at, "New connection");
        spawn_connection(
            stream,
            conn,
            Arc::clone(&self.protocol),
            self.options.connection,
            Arc::clone(&self.registry),
        );
    }
}

/// Resolves once shutdown is requested or the handle is dropped.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelSink, Notification, NotificationKind};
    use crate::protocol::{ReplyPolicy, SentinelScope};
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn start(options: ServerOptions) -> (RunningServer, UnboundedReceiver<Notification>) {
        let (sink, rx) = ChannelSink::new();
        let server = Server::new(
            "127.0.0.1",
            free_port(),
            Protocol::new(ReplyPolicy::Fixed, SentinelScope::Chunk),
            Arc::new(sink),
        )
        .with_options(options);
        (server.start().unwrap(), rx)
    }

    async fn wait_for_note(
        rx: &mut UnboundedReceiver<Notification>,
        pred: impl Fn(&Notification) -> bool,
    ) -> Notification {
        timeout(Duration::from_secs(5), async {
            loop {
                let n = rx.recv().await.expect("sink closed");
                if pred(&n) {
                    return n;
                }
            }
        })
        .await
        .expect("notification not seen")
    }

    async fn read_reply(stream: &mut TcpStream) -> String {
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    async fn assert_closed_by_server(stream: &mut TcpStream) {
        let mut buf = [0u8; 16];
        let res = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("server did not close the connection");
        // Either an orderly FIN or a reset is a close.
        if let Ok(n) = res {
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn test_hello_world_exchange() {
        let (server, mut rx) = start(ServerOptions::default());
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        let peer = client.local_addr().unwrap();

        client.write_all(b"hello").await.unwrap();
        assert_eq!(read_reply(&mut client).await, "ack.");
        client.write_all(b"world<EOF>").await.unwrap();
        assert_eq!(read_reply(&mut client).await, "bye.");
        assert_closed_by_server(&mut client).await;

        let transcript =
            wait_for_note(&mut rx, |n| matches!(n.kind, NotificationKind::Transcript { .. })).await;
        assert_eq!(transcript.kind, NotificationKind::Transcript { peer });
        assert_eq!(transcript.text, "helloworld<EOF>");

        let close = wait_for_note(&mut rx, |n| n.text.contains("ConnectionClose")).await;
        assert!(close.text.contains("completed"));

        server.shutdown().await;
        let rest: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(!rest.iter().any(|n| n.text.contains("ConnectionClose")));
        assert!(!rest.iter().any(|n| n.kind == NotificationKind::Exception));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connections_keep_separate_buffers() {
        let (server, mut rx) = start(ServerOptions::default());
        let addr = server.local_addr();

        let clients: Vec<_> = (0..8)
            .map(|i| {
                tokio::spawn(async move {
                    let mut client = TcpStream::connect(addr).await.unwrap();
                    let peer = client.local_addr().unwrap();
                    client.write_all(format!("c{i}-a;").as_bytes()).await.unwrap();
                    assert_eq!(read_reply(&mut client).await, "ack.");
                    client.write_all(format!("c{i}-b<EOF>").as_bytes()).await.unwrap();
                    assert_eq!(read_reply(&mut client).await, "bye.");
                    (peer, format!("c{i}-a;c{i}-b<EOF>"))
                })
            })
            .collect();

        let mut expected = HashMap::new();
        for client in clients {
            let (peer, text) = client.await.unwrap();
            expected.insert(peer, text);
        }

        let mut seen = HashMap::new();
        while seen.len() < expected.len() {
            let n = wait_for_note(&mut rx, |n| matches!(n.kind, NotificationKind::Transcript { .. })).await;
            if let NotificationKind::Transcript { peer } = n.kind {
                assert!(seen.insert(peer, n.text).is_none());
            }
        }
        assert_eq!(seen, expected);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_connection_is_reaped() {
        let options = ServerOptions {
            connection: ConnectionSettings {
                idle_timeout: Duration::from_millis(300),
                supervisor_tick: Duration::from_millis(50),
                receive_wait: Duration::from_millis(100),
                ..ConnectionSettings::default()
            },
            ..ServerOptions::default()
        };
        let (server, mut rx) = start(options);
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        assert_closed_by_server(&mut client).await;
        wait_for_note(&mut rx, |n| n.text.ends_with("Connection timeout.")).await;
        timeout(Duration::from_secs(5), async {
            while server.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection was not retired");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_address_fails_startup() {
        let (sink, mut rx) = ChannelSink::new();
        let server = Server::new(
            "not-an-ip",
            9000,
            Protocol::new(ReplyPolicy::Fixed, SentinelScope::Chunk),
            Arc::new(sink),
        );

        match server.start() {
            Err(ServerError::InvalidAddress(host, _)) => assert_eq!(host, "not-an-ip"),
            Err(other) => panic!("unexpected: {other}"),
            Ok(_) => panic!("server started on an invalid address"),
        }
        let n = rx.try_recv().unwrap();
        assert_eq!(n.kind, NotificationKind::Exception);
        assert!(n.text.starts_with("Startup failure"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_port_zero_fails_startup() {
        let (sink, _rx) = ChannelSink::new();
        let server = Server::new(
            "127.0.0.1",
            0,
            Protocol::new(ReplyPolicy::Fixed, SentinelScope::Chunk),
            Arc::new(sink),
        );
        assert!(matches!(server.start(), Err(ServerError::InvalidPort(0))));
    }

    #[tokio::test]
    async fn test_bind_conflict_fails_startup() {
        let (first, _rx1) = start(ServerOptions::default());
        let port = first.local_addr().port();

        let (sink, mut rx) = ChannelSink::new();
        let second = Server::new(
            "127.0.0.1",
            port,
            Protocol::new(ReplyPolicy::Fixed, SentinelScope::Chunk),
            Arc::new(sink),
        );
        assert!(matches!(second.start(), Err(ServerError::Bind(..))));
        assert_eq!(rx.try_recv().unwrap().kind, NotificationKind::Exception);

        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_force_closes_live_connections() {
        let options = ServerOptions {
            shutdown_grace: Duration::from_millis(100),
            ..ServerOptions::default()
        };
        let (server, mut rx) = start(options);
        let addr = server.local_addr();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        assert_eq!(read_reply(&mut client).await, "ack.");
        assert_eq!(server.connection_count(), 1);

        server.shutdown().await;
        assert_closed_by_server(&mut client).await;
        wait_for_note(&mut rx, |n| n.text.contains("ConnectionClose (shutdown)")).await;

        // Listener is gone.
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_extra_clients() {
        let options = ServerOptions {
            max_connections: 1,
            ..ServerOptions::default()
        };
        let (server, mut rx) = start(options);
        let mut first = TcpStream::connect(server.local_addr()).await.unwrap();
        first.write_all(b"hi").await.unwrap();
        assert_eq!(read_reply(&mut first).await, "ack.");

        let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
        assert_closed_by_server(&mut second).await;
        let n = wait_for_note(&mut rx, |n| n.kind == NotificationKind::Exception).await;
        assert!(n.text.contains("connection limit"));

        // The first connection is unaffected.
        first.write_all(b"<EOF>").await.unwrap();
        assert_eq!(read_reply(&mut first).await, "bye.");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_accept_error_is_reported_and_loop_continues() {
        let (sink, mut rx) = ChannelSink::new();
        let options = ServerOptions::default();
        let acceptor = Arc::new(Acceptor {
            registry: Arc::new(ConnectionRegistry::new(options.max_connections)),
            protocol: Arc::new(Protocol::new(ReplyPolicy::Fixed, SentinelScope::Chunk)),
            sink: Arc::new(sink),
            options,
        });

        let err = io::Error::new(io::ErrorKind::Other, "too many open files");
        acceptor.on_accept(Err(err)).await;
        let n = rx.try_recv().unwrap();
        assert_eq!(n.kind, NotificationKind::Exception);
        assert_eq!(n.text, "Accept failed: too many open files");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&acceptor).run(listener, shutdown_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        assert_eq!(read_reply(&mut client).await, "ack.");
        wait_for_note(&mut rx, |n| n.text == "Incoming connection.").await;

        shutdown_tx.send_replace(true);
        task.await.unwrap();
        assert_eq!(acceptor.registry.len(), 1);
        acceptor.registry.close_all(CloseReason::Shutdown);
        acceptor.registry.drained().await;
    }
}
