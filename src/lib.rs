//! eofd: a sentinel-delimited TCP request/response server.
//!
//! Clients send text chunks; each chunk is acknowledged and a chunk
//! containing `<EOF>` ends the exchange and closes the connection.
//!
//! Features:
//! - Non-blocking accept loop with a configurable backlog
//! - One receive/reply pump and one idle supervisor per connection
//! - Fixed (`ack.`/`bye.`) or pluggable reply policies
//! - Write-only notification sink for lifecycle, exception and transcript text
//! - Graceful shutdown with a grace period for live connections
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod notify;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use notify::{ChannelSink, Notification, NotificationKind, NotificationSink, TracingSink};
pub use protocol::{Exchange, Protocol, ReplyPolicy, SentinelScope};
pub use server::{RunningServer, Server, ServerError, ServerOptions};
