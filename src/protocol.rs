//! Sentinel-delimited reply protocol.
//!
//! Clients send arbitrary text chunks. A chunk containing the literal
//! marker `<EOF>` ends the exchange; every chunk gets at most one reply.
//!
//! ```text
//! Client: hello          Server: ack.
//! Client: world<EOF>     Server: bye.   (connection closes)
//! ```
//!
//! Two reply policies are supported:
//! - `Fixed`: `ack.` for ordinary chunks, `bye.` for the terminal chunk
//! - `Pluggable`: an [`Exchange`] maps each chunk to a reply; an empty reply
//!   sends nothing. Closing is still decided by the sentinel alone.
//!
//! Text is single-byte: non-ASCII bytes decode as `?` and non-ASCII reply
//! characters encode as `?`.

use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// End-of-exchange marker.
pub const SENTINEL: &str = "<EOF>";

/// Reply sent for non-terminal chunks under the fixed policy.
pub const ACK_REPLY: &str = "ack.";

/// Reply sent for the terminal chunk under the fixed policy.
pub const BYE_REPLY: &str = "bye.";

/// Maps received text to reply text.
///
/// Runs synchronously on the connection's own task once per chunk and
/// blocks further progress on that connection until it returns.
pub trait Exchange: Send + Sync {
    fn exchange(&self, received: &str) -> String;
}

impl<F> Exchange for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn exchange(&self, received: &str) -> String {
        self(received)
    }
}

/// Where the sentinel is searched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentinelScope {
    /// Only the chunk just received. A marker split across two
    /// receives never completes the exchange.
    #[default]
    Chunk,
    /// The whole accumulated message.
    Accumulated,
}

/// How replies are produced.
#[derive(Clone)]
pub enum ReplyPolicy {
    Fixed,
    Pluggable(Arc<dyn Exchange>),
}

impl ReplyPolicy {
    /// Pluggable policy from any [`Exchange`].
    pub fn pluggable<E: Exchange + 'static>(exchange: E) -> Self {
        ReplyPolicy::Pluggable(Arc::new(exchange))
    }
}

impl fmt::Debug for ReplyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyPolicy::Fixed => f.write_str("Fixed"),
            ReplyPolicy::Pluggable(_) => f.write_str("Pluggable"),
        }
    }
}

/// What to do after a chunk has been received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Reply to send, `None` when nothing should go on the wire.
    pub reply: Option<String>,
    /// Whether the exchange is complete and the connection must close
    /// once the reply (if any) has been sent.
    pub complete: bool,
}

/// Stateless protocol evaluator shared by all connections.
#[derive(Debug, Clone)]
pub struct Protocol {
    policy: ReplyPolicy,
    scope: SentinelScope,
}

impl Protocol {
    pub fn new(policy: ReplyPolicy, scope: SentinelScope) -> Self {
        Self { policy, scope }
    }

    /// Decide the reply for `chunk`.
    ///
    /// `accumulated` must already include `chunk`.
    pub fn decide(&self, chunk: &str, accumulated: &str) -> Decision {
        let haystack = match self.scope {
            SentinelScope::Chunk => chunk,
            SentinelScope::Accumulated => accumulated,
        };
        let complete = haystack.contains(SENTINEL);

        let reply = match &self.policy {
            ReplyPolicy::Fixed if complete => Some(BYE_REPLY.to_string()),
            ReplyPolicy::Fixed => Some(ACK_REPLY.to_string()),
            ReplyPolicy::Pluggable(exchange) => {
                Some(exchange.exchange(chunk)).filter(|r| !r.is_empty())
            }
        };

        Decision { reply, complete }
    }
}

/// Decode received bytes as single-byte text.
pub fn decode(data: &[u8]) -> String {
    data.iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

/// Encode reply text as single-byte wire bytes.
pub fn encode(text: &str) -> Bytes {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect::<Vec<u8>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> Protocol {
        Protocol::new(ReplyPolicy::Fixed, SentinelScope::Chunk)
    }

    #[test]
    fn test_fixed_ack() {
        let d = fixed().decide("hello", "hello");
        assert_eq!(d.reply.as_deref(), Some("ack."));
        assert!(!d.complete);
    }

    #[test]
    fn test_fixed_bye_anywhere_in_chunk() {
        let d = fixed().decide("wor<EOF>ld", "hellowor<EOF>ld");
        assert_eq!(d.reply.as_deref(), Some("bye."));
        assert!(d.complete);
    }

    #[test]
    fn test_split_marker_chunk_scope() {
        let p = fixed();
        assert!(!p.decide("<E", "<E").complete);
        assert!(!p.decide("OF>", "<EOF>").complete);
    }

    #[test]
    fn test_split_marker_accumulated_scope() {
        let p = Protocol::new(ReplyPolicy::Fixed, SentinelScope::Accumulated);
        assert!(!p.decide("<E", "<E").complete);
        let d = p.decide("OF>", "<EOF>");
        assert!(d.complete);
        assert_eq!(d.reply.as_deref(), Some("bye."));
    }

    #[test]
    fn test_pluggable_reply() {
        let p = Protocol::new(
            ReplyPolicy::pluggable(|s: &str| s.to_uppercase()),
            SentinelScope::Chunk,
        );
        let d = p.decide("hi", "hi");
        assert_eq!(d.reply.as_deref(), Some("HI"));
        assert!(!d.complete);
    }

    #[test]
    fn test_pluggable_empty_reply_still_closes() {
        let p = Protocol::new(
            ReplyPolicy::pluggable(|_: &str| String::new()),
            SentinelScope::Chunk,
        );
        let d = p.decide("done<EOF>", "done<EOF>");
        assert_eq!(d.reply, None);
        assert!(d.complete);
    }

    #[test]
    fn test_pluggable_sees_chunk_not_history() {
        let p = Protocol::new(
            ReplyPolicy::pluggable(|s: &str| format!("[{s}]")),
            SentinelScope::Chunk,
        );
        let d = p.decide("b", "ab");
        assert_eq!(d.reply.as_deref(), Some("[b]"));
    }

    #[test]
    fn test_decode_non_ascii() {
        assert_eq!(decode(b"ok\xff\x80!"), "ok??!");
    }

    #[test]
    fn test_encode_non_ascii() {
        assert_eq!(&encode("caf\u{e9}")[..], b"caf?");
    }
}
