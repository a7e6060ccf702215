//! Channel Abstraction
//!
//! One bidirectional, ordered, reliable message stream to exactly one remote
//! node. Implemented by the TCP transport and by test doubles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate a fresh identifier
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Lifecycle and data notifications from a channel.
///
/// A channel reports `Opened` at most once, then any number of `Data`, then
/// at most one of `Closed` / `Errored`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Data(Bytes),
    Closed,
    Errored(String),
}

impl ChannelEvent {
    /// Whether the channel is finished after this event
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelEvent::Closed | ChannelEvent::Errored(_))
    }
}

/// Error type for channel operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection to remote peer failed or was lost
    ConnectionLost(String),
    /// Remote peer rejected the operation
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// Channel was already closed locally
    ChannelClosed,
    /// Other error
    Other(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            RemoteError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            RemoteError::Timeout => write!(f, "Operation timed out"),
            RemoteError::ChannelClosed => write!(f, "Channel closed"),
            RemoteError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RemoteError {}

/// A message stream to one remote node.
///
/// `send` and `close` only enqueue work, they never block. Frames queued
/// before `close` are delivered before the stream shuts down. Events for the
/// channel arrive in the owning node's mailbox tagged with [`Channel::id`].
pub trait Channel: Send + Sync {
    /// Local identifier for this channel
    fn id(&self) -> ChannelId;

    /// Identifier of the node on the other end
    fn remote_id(&self) -> &str;

    /// Queue an encoded message body for delivery
    fn send(&self, body: Bytes) -> Result<(), RemoteError>;

    /// Flush queued messages, then close the stream
    fn close(&self);
}

impl fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("remote_id", &self.remote_id())
            .finish()
    }
}
