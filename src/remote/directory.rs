//! Directory Abstraction
//!
//! The rendezvous service a node registers with ("I am reachable as ID X")
//! and uses to reach another node ("connect me to ID Y"). It never carries
//! application data.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use super::channel::{Channel, ChannelId};

/// Classified directory failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryFault {
    /// Network or server trouble, worth retrying after a delay
    Transient(String),
    /// Requested identifier is already registered by someone else
    IdTaken(String),
    /// Anything else, surfaced without automatic retry
    Fatal(String),
}

impl fmt::Display for DirectoryFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryFault::Transient(msg) => write!(f, "transient directory error: {}", msg),
            DirectoryFault::IdTaken(id) => write!(f, "identifier '{}' is taken", id),
            DirectoryFault::Fatal(msg) => write!(f, "directory error: {}", msg),
        }
    }
}

impl std::error::Error for DirectoryFault {}

/// Notifications from the directory client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// Registration is live under this identifier
    Registered(String),
    /// A live registration was lost
    Lost,
    /// A registration attempt failed
    Failed(DirectoryFault),
}

/// Registration state as seen by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No registration requested yet
    Idle,
    /// Registration request in flight
    Pending,
    /// Reachable under the current identifier
    Live,
    /// Registration dropped, a retry is scheduled
    Retrying,
    /// Gave up, no automatic retry
    Failed,
}

impl RegistrationState {
    pub fn is_live(&self) -> bool {
        matches!(self, RegistrationState::Live)
    }
}

/// Client side of the rendezvous service.
///
/// `register` and `connect` start work in the background and report through
/// the node mailbox: registration results as [`DirectoryEvent`]s, channel
/// progress as channel events tagged with the given [`ChannelId`].
#[async_trait]
pub trait Directory: Send + Sync {
    /// Register this node, optionally asking for a specific identifier.
    /// Any previous registration is replaced.
    fn register(&self, preferred_id: Option<String>);

    /// Start connecting to `target_id`. The returned channel is not open yet.
    fn connect(&self, target_id: &str, channel_id: ChannelId) -> Arc<dyn Channel>;

    /// Drop the registration
    async fn release(&self);
}

/// Generate a random numeric identifier with exactly `digits` digits
/// (no leading zero), e.g. `1000..=9999` for four digits.
pub fn generate_short_id(digits: u32) -> String {
    let digits = digits.clamp(1, 18);
    let low = if digits == 1 { 0 } else { 10u64.pow(digits - 1) };
    let high = 10u64.pow(digits);
    rand::thread_rng().gen_range(low..high).to_string()
}
