//! Node role, connection status and the read-only view published to the
//! presentation layer.

use std::fmt;

use crate::remote::RegistrationState;
use crate::timer::Timer;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeRole {
    /// Not linked to anyone, owns its timers
    #[default]
    Standalone,
    /// Owns the timers and has at least one child
    Parent,
    /// Mirrors a parent's timers read-only
    Child,
}

impl NodeRole {
    /// Whether this role holds canonical timer state and runs the tick loop
    pub fn owns_state(&self) -> bool {
        matches!(self, NodeRole::Standalone | NodeRole::Parent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Standalone => "standalone",
            NodeRole::Parent => "parent",
            NodeRole::Child => "child",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection status derived from coordinator state. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a node's state for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    /// Identifier assigned by the directory, if registered
    pub local_id: Option<String>,
    /// Directory registration state
    pub registration: RegistrationState,
    pub role: NodeRole,
    pub status: ConnectionStatus,
    /// Current timers (canonical on parent/standalone, mirrored on child)
    pub timers: Vec<Timer>,
    /// Admitted children (parent only)
    pub child_count: usize,
    pub child_cap: usize,
    /// Parent this node joined or is reconnecting to
    pub target_id: Option<String>,
    /// Last error surfaced to the user
    pub last_error: Option<String>,
}

impl NodeView {
    pub fn new(child_cap: usize) -> Self {
        Self {
            local_id: None,
            registration: RegistrationState::Idle,
            role: NodeRole::Standalone,
            status: ConnectionStatus::Disconnected,
            timers: Vec::new(),
            child_count: 0,
            child_cap,
            target_id: None,
            last_error: None,
        }
    }

    /// Whether the directory registration is live
    pub fn is_server_connected(&self) -> bool {
        self.registration.is_live()
    }

    /// Whether the user may edit timers on this node
    pub fn is_read_only(&self) -> bool {
        self.role == NodeRole::Child
    }
}
