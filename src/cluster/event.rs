//! Coordinator Events
//!
//! Everything that can change a node's state arrives as a [`NodeEvent`] in
//! the coordinator mailbox: directory notifications, channel notifications,
//! fired scheduled tasks and presentation commands.

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::remote::{Channel, ChannelEvent, ChannelId, DirectoryEvent};
use crate::schedule::TaskToken;
use crate::timer::{TimerError, TimerPatch};

/// Mailbox entry processed by the coordinator
#[derive(Debug)]
pub enum NodeEvent {
    /// Registration progress from the directory client
    Directory(DirectoryEvent),
    /// A remote node dialed us. Admission happens once the channel opens.
    Inbound { channel: Arc<dyn Channel> },
    /// Lifecycle or data notification from a channel
    Channel { id: ChannelId, event: ChannelEvent },
    /// A scheduled task fired
    Scheduled { token: TaskToken, kind: ScheduledKind },
    /// Presentation command
    Command(Command),
    /// Stop the node; `done` fires once teardown finished
    Shutdown { done: oneshot::Sender<()> },
}

/// What a scheduled task was for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledKind {
    /// One tick of the timer engine
    Tick,
    /// Child reconnect attempt
    Reconnect,
    /// Re-register with the directory after a transient fault
    DirectoryRetry,
    /// Close a rejected inbound channel after the grace delay
    CloseRejected(ChannelId),
}

type Reply<T> = oneshot::Sender<Result<T, CommandError>>;

/// Presentation commands, each answered on its own reply channel
#[derive(Debug)]
pub enum Command {
    AddTimer {
        name: Option<String>,
        seconds: Option<u64>,
        reply: Reply<String>,
    },
    DeleteTimer {
        id: String,
        reply: Reply<()>,
    },
    UpdateTimer {
        id: String,
        patch: TimerPatch,
        reply: Reply<()>,
    },
    ToggleTimer {
        id: String,
        reply: Reply<()>,
    },
    ResetTimer {
        id: String,
        reply: Reply<()>,
    },
    StartAll {
        reply: Reply<()>,
    },
    PauseAll {
        reply: Reply<()>,
    },
    Join {
        target: String,
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<()>,
    },
}

/// Why a command was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Mutations are not allowed on a child node
    ReadOnly,
    /// Timer collection is full
    CapacityReached(usize),
    /// Unknown timer id
    NotFound(String),
    /// Rejected timer values
    Invalid(String),
    /// Command does not apply to the current role
    InvalidRole(&'static str),
    /// A join is already in progress
    AlreadyConnecting,
    /// Join target is empty or this node itself
    InvalidTarget(String),
    /// Coordinator is gone
    Stopped,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::ReadOnly => write!(f, "timers are read-only on a child node"),
            CommandError::CapacityReached(cap) => write!(f, "timer limit reached ({})", cap),
            CommandError::NotFound(id) => write!(f, "timer '{}' not found", id),
            CommandError::Invalid(msg) => write!(f, "invalid timer: {}", msg),
            CommandError::InvalidRole(role) => write!(f, "not allowed while {}", role),
            CommandError::AlreadyConnecting => write!(f, "a join is already in progress"),
            CommandError::InvalidTarget(target) => write!(f, "cannot join '{}'", target),
            CommandError::Stopped => write!(f, "node stopped"),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<TimerError> for CommandError {
    fn from(e: TimerError) -> Self {
        match e {
            TimerError::CapacityReached(cap) => CommandError::CapacityReached(cap),
            TimerError::NotFound(id) => CommandError::NotFound(id),
            TimerError::Invalid(msg) => CommandError::Invalid(msg),
        }
    }
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::AddTimer { .. } => "add_timer",
            Command::DeleteTimer { .. } => "delete_timer",
            Command::UpdateTimer { .. } => "update_timer",
            Command::ToggleTimer { .. } => "toggle_timer",
            Command::ResetTimer { .. } => "reset_timer",
            Command::StartAll { .. } => "start_all",
            Command::PauseAll { .. } => "pause_all",
            Command::Join { .. } => "join",
            Command::Leave { .. } => "leave",
        }
    }
}
