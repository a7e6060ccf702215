//! Cluster Module
//!
//! Parent/child coordination for a small cluster of nodes sharing one set of
//! countdown timers. One node (the parent) owns the canonical timers and
//! pushes full snapshots to up to `max_children` children, which mirror them
//! read-only.
//!
//! Components:
//! - [`Coordinator`]: single-writer actor owning role, membership and timers
//! - [`Membership`]: admitted children bounded by the cap
//! - [`StateReplicator`]: snapshot encoding, broadcast and apply
//! - [`NodeHandle`]: command/view front end for the presentation layer

mod coordinator;
mod event;
mod handle;
mod membership;
mod replicator;
mod state;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use event::{Command, CommandError, NodeEvent, ScheduledKind};
pub use handle::NodeHandle;
pub use membership::{Admission, Membership};
pub use replicator::StateReplicator;
pub use state::{ConnectionStatus, NodeRole, NodeView};

#[cfg(test)]
mod tests;
