//! TimerSync - synchronized countdown timers across a small node cluster
//!
//! One node owns the timer state and ticks it (the parent); up to a fixed
//! number of child nodes mirror it read-only. Nodes find each other through
//! a small directory (rendezvous) server and talk over framed TCP links.

pub mod cluster;
pub mod config;
pub mod console;
pub mod directory;
pub mod node;
pub mod protocol;
pub mod remote;
pub mod schedule;
pub mod timer;
pub mod transport;

pub use cluster::{CommandError, NodeHandle, NodeRole, NodeView};
pub use config::Config;
pub use directory::{DirectoryServer, TcpDirectory};
pub use node::Node;
pub use remote::{Channel, Directory, RemoteError};
pub use timer::{Timer, TimerCollection, TimerPatch};
