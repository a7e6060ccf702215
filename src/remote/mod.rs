//! Remote Node Communication
//!
//! Boundary abstractions for the two external collaborators a node relies
//! on: the directory (rendezvous) service and per-peer channels. The
//! coordinator only talks to these traits; concrete TCP implementations live
//! in [`crate::directory`] and [`crate::transport`].

mod channel;
mod directory;

pub use channel::{Channel, ChannelEvent, ChannelId, RemoteError};
pub use directory::{
    generate_short_id, Directory, DirectoryEvent, DirectoryFault, RegistrationState,
};
