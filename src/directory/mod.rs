//! Directory Service
//!
//! TCP rendezvous: the standalone [`DirectoryServer`] maps node identifiers
//! to peer addresses, and [`TcpDirectory`] is the node-side client that
//! registers with it and resolves join targets.

mod client;
pub mod protocol;
mod server;

pub use client::TcpDirectory;
pub use server::{DirectoryServer, Registry};
