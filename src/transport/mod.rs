//! Transport Layer
//!
//! TCP links between nodes. A link starts with a handshake (`HELLO` from the
//! dialing node, `HELLO_ACK` from the listener), after which both sides
//! exchange length-prefixed peer messages through a [`TcpChannel`].

mod listener;
mod tcp;

pub use listener::PeerListener;
pub use tcp::{dial, drive, OutboundQueue, TcpChannel};

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::config::Config;
use crate::protocol::ProtocolError;

/// Version carried in the handshake. Links between different versions are
/// refused.
pub const PROTOCOL_VERSION: u32 = 1;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP nodelay
    pub tcp_nodelay: bool,
    /// Timeout for dialing and for each handshake step
    pub connect_timeout: Duration,
    /// Largest accepted frame body
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            connect_timeout: Duration::from_secs(10),
            max_frame_size: 1024 * 1024,
        }
    }
}

impl From<&Config> for TransportConfig {
    fn from(config: &Config) -> Self {
        Self {
            tcp_nodelay: true,
            connect_timeout: config.cluster.connect_timeout,
            max_frame_size: config.cluster.max_frame_size,
        }
    }
}

/// Configure a TCP stream
pub fn configure_stream(stream: &TcpStream, config: &TransportConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;
    Ok(())
}

/// Link handshake messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Handshake {
    /// Sent by the dialing node
    Hello { node_id: String, version: u32 },
    /// Listener accepts the link
    HelloAck { version: u32 },
    /// Listener refuses the link
    Refused { reason: String },
}

impl Handshake {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(|body| crate::protocol::frame(&body))
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}
