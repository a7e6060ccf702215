//! Peer Protocol
//!
//! Application messages exchanged between a parent and its children over a
//! channel. Messages are JSON objects tagged by `type`:
//!
//! ```json
//! {"type":"SYNC_STATE","payload":{"timers":[...]}}
//! {"type":"ERROR","payload":{"message":"Parent node full (max 4)."}}
//! {"type":"DISCONNECT_NOTICE","payload":{}}
//! ```
//!
//! Snapshots always carry the entire timer collection. A child replaces its
//! view wholesale; there is no incremental form.

mod error;
pub mod frame;

pub use error::ProtocolError;
pub use frame::{frame, read_frame, read_frame_length, write_frame};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::timer::{Timer, TimerCollection};

/// Messages sent from a parent to its children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerMessage {
    /// Full replacement of the child's timer view
    SyncState { timers: Vec<Timer> },
    /// Admission or protocol error, the child tears down
    Error { message: String },
    /// Parent is ending the session on purpose, do not reconnect
    DisconnectNotice {},
}

impl PeerMessage {
    pub fn sync_state(timers: &TimerCollection) -> Self {
        PeerMessage::SyncState {
            timers: timers.to_vec(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        PeerMessage::Error {
            message: message.into(),
        }
    }

    pub fn disconnect_notice() -> Self {
        PeerMessage::DisconnectNotice {}
    }

    /// Encode to a JSON body (no length prefix)
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a JSON body
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Decode and check the payload against local limits
    pub fn decode_validated(data: &[u8], max_timers: usize) -> Result<Self, ProtocolError> {
        let msg = Self::decode(data)?;
        msg.validate(max_timers)?;
        Ok(msg)
    }

    /// Check message invariants before it is applied
    pub fn validate(&self, max_timers: usize) -> Result<(), ProtocolError> {
        match self {
            PeerMessage::SyncState { timers } => {
                TimerCollection::validate_snapshot(timers, max_timers)?;
                Ok(())
            }
            PeerMessage::Error { .. } | PeerMessage::DisconnectNotice {} => Ok(()),
        }
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerMessage::SyncState { .. } => "SYNC_STATE",
            PeerMessage::Error { .. } => "ERROR",
            PeerMessage::DisconnectNotice {} => "DISCONNECT_NOTICE",
        }
    }
}
