//! Directory wire protocol
//!
//! JSON requests and responses, one per length-prefixed frame, on a single
//! long-lived session per node.

use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol::{frame, ProtocolError};

/// Longest identifier the server accepts
pub const MAX_ID_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectoryRequest {
    /// Claim an identifier (or let the server pick one) for `addr`
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        addr: SocketAddr,
    },
    /// Resolve another node's address
    Lookup { id: String },
    /// Drop this session's registration
    Unregister,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    IdTaken,
    InvalidId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectoryResponse {
    Registered { id: String },
    Rejected { kind: RejectKind, message: String },
    Found { id: String, addr: SocketAddr },
    NotFound { id: String },
    Unregistered,
}

/// Encode any directory message as a complete frame
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(message)
        .map(|body| frame(&body))
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(data).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Whether `id` is acceptable as a node identifier
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
