//! Protocol error types

use std::fmt;

/// Errors raised while encoding, framing or validating peer messages
#[derive(Debug)]
pub enum ProtocolError {
    /// Underlying stream error
    Io(std::io::Error),
    /// Message could not be serialized
    Encode(String),
    /// Frame body is not a well-formed message
    Decode(String),
    /// Frame length prefix exceeds the configured maximum
    FrameTooLarge { len: usize, max: usize },
    /// Message is well-formed but violates an invariant
    Invalid(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {} bytes exceeds maximum of {}", len, max)
            }
            Self::Invalid(msg) => write!(f, "invalid message: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<crate::timer::TimerError> for ProtocolError {
    fn from(err: crate::timer::TimerError) -> Self {
        Self::Invalid(err.to_string())
    }
}
