//! Error types for the agent protocol runtime.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while framing, decoding, or running the protocol.
#[derive(Debug, Error)]
pub enum AgentProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("message too large: {size} bytes exceeds max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("wrong connection type for this operation: {0}")]
    WrongConnectionType(String),
}

pub type AgentProtocolResult<T> = Result<T, AgentProtocolError>;
