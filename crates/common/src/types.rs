//! Shared identifier newtypes used across the launcher and protocol crates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The string correlation id carried by the v1 wire protocol, and used as
/// a `RequestKey` variant by `outpost-agent-protocol` for non-handshake
/// connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The numeric request id carried by the v2 wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(feature = "runtime")]
impl CorrelationId {
    /// Generate a fresh random correlation id, for agents/launchers that
    /// need to originate one rather than echo a peer-supplied value.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_displays_inner_string() {
        let id = CorrelationId::from("req-123");
        assert_eq!(id.to_string(), "req-123");
    }

    #[test]
    fn request_id_orders_numerically() {
        assert!(RequestId(1) < RequestId(2));
    }

    #[cfg(feature = "runtime")]
    #[test]
    fn generate_produces_non_empty_uuid_string() {
        let id = CorrelationId::generate();
        assert_eq!(id.0.len(), 36);
    }
}
