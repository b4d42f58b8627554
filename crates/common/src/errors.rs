//! Top-level error type shared by the launcher binary and common utilities.
//!
//! Crate-specific wire/runtime errors (e.g. `outpost-agent-protocol`'s
//! `AgentProtocolError`) are not folded into this type; `OutpostError::Other`
//! carries them across crate boundaries via `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutpostError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type OutpostResult<T> = Result<T, OutpostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_renders_message() {
        let err = OutpostError::Config("missing socket_path".to_string());
        assert_eq!(err.to_string(), "configuration error: missing socket_path");
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: OutpostError = io_err.into();
        assert!(matches!(err, OutpostError::Io(_)));
    }
}
