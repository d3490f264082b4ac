//! Error types for the request-handling target.

use relaynet_recovery::RecoveryError;
use relaynet_transport::TransportError;
use thiserror::Error;

/// Result alias for target operations.
pub type TargetResult<T> = std::result::Result<T, TargetError>;

/// Errors from handling requests.
#[derive(Debug, Error)]
pub enum TargetError {
    /// The network layer failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The client ledger failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] RecoveryError),

    /// A request body could not be decoded or encoded.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl TargetError {
    /// Errors that must stop the target.
    pub fn is_fatal(&self) -> bool {
        match self {
            TargetError::Transport(e) => e.is_fatal(),
            TargetError::Ledger(e) => e.is_fatal(),
            TargetError::MalformedRequest(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_follows_source() {
        let err: TargetError = RecoveryError::SlotsExhausted { max: 4 }.into();
        assert!(err.is_fatal());
        let err: TargetError = TransportError::ProtocolViolation("bad".into()).into();
        assert!(err.is_fatal());
        assert!(!TargetError::MalformedRequest("short".into()).is_fatal());
        let err: TargetError = RecoveryError::ReadOnly.into();
        assert!(!err.is_fatal());
        assert!(err.to_string().starts_with("ledger error"));
    }
}
