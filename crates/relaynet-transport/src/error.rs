//! Error types for the transport subsystem.

use thiserror::Error;

use crate::nid::{NetId, Nid};

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error variants for routing, health checking, and message transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A route entry failed validation.
    #[error("invalid route {net} hops {hops} via {gateway}: {reason}")]
    InvalidRoute {
        /// Destination network.
        net: NetId,
        /// Requested hop count.
        hops: u32,
        /// Gateway NID.
        gateway: Nid,
        /// Why the route was rejected.
        reason: String,
    },

    /// Two routes to the same network leave through different local interfaces.
    #[error("routes to {net} via {first} and {second} not supported")]
    AmbiguousRoutes {
        /// Destination network.
        net: NetId,
        /// First gateway.
        first: Nid,
        /// Second gateway.
        second: Nid,
    },

    /// A tunable has an unusable value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Router buffers may not be allocated once forwarding is live.
    #[error("router buffers cannot be allocated while routing is enabled")]
    RoutingActive,

    /// The destination is not on any locally attached network.
    #[error("{0} is unreachable from any local network")]
    Unreachable(Nid),

    /// No matching entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// An argument was rejected (wrong network, future timestamp).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The network interface could not accept more bindings.
    #[error("no space for network binding on {0}")]
    NoSpace(Nid),

    /// A resource is still in use.
    #[error("busy: {0}")]
    Busy(String),

    /// The exchange did not complete before its deadline.
    #[error("request {xid} timed out after {timeout_ms}ms")]
    Timeout {
        /// Transaction identifier.
        xid: u64,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The network reported a failure for this exchange.
    #[error("network error on xid {xid}: {reason}")]
    NetworkError {
        /// Transaction identifier.
        xid: u64,
        /// Description of the failure.
        reason: String,
    },

    /// The peer rejected the operation or the request was aborted.
    #[error("request {xid} failed with status {status}")]
    RequestFailed {
        /// Transaction identifier.
        xid: u64,
        /// Status code reported.
        status: i32,
    },

    /// The transport is shutting down.
    #[error("transport is shutting down")]
    ShuttingDown,

    /// An event or state transition that must never happen.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Ping info could not be decoded.
    #[error("malformed ping info: {0}")]
    MalformedPing(String),

    /// Config file could not be parsed.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Wraps standard I/O errors.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Errors that must stop the node rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::ProtocolViolation(_)
                | TransportError::RoutingActive
                | TransportError::InvalidConfig(_)
        )
    }

    /// Errors that only say something about liveness; the caller may resend.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. }
                | TransportError::NetworkError { .. }
                | TransportError::NoSpace(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(TransportError::ProtocolViolation("x".into()).is_fatal());
        assert!(TransportError::RoutingActive.is_fatal());
        assert!(!TransportError::Timeout { xid: 1, timeout_ms: 10 }.is_fatal());
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout { xid: 1, timeout_ms: 10 }.is_transient());
        assert!(TransportError::NetworkError {
            xid: 7,
            reason: "unlinked".into()
        }
        .is_transient());
        assert!(!TransportError::NotFound("route".into()).is_transient());
    }

    #[test]
    fn test_display_includes_context() {
        let err = TransportError::InvalidRoute {
            net: NetId::ANY,
            hops: 0,
            gateway: Nid::ANY,
            reason: "hops out of range".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("hops 0"));
        assert!(msg.contains("hops out of range"));
    }
}
