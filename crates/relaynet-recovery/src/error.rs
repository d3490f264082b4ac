//! Error types for the recovery subsystem.

use thiserror::Error;

/// Result type alias for ledger operations.
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Error variants for the client ledger and transaction sequencing.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The ledger belongs to another server.
    #[error("ledger belongs to {found}, not {expected}; were devices rearranged?")]
    WrongDisk {
        /// Identity this server expected.
        expected: String,
        /// Identity recorded in the ledger.
        found: String,
    },

    /// The header carries a feature this build cannot handle.
    #[error("unsupported {kind} feature(s) {mask:#x}")]
    UnsupportedFeature {
        /// Which feature word ("incompat" or "rocompat").
        kind: &'static str,
        /// The unsupported bits.
        mask: u32,
    },

    /// The server header is unusable.
    #[error("bad ledger header: {0}")]
    BadHeader(String),

    /// A tunable has an unusable value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An argument was rejected (empty or duplicate client identity).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Every client slot is taken.
    #[error("no room for clients: all {max} slots in use")]
    SlotsExhausted {
        /// Slot capacity.
        max: u32,
    },

    /// A slot was claimed twice or released while free.
    #[error("slot {idx}: {reason}")]
    SlotConflict {
        /// Slot index.
        idx: u32,
        /// What went wrong.
        reason: String,
    },

    /// The client is disconnected or unknown.
    #[error("client not connected: {0}")]
    NotConnected(String),

    /// The ledger was opened read-only.
    #[error("ledger is read-only")]
    ReadOnly,

    /// A read returned fewer bytes than the record needs.
    #[error("short read at offset {offset}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        /// Byte offset of the read.
        offset: u64,
        /// Bytes requested.
        wanted: usize,
        /// Bytes available.
        got: usize,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    SerializationError {
        /// Description of the error.
        reason: String,
    },
}

impl RecoveryError {
    /// Errors that leave durable commit state in doubt; startup or the
    /// operation must not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RecoveryError::WrongDisk { .. }
                | RecoveryError::UnsupportedFeature { .. }
                | RecoveryError::BadHeader(_)
                | RecoveryError::SlotsExhausted { .. }
                | RecoveryError::SlotConflict { .. }
                | RecoveryError::InvalidConfig(_)
        )
    }

    /// Errors a caller may retry after the condition clears.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecoveryError::IoError(_) | RecoveryError::ShortRead { .. } | RecoveryError::NotConnected(_)
        )
    }
}
