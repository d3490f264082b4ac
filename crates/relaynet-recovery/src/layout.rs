//! On-disk layout of the client ledger.
//!
//! The ledger starts with a server header padded to `server_size`
//! bytes. Client records follow at `client_start`, one every
//! `client_size` bytes, in slot order. A record whose identity starts
//! with a NUL byte is an empty slot. Everything is bincode with fixed
//! little-endian integers.

use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{RecoveryError, RecoveryResult};

/// Bytes in a NUL-padded identity.
pub const UUID_LEN: usize = 40;
/// Encoded length of [`ServerHeader`] before padding.
pub const SERVER_HEADER_LEN: usize = 86;
/// Encoded length of [`ClientRecord`] before padding.
pub const CLIENT_RECORD_LEN: usize = 84;

/// Compat: the ledger belongs to a metadata target.
pub const COMPAT_MDT: u32 = 0x0000_0002;
/// Read-only compat: object ids are tracked in the ledger.
pub const ROCOMPAT_LOVOBJID: u32 = 0x0000_0001;
/// Incompat: the ledger belongs to a metadata target.
pub const INCOMPAT_MDT: u32 = 0x0000_0002;
/// Incompat: the header uses the common layout with `mount_count` in place.
pub const INCOMPAT_COMMON_LR: u32 = 0x0000_0004;
/// Incompat features this build understands.
pub const INCOMPAT_SUPP: u32 = INCOMPAT_MDT | INCOMPAT_COMMON_LR;
/// Read-only compat features this build understands.
pub const ROCOMPAT_SUPP: u32 = ROCOMPAT_LOVOBJID;

/// Fixed-width NUL-padded identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LedgerUuid([u8; UUID_LEN]);

impl LedgerUuid {
    /// The all-zero identity of an empty slot.
    pub const EMPTY: LedgerUuid = LedgerUuid([0; UUID_LEN]);

    /// Identity from a string; anything past `UUID_LEN - 1` bytes is dropped
    /// so the value stays NUL-terminated.
    pub fn new(s: &str) -> Self {
        let mut bytes = [0u8; UUID_LEN];
        let n = s.len().min(UUID_LEN - 1);
        bytes[..n].copy_from_slice(&s.as_bytes()[..n]);
        LedgerUuid(bytes)
    }

    /// True for an empty slot.
    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    /// The identity up to the first NUL.
    pub fn as_str(&self) -> String {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(UUID_LEN);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl Default for LedgerUuid {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Display for LedgerUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl fmt::Debug for LedgerUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LedgerUuid({:?})", self.as_str())
    }
}

impl Serialize for LedgerUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(UUID_LEN)?;
        for byte in &self.0 {
            tuple.serialize_element(byte)?;
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for LedgerUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct UuidVisitor;

        impl<'de> Visitor<'de> for UuidVisitor {
            type Value = LedgerUuid;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} identity bytes", UUID_LEN)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<LedgerUuid, A::Error> {
                let mut bytes = [0u8; UUID_LEN];
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(LedgerUuid(bytes))
            }
        }

        deserializer.deserialize_tuple(UUID_LEN, UuidVisitor)
    }
}

/// Server header at offset 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHeader {
    /// Owning server.
    pub uuid: LedgerUuid,
    /// Highest transaction number handed out when the header was written.
    pub last_transno: u64,
    /// Holds `last_transno` in the legacy layout.
    pub compat14: u64,
    /// Number of times the ledger has been opened.
    pub mount_count: u64,
    /// Compatible feature bits.
    pub feature_compat: u32,
    /// Features an older build may only read.
    pub feature_rocompat: u32,
    /// Features an older build must not touch.
    pub feature_incompat: u32,
    /// Bytes reserved for this header.
    pub server_size: u32,
    /// Offset of the first client record.
    pub client_start: u32,
    /// Bytes per client record.
    pub client_size: u16,
}

impl ServerHeader {
    /// Serializes the header, padded to `server_size` bytes.
    pub fn to_bytes(&self) -> RecoveryResult<Vec<u8>> {
        encode_padded(self, self.server_size as usize, "server header")
    }

    /// Deserializes a header.
    pub fn from_bytes(data: &[u8]) -> RecoveryResult<Self> {
        if data.len() < SERVER_HEADER_LEN {
            return Err(RecoveryError::BadHeader(format!(
                "header truncated: {} bytes (min {})",
                data.len(),
                SERVER_HEADER_LEN
            )));
        }
        bincode::deserialize(data).map_err(|e| RecoveryError::BadHeader(format!("deserialization failed: {}", e)))
    }

    /// Byte offset of slot `idx`.
    pub fn client_offset(&self, idx: u32) -> u64 {
        self.client_start as u64 + idx as u64 * self.client_size as u64
    }

    /// Converts a header written before `INCOMPAT_COMMON_LR`, where the
    /// mount count sat in `last_transno` and the transno one field later.
    /// Marks the header as converted.
    pub fn upgrade_legacy(&mut self) -> bool {
        if self.feature_incompat & INCOMPAT_COMMON_LR != 0 {
            return false;
        }
        self.mount_count = self.last_transno;
        self.last_transno = self.compat14;
        self.feature_incompat |= INCOMPAT_COMMON_LR;
        true
    }
}

/// Per-client outcome of the last completed operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Client identity; empty for a free slot.
    pub uuid: LedgerUuid,
    /// Transaction number of the last non-close operation.
    pub last_transno: u64,
    /// Request xid of the last non-close operation.
    pub last_xid: u64,
    /// Result code of the last non-close operation.
    pub last_result: i32,
    /// Operation-specific reply data.
    pub last_data: u32,
    /// Transaction number of the last close.
    pub last_close_transno: u64,
    /// Request xid of the last close.
    pub last_close_xid: u64,
    /// Result code of the last close.
    pub last_close_result: i32,
}

impl ClientRecord {
    /// Fresh record for a newly connected client.
    pub fn new(uuid: LedgerUuid) -> Self {
        Self {
            uuid,
            ..Default::default()
        }
    }

    /// Highest transno the record holds.
    pub fn max_transno(&self) -> u64 {
        self.last_transno.max(self.last_close_transno)
    }

    /// Serializes the record, padded to `client_size` bytes.
    pub fn to_bytes(&self, client_size: u16) -> RecoveryResult<Vec<u8>> {
        encode_padded(self, client_size as usize, "client record")
    }

    /// Deserializes a record.
    pub fn from_bytes(data: &[u8]) -> RecoveryResult<Self> {
        bincode::deserialize(data).map_err(|e| RecoveryError::SerializationError {
            reason: format!("client record: {}", e),
        })
    }
}

fn encode_padded<T: Serialize>(value: &T, size: usize, what: &str) -> RecoveryResult<Vec<u8>> {
    let mut bytes = bincode::serialize(value).map_err(|e| RecoveryError::SerializationError {
        reason: e.to_string(),
    })?;
    if bytes.len() > size {
        return Err(RecoveryError::SerializationError {
            reason: format!("{} too large: {} bytes (max {})", what, bytes.len(), size),
        });
    }
    bytes.resize(size, 0);
    Ok(bytes)
}
