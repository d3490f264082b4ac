//! Request body header and reply data encoding.

use relaynet_recovery::Opcode;
use serde::{Deserialize, Serialize};

use crate::error::{TargetError, TargetResult};

/// Bytes of operation data carried in a reply.
pub const REPLY_DATA_SIZE: usize = 4;

/// Body of a modifying request sent to a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRequest {
    /// Identity of the sending client.
    pub client: String,
    /// Which record fields the operation updates.
    pub opcode: Opcode,
    /// Transaction number from an earlier reply when the client replays
    /// after a restart; 0 for a first attempt.
    pub replay_transno: u64,
    /// Operation arguments.
    pub body: Vec<u8>,
}

impl TargetRequest {
    /// First attempt of an update from `client`.
    pub fn update(client: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            client: client.into(),
            opcode: Opcode::Update,
            replay_transno: 0,
            body: body.into(),
        }
    }

    /// Marks this as a replay of transaction `transno`.
    pub fn replaying(mut self, transno: u64) -> Self {
        self.replay_transno = transno;
        self
    }

    /// Serializes the request.
    pub fn encode(&self) -> TargetResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TargetError::MalformedRequest(e.to_string()))
    }

    /// Deserializes a request.
    pub fn decode(data: &[u8]) -> TargetResult<Self> {
        bincode::deserialize(data).map_err(|e| TargetError::MalformedRequest(e.to_string()))
    }
}

/// Reply body for operation data `data`.
pub fn encode_reply_data(data: u32) -> Vec<u8> {
    data.to_le_bytes().to_vec()
}

/// Operation data from a reply body; `None` if the body is too short.
pub fn decode_reply_data(body: &[u8]) -> Option<u32> {
    let bytes: [u8; REPLY_DATA_SIZE] = body.get(..REPLY_DATA_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_codec() {
        let req = TargetRequest::update("client-a", b"mkdir /x".to_vec()).replaying(42);
        let decoded = TargetRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.replay_transno, 42);
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            TargetRequest::decode(&[0xff, 0xff, 0xff]),
            Err(TargetError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_reply_data() {
        assert_eq!(decode_reply_data(&encode_reply_data(0xdead)), Some(0xdead));
        assert_eq!(decode_reply_data(&[1, 2]), None);
    }
}
