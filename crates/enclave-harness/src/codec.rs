//! Typed message encoding.
//!
//! The boundary only carries opaque bytes. Handlers that exchange typed
//! messages agree on a serde type and use these helpers on both sides.

use crate::error::{HarnessError, HarnessResult};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

/// Encode a typed message for sending.
pub fn encode<T: Serialize>(message: &T) -> HarnessResult<Bytes> {
    bincode::serialize(message)
        .map(Bytes::from)
        .map_err(|e| HarnessError::MalformedMessage(format!("encode failed: {}", e)))
}

/// Decode a typed message received from the peer.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> HarnessResult<T> {
    bincode::deserialize(payload)
        .map_err(|e| HarnessError::MalformedMessage(format!("decode failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Request {
        Put { key: String, value: Vec<u8> },
        Get { key: String },
    }

    #[test]
    fn test_typed_message() {
        let request = Request::Put {
            key: "k".to_string(),
            value: vec![1, 2, 3],
        };
        let bytes = encode(&request).unwrap();
        let decoded: Request = decode(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let result: HarnessResult<Request> = decode(&[0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(HarnessError::MalformedMessage(_))));
    }
}
