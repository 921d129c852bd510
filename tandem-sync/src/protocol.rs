//! Binary frames carried inside channel payloads.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┐
//! │ msg_type │ client_id │ target       │ payload  │
//! │ 1 byte   │ varint    │ 0 | 1+varint │ variable │
//! └──────────┴───────────┴──────────────┴──────────┘
//! ```
//!
//! The channel fans every payload out to all members, so handshake replies
//! name their intended receiver in `target`; everyone else ignores them.

use serde::{Deserialize, Serialize};
use tandem_core::ClientId;

/// Frame classes. Awareness traffic is kept separate from document traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Sender's state vector; receivers reply with what the sender lacks
    SyncStep1 = 1,
    /// Diff computed against a received state vector
    SyncStep2 = 2,
    /// Incremental update from a local edit
    Update = 3,
    /// Presence patch (see `awareness::AwarenessUpdate`)
    Awareness = 4,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sending replica
    pub client_id: ClientId,
    /// Intended receiver; `None` addresses every member
    pub target: Option<ClientId>,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Handshake opener carrying the sender's state vector.
    pub fn sync_step1(client_id: ClientId, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            client_id,
            target: None,
            payload: state_vector,
        }
    }

    /// Handshake opener addressed to a single peer.
    pub fn sync_step1_to(client_id: ClientId, target: ClientId, state_vector: Vec<u8>) -> Self {
        Self {
            target: Some(target),
            ..Self::sync_step1(client_id, state_vector)
        }
    }

    /// Handshake reply with the updates `target` is missing.
    pub fn sync_step2(client_id: ClientId, target: ClientId, diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            client_id,
            target: Some(target),
            payload: diff,
        }
    }

    pub fn update(client_id: ClientId, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            client_id,
            target: None,
            payload: update,
        }
    }

    pub fn awareness(client_id: ClientId, patch: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Awareness,
            client_id,
            target: None,
            payload: patch,
        }
    }

    /// Whether a receiver with id `me` should act on this frame.
    pub fn is_for(&self, me: ClientId) -> bool {
        self.target.map_or(true, |t| t == me)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let msg = SyncMessage::update(42, vec![1, 2, 3, 4, 5]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.client_id, 42);
        assert_eq!(decoded.target, None);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_step2_is_targeted() {
        let msg = SyncMessage::sync_step2(1, 2, vec![9, 9]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::SyncStep2);
        assert_eq!(decoded.target, Some(2));
        assert!(decoded.is_for(2));
        assert!(!decoded.is_for(3));
    }

    #[test]
    fn test_untargeted_frames_are_for_everyone() {
        let msg = SyncMessage::sync_step1(7, vec![0]);
        assert!(msg.is_for(1));
        assert!(msg.is_for(u64::MAX));

        let directed = SyncMessage::sync_step1_to(7, 8, vec![0]);
        assert_eq!(directed.msg_type, MessageType::SyncStep1);
        assert!(directed.is_for(8));
        assert!(!directed.is_for(1));
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::SyncStep2 as u8, 2);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Awareness as u8, 4);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
        assert!(SyncMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_header_overhead_is_small() {
        let msg = SyncMessage::update(0xFFFF_FFFF, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(
            encoded.len() < 70,
            "Encoded size {} too large for 50-byte update",
            encoded.len()
        );
    }
}
