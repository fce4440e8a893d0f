// src/gossip/message.rs

//! Wire messages of the membership protocol and their authenticated wrapper.

use crate::core::BeskarError;
use crate::gossip::member::MemberMeta;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;
pub type Signature = [u8; 32];

/// The message types gossiped between nodes over UDP.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum GossipMessage {
    /// A member announcing itself.
    Join { member: MemberMeta },
    /// Liveness probe.
    Ping { sender_id: String },
    /// Probe answer carrying the sender's membership view.
    Pong {
        sender_id: String,
        members: Vec<MemberMeta>,
    },
    /// Metadata changed (e.g. the ready flag flipped).
    Update { member: MemberMeta },
    /// Graceful departure.
    Leave { id: String },
}

/// Wrapper for a gossip message that carries an HMAC-SHA256 signature keyed
/// by the shared fleet key. This is the structure actually sent over UDP.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct SealedMessage {
    pub message: GossipMessage,
    pub signature: Signature,
}

impl SealedMessage {
    /// Signs a gossip message. Without a fleet key the signature is zero.
    pub fn new(message: GossipMessage, key: &Option<String>) -> Result<Self, BeskarError> {
        let Some(key) = key else {
            return Ok(Self {
                message,
                signature: [0u8; 32],
            });
        };

        let message_bytes = bincode::encode_to_vec(&message, bincode::config::standard())?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|_| BeskarError::Gossip("failed to create HMAC instance".to_string()))?;
        mac.update(&message_bytes);

        let signature: Signature = mac
            .finalize()
            .into_bytes()
            .as_slice()
            .try_into()
            .map_err(|_| BeskarError::Gossip("invalid signature length".to_string()))?;

        Ok(Self { message, signature })
    }

    /// Verifies the signature of a received message. Without a fleet key only
    /// unsigned messages are accepted.
    pub fn verify(&self, key: &Option<String>) -> Result<bool, BeskarError> {
        let Some(key) = key else {
            return Ok(self.signature == [0u8; 32]);
        };

        if self.signature == [0u8; 32] {
            return Ok(false);
        }

        let message_bytes = bincode::encode_to_vec(&self.message, bincode::config::standard())?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|_| BeskarError::Gossip("failed to create HMAC instance".to_string()))?;
        mac.update(&message_bytes);

        Ok(mac.verify_slice(&self.signature).is_ok())
    }

    pub fn encode(&self) -> Result<Vec<u8>, BeskarError> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BeskarError> {
        let (sealed, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(sealed)
    }
}
