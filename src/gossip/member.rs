// src/gossip/member.rs

//! Member identity and the compact metadata blob every node advertises.

use crate::core::BeskarError;
use serde::{Deserialize, Serialize};

/// Upper bound on the encoded metadata blob. The membership protocol carries
/// metadata in every packet, so the blob has to stay small.
pub const MAX_META_SIZE: usize = 512;

/// What role a member plays in the fleet.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum NodeKind {
    Registry,
    Plugin,
}

/// The metadata a member advertises to the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct MemberMeta {
    /// Stable member id (UUID string), generated at process start.
    pub id: String,
    pub kind: NodeKind,
    pub hostname: String,
    /// Gossip address the member answers on, as announced.
    pub addr: String,
    /// Port of the member's HTTP service.
    pub service_port: u16,
    /// Port of the OCI registry served by a registry member; zero on plugins.
    pub registry_port: u16,
    /// Flipped by `mark_as_ready` once the member serves traffic.
    pub ready: bool,
}

impl MemberMeta {
    pub fn encode(&self) -> Result<Vec<u8>, BeskarError> {
        let bytes = bincode::encode_to_vec(self, bincode::config::standard())?;
        if bytes.len() > MAX_META_SIZE {
            return Err(BeskarError::Gossip(format!(
                "member metadata is {} bytes, exceeding the {} byte cap",
                bytes.len(),
                MAX_META_SIZE
            )));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BeskarError> {
        let (meta, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(meta)
    }
}
