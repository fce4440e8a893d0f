// src/repository/event.rs

//! Registry events and their wire envelope.

use crate::core::BeskarError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the registry did to a manifest, or a worker lifecycle signal.
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
pub enum Action {
    Put,
    Delete,
    Start,
    Stop,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Put => "put",
            Action::Delete => "delete",
            Action::Start => "start",
            Action::Stop => "stop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "put" => Some(Action::Put),
            "delete" => Some(Action::Delete),
            "start" => Some(Action::Start),
            "stop" => Some(Action::Stop),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work for a repository worker. The payload is the raw OCI
/// manifest JSON as the registry stored it.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub digest: String,
    pub action: Action,
    pub repository: String,
    pub payload: Vec<u8>,
}

impl Event {
    /// Stable event id: `digest ":" action`. The same manifest seen through
    /// the same action maps to the same row, which is what makes replay and
    /// re-delivery safe.
    pub fn id(&self) -> String {
        format!("{}:{}", self.digest, self.action)
    }
}

/// The length-prefixed binary message POSTed to `/event`.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct EventEnvelope {
    pub action: Action,
    pub repository: String,
    pub digest: String,
    pub payload: Vec<u8>,
}

impl EventEnvelope {
    pub fn from_event(event: &Event) -> Self {
        Self {
            action: event.action,
            repository: event.repository.clone(),
            digest: event.digest.clone(),
            payload: event.payload.clone(),
        }
    }

    pub fn into_event(self) -> Event {
        Event {
            digest: self.digest,
            action: self.action,
            repository: self.repository,
            payload: self.payload,
        }
    }

    /// Encodes with a 4-byte big-endian length prefix.
    pub fn encode_framed(&self) -> Result<Vec<u8>, BeskarError> {
        let body = bincode::encode_to_vec(self, bincode::config::standard())?;
        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    pub fn decode_framed(bytes: &[u8]) -> Result<Self, BeskarError> {
        if bytes.len() < 4 {
            return Err(BeskarError::Encoding(
                "event message shorter than its length prefix".to_string(),
            ));
        }
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() < 4 + len {
            return Err(BeskarError::Encoding(format!(
                "event message truncated: expected {len} bytes, got {}",
                bytes.len() - 4
            )));
        }
        let (envelope, _) =
            bincode::decode_from_slice(&bytes[4..4 + len], bincode::config::standard())?;
        Ok(envelope)
    }
}
