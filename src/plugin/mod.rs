// src/plugin/mod.rs

//! The plugin runtime: self-description, the registry transport, the
//! HTTP endpoints shared by every plugin, and the bootstrap sequence.

use crate::core::BeskarError;
use serde::{Deserialize, Serialize};

pub mod endpoints;
pub mod registry;
pub mod server;
pub mod transport;

pub use server::{PluginContext, PluginRuntime, serve};

/// The routing policy a plugin registers with the registry: a Rego module
/// plus its JSON data bindings, carried as opaque bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct PolicyBundle {
    pub rego: Vec<u8>,
    pub data: Vec<u8>,
}

/// What a plugin tells the registry about itself through `/info`.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Descriptor {
    pub name: String,
    pub version: String,
    pub mediatypes: Vec<String>,
    pub policy: PolicyBundle,
}

impl Descriptor {
    pub fn encode(&self) -> Result<Vec<u8>, BeskarError> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BeskarError> {
        let (descriptor, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(descriptor)
    }
}
