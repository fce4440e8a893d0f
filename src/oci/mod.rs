// src/oci/mod.rs

//! OCI manifest types and the layer helpers workers dispatch on.

use crate::core::BeskarError;
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;

pub mod push;

pub use push::{FileLayer, ImagePusher, StreamLayer};

pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// A content descriptor as carried in OCI manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Descriptor {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }
}

/// An OCI image manifest. Workers dispatch on the config media type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: i32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Manifest {
    pub fn parse(payload: &[u8]) -> Result<Self, BeskarError> {
        serde_json::from_slice(payload)
            .map_err(|e| BeskarError::ManifestParse(format!("invalid OCI manifest: {e}")))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, BeskarError> {
        serde_json::to_vec(self).map_err(|e| BeskarError::Internal(e.to_string()))
    }
}

/// The first layer whose media type matches exactly.
pub fn get_layer<'a>(manifest: &'a Manifest, media_type: &str) -> Option<&'a Descriptor> {
    manifest
        .layers
        .iter()
        .find(|layer| layer.media_type == media_type)
}

/// The first layer the predicate accepts, for prefixed media-type families.
pub fn get_layer_filter<'a>(
    manifest: &'a Manifest,
    predicate: impl Fn(&str) -> bool,
) -> Option<&'a Descriptor> {
    manifest
        .layers
        .iter()
        .find(|layer| predicate(&layer.media_type))
}

/// SHA-256 digest in OCI notation.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Deterministic content tag for an artifact's logical name. MD5 is fine
/// here: the value is only an index key, never a security boundary.
pub fn content_tag(name: &str) -> String {
    hex::encode(Md5::digest(name.as_bytes()))
}
