// src/plugin/registry.rs

//! Client for the OCI registry's HTTP API. Workers interact with the
//! registry exclusively through this client, over the mTLS transport.

use crate::core::BeskarError;
use crate::oci::{MANIFEST_MEDIA_TYPE, Manifest};
use bytes::Bytes;
use std::sync::OnceLock;
use tracing::debug;

/// Where the registry was discovered through gossip.
#[derive(Debug, Clone)]
pub struct RegistryEndpoint {
    pub host: String,
    pub port: u16,
}

impl RegistryEndpoint {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

struct Transport {
    base_url: String,
    client: reqwest::Client,
}

/// Registry client handle. Created before discovery so the API router and
/// the manager can hold it; calls fail with "unavailable" until the
/// discovered endpoint is installed.
#[derive(Default)]
pub struct RegistryClient {
    transport: OnceLock<Transport>,
}

impl RegistryClient {
    /// A client with no endpoint yet.
    pub fn new_pending() -> Self {
        Self::default()
    }

    /// Installs the discovered endpoint and the mTLS HTTP client dialing it.
    /// Only the first installation wins.
    pub fn install(&self, endpoint: &RegistryEndpoint, client: reqwest::Client) {
        let _ = self.transport.set(Transport {
            base_url: endpoint.base_url(),
            client,
        });
    }

    /// Points the client at an explicit base URL. Used by tests standing in
    /// a fake registry.
    pub fn install_base_url(&self, base_url: &str, client: reqwest::Client) {
        let _ = self.transport.set(Transport {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        });
    }

    fn transport(&self) -> Result<&Transport, BeskarError> {
        self.transport
            .get()
            .ok_or_else(|| BeskarError::Unavailable("registry not discovered yet".to_string()))
    }

    /// The URL content requests redirect to for a blob.
    pub fn blob_url(&self, repository: &str, digest: &str) -> Result<String, BeskarError> {
        let transport = self.transport()?;
        Ok(format!(
            "{}/v2/{}/blobs/{}",
            transport.base_url, repository, digest
        ))
    }

    /// Deletes a manifest by digest. Idempotent: a manifest that is already
    /// gone counts as success.
    pub async fn delete_manifest(&self, repository: &str, digest: &str) -> Result<(), BeskarError> {
        let transport = self.transport()?;
        let url = format!("{}/v2/{}/manifests/{}", transport.base_url, repository, digest);
        let response = transport.client.delete(&url).send().await?;
        match response.status().as_u16() {
            200..=299 | 404 => Ok(()),
            status => Err(BeskarError::Registry(format!(
                "manifest delete for '{repository}@{digest}' failed with status {status}"
            ))),
        }
    }

    /// Uploads a blob if the registry does not already have it.
    pub async fn upload_blob(
        &self,
        repository: &str,
        digest: &str,
        data: Bytes,
    ) -> Result<(), BeskarError> {
        let transport = self.transport()?;

        let head_url = format!("{}/v2/{}/blobs/{}", transport.base_url, repository, digest);
        let head = transport.client.head(&head_url).send().await?;
        if head.status().is_success() {
            debug!("Blob {digest} already present in '{repository}'.");
            return Ok(());
        }

        let start_url = format!("{}/v2/{}/blobs/uploads/", transport.base_url, repository);
        let started = transport.client.post(&start_url).send().await?;
        if !started.status().is_success() {
            return Err(BeskarError::Registry(format!(
                "blob upload start for '{repository}' failed with status {}",
                started.status()
            )));
        }
        let location = started
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                BeskarError::Registry("blob upload start returned no location".to_string())
            })?;
        let location = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("{}{}", transport.base_url, location)
        };
        let separator = if location.contains('?') { '&' } else { '?' };
        let commit_url = format!("{location}{separator}digest={digest}");

        let committed = transport
            .client
            .put(&commit_url)
            .header("content-type", "application/octet-stream")
            .body(data)
            .send()
            .await?;
        if !committed.status().is_success() {
            return Err(BeskarError::Registry(format!(
                "blob upload commit for '{repository}@{digest}' failed with status {}",
                committed.status()
            )));
        }
        Ok(())
    }

    /// Puts a manifest and returns its digest.
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<String, BeskarError> {
        let transport = self.transport()?;
        let body = manifest.to_json()?;
        let digest = crate::oci::sha256_digest(&body);
        let url = format!(
            "{}/v2/{}/manifests/{}",
            transport.base_url, repository, reference
        );
        let media_type = manifest
            .media_type
            .clone()
            .unwrap_or_else(|| MANIFEST_MEDIA_TYPE.to_string());
        let response = transport
            .client
            .put(&url)
            .header("content-type", media_type)
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BeskarError::Registry(format!(
                "manifest put for '{repository}:{reference}' failed with status {}",
                response.status()
            )));
        }
        Ok(digest)
    }

    /// Fetches a blob's content.
    pub async fn get_blob(&self, repository: &str, digest: &str) -> Result<Bytes, BeskarError> {
        let transport = self.transport()?;
        let url = format!("{}/v2/{}/blobs/{}", transport.base_url, repository, digest);
        let response = transport.client.get(&url).send().await?;
        if response.status().as_u16() == 404 {
            return Err(BeskarError::NotFound(format!(
                "blob '{digest}' not found in '{repository}'"
            )));
        }
        if !response.status().is_success() {
            return Err(BeskarError::Registry(format!(
                "blob fetch for '{repository}@{digest}' failed with status {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?)
    }
}
