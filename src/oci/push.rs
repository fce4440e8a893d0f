// src/oci/push.rs

//! Pushers that assemble a one-config, one-layer OCI image and upload it to
//! the registry.

use super::{Descriptor, MANIFEST_MEDIA_TYPE, Manifest};
use crate::core::BeskarError;
use crate::plugin::registry::RegistryClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A data layer backed by a local file. Digest and size are computed up
/// front by streaming the file through SHA-256.
pub struct FileLayer {
    path: PathBuf,
    descriptor: Descriptor,
}

impl FileLayer {
    pub async fn new(
        path: impl AsRef<Path>,
        media_type: &str,
        annotations: Option<HashMap<String, String>>,
    ) -> Result<Self, BeskarError> {
        let path = path.as_ref().to_path_buf();
        let mut file = tokio::fs::File::open(&path).await?;
        let mut hasher = Sha256::new();
        let mut size: i64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as i64;
        }

        Ok(Self {
            path,
            descriptor: Descriptor {
                media_type: media_type.to_string(),
                digest: format!("sha256:{}", hex::encode(hasher.finalize())),
                size,
                annotations,
            },
        })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    async fn upload(&self, client: &RegistryClient, repository: &str) -> Result<(), BeskarError> {
        // Small artifacts only travel this path; read whole and upload.
        let bytes = tokio::fs::read(&self.path).await?;
        client
            .upload_blob(repository, &self.descriptor.digest, bytes.into())
            .await
    }
}

/// A data layer backed by a stream. Digest and size are only known once the
/// stream has been consumed; asking earlier reports "not computed".
pub struct StreamLayer<R> {
    reader: Option<R>,
    media_type: String,
    annotations: Option<HashMap<String, String>>,
    descriptor: Option<Descriptor>,
}

impl<R: AsyncRead + Unpin + Send> StreamLayer<R> {
    pub fn new(reader: R, media_type: &str, annotations: Option<HashMap<String, String>>) -> Self {
        Self {
            reader: Some(reader),
            media_type: media_type.to_string(),
            annotations,
            descriptor: None,
        }
    }

    /// The layer descriptor, available only after the stream was consumed.
    pub fn descriptor(&self) -> Result<&Descriptor, BeskarError> {
        self.descriptor
            .as_ref()
            .ok_or_else(|| BeskarError::Internal("layer digest not computed yet".to_string()))
    }

    /// Consumes the stream, computing digest and size along the way, and
    /// uploads the blob.
    async fn upload(
        &mut self,
        client: &RegistryClient,
        repository: &str,
    ) -> Result<(), BeskarError> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| BeskarError::Internal("layer stream already consumed".to_string()))?;

        let mut hasher = Sha256::new();
        let mut data = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            data.extend_from_slice(&buf[..n]);
        }

        let descriptor = Descriptor {
            media_type: self.media_type.clone(),
            digest: format!("sha256:{}", hex::encode(hasher.finalize())),
            size: data.len() as i64,
            annotations: self.annotations.take(),
        };
        client
            .upload_blob(repository, &descriptor.digest, data.into())
            .await?;
        self.descriptor = Some(descriptor);
        Ok(())
    }
}

/// Assembles and pushes a one-config, one-layer image.
pub struct ImagePusher {
    repository: String,
    reference: String,
    config_media_type: String,
    config: Vec<u8>,
}

impl ImagePusher {
    pub fn new(repository: &str, reference: &str, config_media_type: &str, config: Vec<u8>) -> Self {
        Self {
            repository: repository.to_string(),
            reference: reference.to_string(),
            config_media_type: config_media_type.to_string(),
            config,
        }
    }

    async fn push_manifest(
        &self,
        client: &RegistryClient,
        layer: Descriptor,
    ) -> Result<String, BeskarError> {
        let config_digest = super::sha256_digest(&self.config);
        client
            .upload_blob(&self.repository, &config_digest, self.config.clone().into())
            .await?;

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MANIFEST_MEDIA_TYPE.to_string()),
            config: Descriptor {
                media_type: self.config_media_type.clone(),
                digest: config_digest,
                size: self.config.len() as i64,
                annotations: None,
            },
            layers: vec![layer],
            annotations: None,
        };
        client
            .put_manifest(&self.repository, &self.reference, &manifest)
            .await
    }

    /// Pushes a file-backed layer plus the config blob and manifest.
    /// Returns the manifest digest.
    pub async fn push_file(
        &self,
        client: &RegistryClient,
        layer: FileLayer,
    ) -> Result<String, BeskarError> {
        layer.upload(client, &self.repository).await?;
        self.push_manifest(client, layer.descriptor.clone()).await
    }

    /// Pushes a stream-backed layer plus the config blob and manifest.
    /// Returns the manifest digest.
    pub async fn push_stream<R: AsyncRead + Unpin + Send>(
        &self,
        client: &RegistryClient,
        mut layer: StreamLayer<R>,
    ) -> Result<String, BeskarError> {
        layer.upload(client, &self.repository).await?;
        let descriptor = layer.descriptor()?.clone();
        self.push_manifest(client, descriptor).await
    }
}
