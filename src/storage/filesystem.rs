// src/storage/filesystem.rs

//! Filesystem-backed object storage. Writes stream into a temporary file
//! next to the destination and become visible through an atomic rename at
//! commit time.

use super::{BlobWriter, Store};
use crate::core::BeskarError;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

pub struct FilesystemStore {
    directory: PathBuf,
}

impl FilesystemStore {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.directory.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl Store for FilesystemStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, BeskarError> {
        let path = self.blob_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BeskarError::NotFound(format!("blob '{key}' does not exist")))
            }
            Err(e) => Err(BeskarError::Storage(format!("failed to read blob '{key}': {e}"))),
        }
    }

    async fn put(&self, key: &str) -> Result<Box<dyn BlobWriter>, BeskarError> {
        let path = self.blob_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BeskarError::Storage(format!("failed to create '{key}' parent: {e}")))?;
        }
        let tmp_path = path.with_extension(format!("tmp.{}", rand::random::<u32>()));
        let file = File::create(&tmp_path)
            .await
            .map_err(|e| BeskarError::Storage(format!("failed to create blob '{key}': {e}")))?;
        Ok(Box::new(FilesystemWriter {
            file,
            tmp_path,
            final_path: path,
            committed: false,
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), BeskarError> {
        let path = self.blob_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BeskarError::Storage(format!("failed to delete blob '{key}': {e}"))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BeskarError> {
        Ok(tokio::fs::try_exists(self.blob_path(key))
            .await
            .unwrap_or(false))
    }
}

struct FilesystemWriter {
    file: File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl AsyncWrite for FilesystemWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().file).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

#[async_trait]
impl BlobWriter for FilesystemWriter {
    async fn commit(mut self: Box<Self>) -> Result<(), BeskarError> {
        self.file
            .flush()
            .await
            .map_err(|e| BeskarError::Storage(format!("failed to flush blob: {e}")))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| BeskarError::Storage(format!("failed to sync blob: {e}")))?;
        tokio::fs::rename(&self.tmp_path, &self.final_path)
            .await
            .map_err(|e| BeskarError::Storage(format!("failed to commit blob: {e}")))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for FilesystemWriter {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.tmp_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove abandoned blob temp file: {e}");
                }
            }
        }
    }
}
