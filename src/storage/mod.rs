// src/storage/mod.rs

//! Object storage behind the state layer.
//!
//! Drivers implement one contract: a blob written through [`BlobWriter`]
//! becomes visible atomically when `commit` is called and never before.
//! Production drivers (S3, GCS, Azure) live outside this tree; the
//! filesystem and in-memory drivers here honor the same contract.

use crate::config::{StorageConfig, StorageDriver};
use crate::core::BeskarError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncWrite;

pub mod filesystem;
pub mod memory;

pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;

/// A streaming blob writer with commit-on-close semantics. Dropping the
/// writer without committing discards the partial blob.
#[async_trait]
pub trait BlobWriter: AsyncWrite + Send + Unpin {
    async fn commit(self: Box<Self>) -> Result<(), BeskarError>;
}

/// The object-storage contract shared by every driver.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Reads a whole blob. Absent keys yield [`BeskarError::NotFound`].
    async fn get(&self, key: &str) -> Result<Vec<u8>, BeskarError>;

    /// Opens a writer at `key`. The previous blob, if any, stays visible
    /// until the new one commits.
    async fn put(&self, key: &str) -> Result<Box<dyn BlobWriter>, BeskarError>;

    async fn delete(&self, key: &str) -> Result<(), BeskarError>;

    async fn exists(&self, key: &str) -> Result<bool, BeskarError>;
}

/// Key of a repository database blob: `<prefix>/<repository>/<dbname>.db.lz4`.
pub fn db_key(prefix: &str, repository: &str, dbname: &str) -> String {
    let repository = repository.trim_matches('/');
    if prefix.is_empty() {
        format!("{repository}/{dbname}.db.lz4")
    } else {
        format!("{}/{repository}/{dbname}.db.lz4", prefix.trim_matches('/'))
    }
}

/// Builds the configured driver.
pub fn new_store(config: &StorageConfig) -> Result<Arc<dyn Store>, BeskarError> {
    match config.driver {
        StorageDriver::Filesystem => Ok(Arc::new(FilesystemStore::new(
            &config.filesystem.directory,
        ))),
        StorageDriver::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}
