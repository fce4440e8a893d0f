// src/state/mod.rs

//! Per-repository SQLite state, durably backed by object storage.
//!
//! Every database follows one lifecycle: pull the compressed remote blob on
//! first open (or start fresh), migrate, serve reads and writes through a
//! single connection, and push an lz4-compressed snapshot back to object
//! storage after mutations. At most one writer exists per database; the
//! worker enforces it process-wide and the per-database write lock enforces
//! it across tasks.

use crate::core::{BeskarError, metrics};
use crate::storage::{self, Store};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

pub mod log;
pub mod status;

pub use log::{LogDatabase, LogRecord};
pub use status::{Properties, StatusDatabase, SyncStatus};

/// Bound on waiting for in-flight operations to drain at close time.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One repository-scoped SQLite database and its object-storage shadow.
pub struct RepoDatabase {
    repository: String,
    local_path: PathBuf,
    key: String,
    store: Arc<dyn Store>,
    pool: SqlitePool,
    refs: AtomicI64,
    lock: RwLock<()>,
    closed: AtomicBool,
}

/// Reference-count guard. Public operations hold one for their duration so
/// close-with-remove cannot pull the file out from under them.
pub struct DbRef<'a> {
    db: &'a RepoDatabase,
}

impl Drop for DbRef<'_> {
    fn drop(&mut self) {
        self.db.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RepoDatabase {
    /// Opens (and migrates) the database for `repository`. When the local
    /// file is absent, the compressed remote blob is fetched and unpacked
    /// into place; a missing blob means a brand-new repository.
    pub async fn open(
        store: Arc<dyn Store>,
        prefix: &str,
        repository: &str,
        name: &str,
        dir: &Path,
        migrator: &'static Migrator,
    ) -> Result<Arc<Self>, BeskarError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| BeskarError::Storage(format!("failed to create datadir: {e}")))?;

        let local_path = dir.join(format!("{name}.db"));
        let key = storage::db_key(prefix, repository, name);

        if !tokio::fs::try_exists(&local_path).await.unwrap_or(false) {
            match store.get(&key).await {
                Ok(blob) => {
                    let raw = decompress(blob).await?;
                    tokio::fs::write(&local_path, raw).await.map_err(|e| {
                        BeskarError::Storage(format!("failed to unpack database blob: {e}"))
                    })?;
                    debug!("Pulled database '{key}' from object storage.");
                }
                Err(BeskarError::NotFound(_)) => {
                    debug!("No remote blob for '{key}'; starting fresh.");
                }
                Err(e) => return Err(e),
            }
        }

        // Keep the whole database in the single .db file so the snapshot
        // pushed to object storage is self-contained.
        let options = SqliteConnectOptions::new()
            .filename(&local_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        migrator.run(&pool).await?;

        Ok(Arc::new(Self {
            repository: repository.to_string(),
            local_path,
            key,
            store,
            pool,
            refs: AtomicI64::new(0),
            lock: RwLock::new(()),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Takes a reference for the duration of one public operation.
    pub fn enter(&self) -> Result<DbRef<'_>, BeskarError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BeskarError::Unavailable(format!(
                "database for repository '{}' is closed",
                self.repository
            )));
        }
        self.refs.fetch_add(1, Ordering::SeqCst);
        Ok(DbRef { db: self })
    }

    /// Current reference count; only meaningful for tests and diagnostics.
    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Exclusive lock held around every mutation.
    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }

    /// Shared lock held around reads.
    pub async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Pushes an lz4-compressed snapshot of the local file to object
    /// storage. Serialized behind the write lock; a remote failure leaves
    /// the local state untouched and the next sync catches up.
    pub async fn sync(&self) -> Result<(), BeskarError> {
        let _ref = self.enter()?;
        let _guard = self.lock.write().await;

        let raw = tokio::fs::read(&self.local_path)
            .await
            .map_err(|e| BeskarError::Storage(format!("failed to read local database: {e}")))?;
        let compressed = compress(raw).await?;

        let result = async {
            let mut writer = self.store.put(&self.key).await?;
            writer
                .write_all(&compressed)
                .await
                .map_err(|e| BeskarError::Storage(format!("failed to stream blob: {e}")))?;
            writer.commit().await
        }
        .await;

        match result {
            Ok(()) => {
                metrics::STATE_SYNCS_TOTAL.inc();
                Ok(())
            }
            Err(e) => {
                metrics::STATE_SYNC_FAILURES_TOTAL.inc();
                Err(e)
            }
        }
    }

    /// Removes the remote blob. The local file is cleaned up at worker
    /// teardown, not here.
    pub async fn delete_remote(&self) -> Result<(), BeskarError> {
        let _ref = self.enter()?;
        self.store.delete(&self.key).await
    }

    /// Closes the database once in-flight operations drain, optionally
    /// removing the local file. Idempotent.
    pub async fn close(&self, remove_local: bool) -> Result<(), BeskarError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let drained = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, async {
            while self.refs.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                "Closing database for '{}' with operations still in flight.",
                self.repository
            );
        }

        self.pool.close().await;

        if remove_local {
            match tokio::fs::remove_file(&self.local_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(BeskarError::Storage(format!(
                        "failed to remove local database: {e}"
                    )));
                }
            }
        }
        Ok(())
    }
}

async fn compress(raw: Vec<u8>) -> Result<Vec<u8>, BeskarError> {
    tokio::task::spawn_blocking(move || {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
        encoder
            .write_all(&raw)
            .map_err(|e| BeskarError::Storage(format!("lz4 compression failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| BeskarError::Storage(format!("lz4 compression failed: {e}")))
    })
    .await
    .map_err(|e| BeskarError::Internal(format!("compression task failed: {e}")))?
}

async fn decompress(blob: Vec<u8>) -> Result<Vec<u8>, BeskarError> {
    tokio::task::spawn_blocking(move || {
        let mut decoder = lz4_flex::frame::FrameDecoder::new(blob.as_slice());
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(|e| BeskarError::Storage(format!("lz4 decompression failed: {e}")))?;
        Ok(raw)
    })
    .await
    .map_err(|e| BeskarError::Internal(format!("decompression task failed: {e}")))?
}
