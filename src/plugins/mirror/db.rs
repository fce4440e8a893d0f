// src/plugins/mirror/db.rs

//! The mirror repository database: files, directories, and symlinks keyed
//! by the content tag of their repository-relative path.

use crate::core::BeskarError;
use crate::oci;
use crate::state::RepoDatabase;
use crate::storage::Store;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::migrate::Migrator;
use std::path::Path;
use std::sync::Arc;

static MIGRATOR: Migrator = sqlx::migrate!("migrations/mirror");

pub const MIRROR_DB_NAME: &str = "mirror";

/// Directory bit in the stored mode, matching the POSIX file type flag.
pub const DIRECTORY_MODE: i64 = 0o040000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorFile {
    pub tag: String,
    /// Repository-relative path.
    pub name: String,
    /// Blob digest content requests redirect to (the directory index blob
    /// for directories).
    pub reference: String,
    pub parent: String,
    /// Symlink target; empty for regular entries.
    pub link: String,
    pub modified_time: i64,
    pub mode: i64,
    pub size: i64,
}

impl MirrorFile {
    pub fn is_symlink(&self) -> bool {
        !self.link.is_empty()
    }

    pub fn is_directory(&self) -> bool {
        self.mode & DIRECTORY_MODE != 0
    }
}

#[derive(Clone)]
pub struct MirrorDatabase {
    db: Arc<RepoDatabase>,
}

impl MirrorDatabase {
    pub async fn open(
        store: Arc<dyn Store>,
        prefix: &str,
        repository: &str,
        dir: &Path,
    ) -> Result<Self, BeskarError> {
        let db =
            RepoDatabase::open(store, prefix, repository, MIRROR_DB_NAME, dir, &MIGRATOR).await?;
        Ok(Self { db })
    }

    pub async fn add_file(&self, file: &MirrorFile) -> Result<(), BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.write().await;
        sqlx::query(
            "INSERT INTO files (tag, name, reference, parent, link, modified_time, mode, size) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(tag) DO UPDATE SET name = excluded.name, \
             reference = excluded.reference, parent = excluded.parent, \
             link = excluded.link, modified_time = excluded.modified_time, \
             mode = excluded.mode, size = excluded.size",
        )
        .bind(&file.tag)
        .bind(&file.name)
        .bind(&file.reference)
        .bind(&file.parent)
        .bind(&file.link)
        .bind(file.modified_time)
        .bind(file.mode)
        .bind(file.size)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn remove_file(&self, tag: &str) -> Result<(), BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.write().await;
        sqlx::query("DELETE FROM files WHERE tag = ?1")
            .bind(tag)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Lookup by repository-relative path.
    pub async fn file_by_path(&self, path: &str) -> Result<Option<MirrorFile>, BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.read().await;
        let row = sqlx::query(
            "SELECT tag, name, reference, parent, link, modified_time, mode, size \
             FROM files WHERE tag = ?1",
        )
        .bind(oci::content_tag(path))
        .fetch_optional(self.db.pool())
        .await?;
        row.map(decode_file).transpose()
    }

    pub async fn files(&self) -> Result<Vec<MirrorFile>, BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.read().await;
        let rows = sqlx::query(
            "SELECT tag, name, reference, parent, link, modified_time, mode, size \
             FROM files ORDER BY name",
        )
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(decode_file).collect()
    }

    pub async fn count_files(&self) -> Result<i64, BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.read().await;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM files")
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn sync(&self) -> Result<(), BeskarError> {
        self.db.sync().await
    }

    pub async fn delete_remote(&self) -> Result<(), BeskarError> {
        self.db.delete_remote().await
    }

    pub async fn close(&self, remove_local: bool) -> Result<(), BeskarError> {
        self.db.close(remove_local).await
    }
}

fn decode_file(row: sqlx::sqlite::SqliteRow) -> Result<MirrorFile, BeskarError> {
    Ok(MirrorFile {
        tag: row.try_get("tag")?,
        name: row.try_get("name")?,
        reference: row.try_get("reference")?,
        parent: row.try_get("parent")?,
        link: row.try_get("link")?,
        modified_time: row.try_get("modified_time")?,
        mode: row.try_get("mode")?,
        size: row.try_get("size")?,
    })
}
