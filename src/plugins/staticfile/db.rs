// src/plugins/staticfile/db.rs

//! The static-file repository database: one row per indexed file, keyed by
//! the content tag of the file name.

use crate::core::BeskarError;
use crate::state::RepoDatabase;
use crate::storage::Store;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::migrate::Migrator;
use std::path::Path;
use std::sync::Arc;

static MIGRATOR: Migrator = sqlx::migrate!("migrations/staticfile");

pub const STATIC_DB_NAME: &str = "static";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryFile {
    pub tag: String,
    pub name: String,
    /// Manifest digest of the artifact carrying this file.
    pub digest: String,
    pub size: i64,
    pub created: i64,
}

#[derive(Clone)]
pub struct StaticDatabase {
    db: Arc<RepoDatabase>,
}

impl StaticDatabase {
    pub async fn open(
        store: Arc<dyn Store>,
        prefix: &str,
        repository: &str,
        dir: &Path,
    ) -> Result<Self, BeskarError> {
        let db =
            RepoDatabase::open(store, prefix, repository, STATIC_DB_NAME, dir, &MIGRATOR).await?;
        Ok(Self { db })
    }

    /// Upsert keyed by content tag: re-processing the same put event is a
    /// no-op conflict update.
    pub async fn add_file(&self, file: &RepositoryFile) -> Result<(), BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.write().await;
        sqlx::query(
            "INSERT INTO files (tag, name, digest, size, created) VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(tag) DO UPDATE SET name = excluded.name, digest = excluded.digest, \
             size = excluded.size",
        )
        .bind(&file.tag)
        .bind(&file.name)
        .bind(&file.digest)
        .bind(file.size)
        .bind(file.created)
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

    pub async fn file(&self, tag: &str) -> Result<Option<RepositoryFile>, BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.read().await;
        let row = sqlx::query("SELECT tag, name, digest, size, created FROM files WHERE tag = ?1")
            .bind(tag)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(decode_file).transpose()
    }

    pub async fn files(&self) -> Result<Vec<RepositoryFile>, BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.read().await;
        let rows = sqlx::query("SELECT tag, name, digest, size, created FROM files ORDER BY name")
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

fn decode_file(row: sqlx::sqlite::SqliteRow) -> Result<RepositoryFile, BeskarError> {
    Ok(RepositoryFile {
        tag: row.try_get("tag")?,
        name: row.try_get("name")?,
        digest: row.try_get("digest")?,
        size: row.try_get("size")?,
        created: row.try_get("created")?,
    })
}
