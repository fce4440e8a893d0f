// src/state/status.rs

//! The status database: durable event inbox plus the repository property and
//! sync singletons.

use super::RepoDatabase;
use crate::core::BeskarError;
use crate::repository::event::{Action, Event};
use crate::storage::Store;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::migrate::Migrator;
use std::path::Path;
use std::sync::Arc;

static MIGRATOR: Migrator = sqlx::migrate!("migrations/status");

pub const STATUS_DB_NAME: &str = "status";

/// Repository-level properties singleton.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Properties {
    pub created: bool,
    pub mirror: bool,
    pub mirror_urls: Vec<String>,
}

/// Sync progress singleton.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub syncing: bool,
    pub start_time: i64,
    pub end_time: i64,
    pub total_files: i64,
    pub synced_files: i64,
    pub sync_error: String,
}

#[derive(Clone)]
pub struct StatusDatabase {
    db: Arc<RepoDatabase>,
}

impl StatusDatabase {
    pub async fn open(
        store: Arc<dyn Store>,
        prefix: &str,
        repository: &str,
        dir: &Path,
    ) -> Result<Self, BeskarError> {
        let db =
            RepoDatabase::open(store, prefix, repository, STATUS_DB_NAME, dir, &MIGRATOR).await?;
        Ok(Self { db })
    }

    pub fn inner(&self) -> &Arc<RepoDatabase> {
        &self.db
    }

    /// Durably records an event before it is acknowledged to the registry.
    /// Re-recording the same event id is a no-op overwrite.
    pub async fn put_event(&self, event: &Event) -> Result<(), BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.write().await;
        sqlx::query(
            "INSERT INTO events (id, payload) VALUES (?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
        )
        .bind(event.id())
        .bind(event.payload.as_slice())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Removes an event once its side-effects completed.
    pub async fn remove_event(&self, id: &str) -> Result<(), BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.write().await;
        sqlx::query("DELETE FROM events WHERE id = ?1")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// All durable events in insertion order, replayed at worker start.
    pub async fn events(&self, repository: &str) -> Result<Vec<Event>, BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.read().await;
        let rows = sqlx::query("SELECT id, payload FROM events ORDER BY rowid")
            .fetch_all(self.db.pool())
            .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let payload: Vec<u8> = row.try_get("payload")?;
            let (digest, action) = id.rsplit_once(':').ok_or_else(|| {
                BeskarError::Database(format!("malformed event id '{id}' in status database"))
            })?;
            let action = Action::parse(action).ok_or_else(|| {
                BeskarError::Database(format!("unknown action in event id '{id}'"))
            })?;
            events.push(Event {
                digest: digest.to_string(),
                action,
                repository: repository.to_string(),
                payload,
            });
        }
        Ok(events)
    }

    pub async fn properties(&self) -> Result<Properties, BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.read().await;
        let row = sqlx::query("SELECT created, mirror, mirror_urls FROM properties WHERE id = 1")
            .fetch_one(self.db.pool())
            .await?;
        let urls: Vec<u8> = row.try_get("mirror_urls")?;
        let mirror_urls = if urls.is_empty() {
            vec![]
        } else {
            serde_json::from_slice(&urls)
                .map_err(|e| BeskarError::Database(format!("corrupt mirror_urls blob: {e}")))?
        };
        Ok(Properties {
            created: row.try_get("created")?,
            mirror: row.try_get("mirror")?,
            mirror_urls,
        })
    }

    pub async fn update_properties(&self, properties: &Properties) -> Result<(), BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.write().await;
        let urls = serde_json::to_vec(&properties.mirror_urls)
            .map_err(|e| BeskarError::Database(format!("cannot encode mirror_urls: {e}")))?;
        sqlx::query("UPDATE properties SET created = ?1, mirror = ?2, mirror_urls = ?3 WHERE id = 1")
            .bind(properties.created)
            .bind(properties.mirror)
            .bind(urls)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn sync_status(&self) -> Result<SyncStatus, BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.read().await;
        let row = sqlx::query(
            "SELECT syncing, start_time, end_time, total, done, error FROM sync WHERE id = 1",
        )
        .fetch_one(self.db.pool())
        .await?;
        Ok(SyncStatus {
            syncing: row.try_get("syncing")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            total_files: row.try_get("total")?,
            synced_files: row.try_get("done")?,
            sync_error: row.try_get("error")?,
        })
    }

    pub async fn update_sync_status(&self, status: &SyncStatus) -> Result<(), BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.write().await;
        sqlx::query(
            "UPDATE sync SET syncing = ?1, start_time = ?2, end_time = ?3, total = ?4, \
             done = ?5, error = ?6 WHERE id = 1",
        )
        .bind(status.syncing)
        .bind(status.start_time)
        .bind(status.end_time)
        .bind(status.total_files)
        .bind(status.synced_files)
        .bind(&status.sync_error)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn sync(&self) -> Result<(), BeskarError> {
        self.db.sync().await
    }

    pub async fn close(&self, remove_local: bool) -> Result<(), BeskarError> {
        self.db.close(remove_local).await
    }
}
