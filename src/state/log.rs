// src/state/log.rs

//! The log database: per-repository processing log, written when event
//! handling fails and readable through the repository-management API.

use super::RepoDatabase;
use crate::core::BeskarError;
use crate::storage::Store;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::migrate::Migrator;
use std::path::Path;
use std::sync::Arc;

static MIGRATOR: Migrator = sqlx::migrate!("migrations/log");

pub const LOG_DB_NAME: &str = "log";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub level: String,
    pub date: i64,
    pub message: String,
}

#[derive(Clone)]
pub struct LogDatabase {
    db: Arc<RepoDatabase>,
}

impl LogDatabase {
    pub async fn open(
        store: Arc<dyn Store>,
        prefix: &str,
        repository: &str,
        dir: &Path,
    ) -> Result<Self, BeskarError> {
        let db = RepoDatabase::open(store, prefix, repository, LOG_DB_NAME, dir, &MIGRATOR).await?;
        Ok(Self { db })
    }

    pub fn inner(&self) -> &Arc<RepoDatabase> {
        &self.db
    }

    pub async fn add_log(&self, level: &str, message: &str) -> Result<(), BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.write().await;
        sqlx::query("INSERT INTO logs (level, date, message) VALUES (?1, ?2, ?3)")
            .bind(level)
            .bind(chrono::Utc::now().timestamp())
            .bind(message)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Most recent records first.
    pub async fn logs(&self, limit: i64) -> Result<Vec<LogRecord>, BeskarError> {
        let _ref = self.db.enter()?;
        let _lock = self.db.read().await;
        let rows = sqlx::query("SELECT id, level, date, message FROM logs ORDER BY id DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(self.db.pool())
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(LogRecord {
                    id: row.try_get("id")?,
                    level: row.try_get("level")?,
                    date: row.try_get("date")?,
                    message: row.try_get("message")?,
                })
            })
            .collect()
    }

    pub async fn sync(&self) -> Result<(), BeskarError> {
        self.db.sync().await
    }

    pub async fn close(&self, remove_local: bool) -> Result<(), BeskarError> {
        self.db.close(remove_local).await
    }
}
