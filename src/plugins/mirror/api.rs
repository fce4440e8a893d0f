// src/plugins/mirror/api.rs

//! Repository-management API of the mirror plugin.

use super::{MirrorProcessor, oci_repository, start_sync};
use crate::core::BeskarError;
use crate::plugin::endpoints::ApiError;
use crate::repository::handler::Handler;
use crate::repository::manager::RepositoryManager;
use crate::repository::worker::Worker;
use crate::state::{Properties, SyncStatus};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

type MirrorManager = Arc<RepositoryManager<Worker<MirrorProcessor>>>;

pub fn router(manager: MirrorManager) -> Router {
    Router::new()
        .route(
            &format!("{}/repository/create", super::API_PREFIX),
            post(create_repository),
        )
        .route(
            &format!("{}/repository/remove", super::API_PREFIX),
            post(remove_repository),
        )
        .route(
            &format!("{}/repository/sync", super::API_PREFIX),
            post(sync_repository),
        )
        .route(
            &format!("{}/repository/sync/status", super::API_PREFIX),
            post(sync_status),
        )
        .route(
            &format!("{}/repository/files", super::API_PREFIX),
            post(list_files),
        )
        .route(
            &format!("{}/repository/logs", super::API_PREFIX),
            post(repository_logs),
        )
        .with_state(manager)
}

#[derive(Debug, Deserialize)]
struct RepositoryRequest {
    repository: String,
}

#[derive(Debug, Deserialize)]
struct CreateRepositoryRequest {
    repository: String,
    #[serde(default)]
    mirror_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RemoveRepositoryRequest {
    repository: String,
    #[serde(default)]
    delete_files: bool,
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    repository: String,
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Serialize)]
struct OkResponse {
    ok: bool,
}

fn validate_repository(name: &str) -> Result<(), BeskarError> {
    if name.trim().is_empty() {
        return Err(BeskarError::InvalidArgument(
            "repository name must not be empty".to_string(),
        ));
    }
    Ok(())
}

async fn create_repository(
    State(manager): State<MirrorManager>,
    Json(request): Json<CreateRepositoryRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    validate_repository(&request.repository)?;
    for raw in &request.mirror_urls {
        Url::parse(raw).map_err(|e| {
            BeskarError::InvalidArgument(format!("invalid mirror URL '{raw}': {e}"))
        })?;
    }

    let worker = manager.get(&oci_repository(&request.repository)).await?;
    let ctx = worker.context().ok_or_else(|| {
        BeskarError::Unavailable("repository worker is not running".to_string())
    })?;

    let properties = ctx.status.properties().await?;
    if properties.created {
        return Err(BeskarError::AlreadyExists(format!(
            "repository '{}' already exists",
            request.repository
        ))
        .into());
    }
    ctx.status
        .update_properties(&Properties {
            created: true,
            mirror: !request.mirror_urls.is_empty(),
            mirror_urls: request.mirror_urls,
        })
        .await?;
    ctx.status.sync().await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn remove_repository(
    State(manager): State<MirrorManager>,
    Json(request): Json<RemoveRepositoryRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    validate_repository(&request.repository)?;
    let worker = manager.get(&oci_repository(&request.repository)).await?;
    let db = worker.processor().database()?;

    let count = db.count_files().await?;
    if count > 0 && !request.delete_files {
        return Err(BeskarError::FailedPrecondition(format!(
            "repository '{}' still has {count} file(s); pass delete_files to remove them",
            request.repository
        ))
        .into());
    }

    db.delete_remote().await?;
    if let Some(ctx) = worker.context() {
        ctx.status.inner().delete_remote().await?;
        ctx.log.inner().delete_remote().await?;
    }
    worker.stop().await;
    Ok(Json(OkResponse { ok: true }))
}

async fn sync_repository(
    State(manager): State<MirrorManager>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncStatus>, ApiError> {
    validate_repository(&request.repository)?;
    let worker = manager.get(&oci_repository(&request.repository)).await?;

    let properties = worker
        .context()
        .ok_or_else(|| BeskarError::Unavailable("repository worker is not running".to_string()))?
        .status
        .properties()
        .await?;
    if !properties.mirror {
        return Err(BeskarError::FailedPrecondition(format!(
            "repository '{}' has no mirror upstreams configured",
            request.repository
        ))
        .into());
    }

    start_sync(worker.clone(), request.wait).await?;

    let status = worker
        .context()
        .ok_or_else(|| BeskarError::Unavailable("repository worker is not running".to_string()))?
        .status
        .sync_status()
        .await?;
    Ok(Json(status))
}

async fn sync_status(
    State(manager): State<MirrorManager>,
    Json(request): Json<RepositoryRequest>,
) -> Result<Json<SyncStatus>, ApiError> {
    validate_repository(&request.repository)?;
    let worker = manager.get(&oci_repository(&request.repository)).await?;
    let ctx = worker.context().ok_or_else(|| {
        BeskarError::Unavailable("repository worker is not running".to_string())
    })?;
    Ok(Json(ctx.status.sync_status().await?))
}

async fn list_files(
    State(manager): State<MirrorManager>,
    Json(request): Json<RepositoryRequest>,
) -> Result<Json<Vec<super::MirrorFile>>, ApiError> {
    validate_repository(&request.repository)?;
    let worker = manager.get(&oci_repository(&request.repository)).await?;
    Ok(Json(worker.processor().database()?.files().await?))
}

async fn repository_logs(
    State(manager): State<MirrorManager>,
    Json(request): Json<RepositoryRequest>,
) -> Result<Json<Vec<crate::state::LogRecord>>, ApiError> {
    validate_repository(&request.repository)?;
    let worker = manager.get(&oci_repository(&request.repository)).await?;
    let ctx = worker.context().ok_or_else(|| {
        BeskarError::Unavailable("repository worker is not running".to_string())
    })?;
    Ok(Json(ctx.log.logs(100).await?))
}
