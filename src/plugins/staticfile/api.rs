// src/plugins/staticfile/api.rs

//! Repository-management API of the static-file plugin.

use super::{StaticProcessor, oci_repository};
use crate::core::BeskarError;
use crate::oci;
use crate::plugin::endpoints::ApiError;
use crate::plugin::registry::RegistryClient;
use crate::repository::handler::Handler;
use crate::repository::manager::RepositoryManager;
use crate::repository::worker::Worker;
use crate::state::LogRecord;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How long a file removal waits for the registry's delete event to come
/// back and finish processing.
const DELETE_FILE_WAIT: Duration = Duration::from_secs(30);

type StaticManager = Arc<RepositoryManager<Worker<StaticProcessor>>>;

#[derive(Clone)]
struct ApiState {
    manager: StaticManager,
    registry: Arc<RegistryClient>,
}

pub fn router(manager: StaticManager, registry: Arc<RegistryClient>) -> Router {
    let state = ApiState { manager, registry };
    Router::new()
        .route(
            &format!("{}/repository/files", super::API_PREFIX),
            post(list_files),
        )
        .route(
            &format!("{}/repository/file", super::API_PREFIX),
            post(get_file),
        )
        .route(
            &format!("{}/repository/file/remove", super::API_PREFIX),
            post(remove_file),
        )
        .route(
            &format!("{}/repository/remove", super::API_PREFIX),
            post(remove_repository),
        )
        .route(
            &format!("{}/repository/logs", super::API_PREFIX),
            post(repository_logs),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RepositoryRequest {
    repository: String,
}

#[derive(Debug, Deserialize)]
struct FileRequest {
    repository: String,
    file: String,
}

#[derive(Debug, Deserialize)]
struct RemoveRepositoryRequest {
    repository: String,
    #[serde(default)]
    delete_files: bool,
}

#[derive(Debug, Serialize)]
struct RemovedResponse {
    removed: bool,
}

fn validate_repository(name: &str) -> Result<(), BeskarError> {
    if name.trim().is_empty() {
        return Err(BeskarError::InvalidArgument(
            "repository name must not be empty".to_string(),
        ));
    }
    Ok(())
}

async fn list_files(
    State(state): State<ApiState>,
    Json(request): Json<RepositoryRequest>,
) -> Result<Json<Vec<super::RepositoryFile>>, ApiError> {
    validate_repository(&request.repository)?;
    let worker = state.manager.get(&oci_repository(&request.repository)).await?;
    let files = worker.processor().database()?.files().await?;
    Ok(Json(files))
}

async fn get_file(
    State(state): State<ApiState>,
    Json(request): Json<FileRequest>,
) -> Result<Json<super::RepositoryFile>, ApiError> {
    validate_repository(&request.repository)?;
    let worker = state.manager.get(&oci_repository(&request.repository)).await?;
    let file = worker
        .processor()
        .database()?
        .file(&oci::content_tag(&request.file))
        .await?
        .ok_or_else(|| {
            BeskarError::NotFound(format!("file '{}' is not indexed", request.file))
        })?;
    Ok(Json(file))
}

/// Removes one file: delete the manifest in the registry, then wait for the
/// corresponding delete event to come back and finish processing.
async fn remove_file(
    State(state): State<ApiState>,
    Json(request): Json<FileRequest>,
) -> Result<Json<RemovedResponse>, ApiError> {
    validate_repository(&request.repository)?;
    let repository = oci_repository(&request.repository);
    let worker = state.manager.get(&repository).await?;
    let file = worker
        .processor()
        .database()?
        .file(&oci::content_tag(&request.file))
        .await?
        .ok_or_else(|| {
            BeskarError::NotFound(format!("file '{}' is not indexed", request.file))
        })?;

    state.registry.delete_manifest(&repository, &file.digest).await?;
    worker.sync_artifact(&file.name, DELETE_FILE_WAIT).await?;
    Ok(Json(RemovedResponse { removed: true }))
}

async fn remove_repository(
    State(state): State<ApiState>,
    Json(request): Json<RemoveRepositoryRequest>,
) -> Result<Json<RemovedResponse>, ApiError> {
    validate_repository(&request.repository)?;
    let repository = oci_repository(&request.repository);
    let worker = state.manager.get(&repository).await?;
    let db = worker.processor().database()?;

    let files = db.files().await?;
    if !files.is_empty() && !request.delete_files {
        return Err(BeskarError::FailedPrecondition(format!(
            "repository '{}' still has {} file(s); pass delete_files to remove them",
            request.repository,
            files.len()
        ))
        .into());
    }

    for file in &files {
        state.registry.delete_manifest(&repository, &file.digest).await?;
    }

    db.delete_remote().await?;
    if let Some(ctx) = worker.context() {
        ctx.status.inner().delete_remote().await?;
        ctx.log.inner().delete_remote().await?;
    }
    worker.stop().await;
    Ok(Json(RemovedResponse { removed: true }))
}

async fn repository_logs(
    State(state): State<ApiState>,
    Json(request): Json<RepositoryRequest>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    validate_repository(&request.repository)?;
    let worker = state.manager.get(&oci_repository(&request.repository)).await?;
    let ctx = worker.context().ok_or_else(|| {
        BeskarError::Unavailable("repository worker is not running".to_string())
    })?;
    Ok(Json(ctx.log.logs(100).await?))
}
