// src/plugins/mirror/web.rs

//! The mirror web endpoint: repository-shaped browsing that resolves paths
//! through the index and redirects content requests to the registry.

use super::{MirrorDatabase, MirrorFile, MirrorProcessor, oci_repository};
use crate::core::BeskarError;
use crate::plugin::endpoints::ApiError;
use crate::repository::manager::RepositoryManager;
use crate::repository::worker::Worker;
use axum::Router;
use axum::extract::{Path, State};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use std::sync::Arc;

/// Upper bound on symlink hops while resolving a path.
pub const MAX_SYMLINK_HOPS: usize = 50;

type MirrorManager = Arc<RepositoryManager<Worker<MirrorProcessor>>>;

pub fn router(manager: MirrorManager) -> Router {
    Router::new()
        .route(
            &format!("{}/{{repository}}/{{*path}}", super::WEB_PREFIX),
            get(web_handler),
        )
        .with_state(manager)
}

/// Collapses `.`, `..`, duplicate separators, and surrounding slashes.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    parts.join("/")
}

/// Resolves a symlink target relative to its parent directory.
pub fn resolve_link(parent: &str, link: &str) -> String {
    if let Some(absolute) = link.strip_prefix('/') {
        normalize_path(absolute)
    } else if parent.is_empty() {
        normalize_path(link)
    } else {
        normalize_path(&format!("{parent}/{link}"))
    }
}

/// Follows the index from `path` to a concrete entry, chasing at most
/// [`MAX_SYMLINK_HOPS`] symlinks.
pub async fn resolve_file(db: &MirrorDatabase, path: &str) -> Result<MirrorFile, BeskarError> {
    let mut current = normalize_path(path);
    let mut hops = 0usize;
    loop {
        let file = db
            .file_by_path(&current)
            .await?
            .ok_or_else(|| BeskarError::NotFound(format!("path '{path}' is not indexed")))?;
        if !file.is_symlink() {
            return Ok(file);
        }
        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(BeskarError::InvalidArgument(format!(
                "too many levels of symbolic links resolving '{path}'"
            )));
        }
        current = resolve_link(&file.parent, &file.link);
    }
}

async fn web_handler(
    State(manager): State<MirrorManager>,
    Path((repository, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let repository = oci_repository(&repository);
    let worker = manager.get(&repository).await?;
    let ctx = worker.context().ok_or_else(|| {
        BeskarError::Unavailable("repository worker is not running".to_string())
    })?;
    let db = worker.processor().database()?;

    let file = resolve_file(&db, &path).await?;
    if file.is_directory() {
        // Directories carry their rendered index as an embedded blob.
        let index = ctx.registry.get_blob(&repository, &file.reference).await?;
        let body = String::from_utf8_lossy(&index).into_owned();
        return Ok(Html(body).into_response());
    }
    let url = ctx.registry.blob_url(&repository, &file.reference)?;
    Ok(Redirect::temporary(&url).into_response())
}
