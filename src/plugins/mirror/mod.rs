// src/plugins/mirror/mod.rs

//! The mirror plugin: upstream trees mirrored into the registry, browsable
//! through a repository-shaped web endpoint.

use crate::config::Config;
use crate::core::BeskarError;
use crate::oci::{self, ImagePusher, Manifest, StreamLayer};
use crate::plugin::server::{PluginContext, PluginRuntime};
use crate::plugin::{Descriptor, PolicyBundle};
use crate::repository::event::Event;
use crate::repository::manager::RepositoryManager;
use crate::repository::worker::{Processor, Worker, WorkerContext};
use crate::state::SyncStatus;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

pub mod api;
pub mod db;
pub mod web;

pub use db::{DIRECTORY_MODE, MirrorDatabase, MirrorFile};

pub const PLUGIN_NAME: &str = "mirror";
pub const API_PREFIX: &str = "/artifacts/mirror/api/v1";
pub const WEB_PREFIX: &str = "/artifacts/mirror/web/v1";
pub const REPOSITORY_PREFIX: &str = "artifacts/mirror";

pub const FILE_CONFIG_TYPE: &str = "application/vnd.ciq.mirror.file.v1.config+json";
pub const DIRECTORY_CONFIG_TYPE: &str = "application/vnd.ciq.mirror.directory.v1.config+json";
pub const SYMLINK_CONFIG_TYPE: &str = "application/vnd.ciq.mirror.symlink.v1.config+json";
pub const LAYER_TYPE_PREFIX: &str = "application/vnd.ciq.mirror.v1.";
pub const FILE_LAYER_TYPE: &str = "application/vnd.ciq.mirror.v1.file";
pub const INDEX_LAYER_TYPE: &str = "application/vnd.ciq.mirror.v1.index";

pub const PATH_ANNOTATION: &str = "com.ciq.mirror.v1.path";
pub const LINK_ANNOTATION: &str = "com.ciq.mirror.v1.link";
pub const MODE_ANNOTATION: &str = "com.ciq.mirror.v1.mode";
pub const MTIME_ANNOTATION: &str = "com.ciq.mirror.v1.mtime";

const ROUTING_POLICY: &str = r#"package mirror

default output = {"found": false}

output = obj {
    startswith(input.path, "/artifacts/mirror/")
    repo := trim_prefix(input.path, "/artifacts/mirror/")
    obj := {"repository": concat("/", ["artifacts/mirror", repo]), "found": true}
}
"#;

/// Maps an API repository name onto the OCI repository the registry uses.
pub fn oci_repository(name: &str) -> String {
    let name = name.trim_matches('/');
    if name.starts_with(REPOSITORY_PREFIX) {
        name.to_string()
    } else {
        format!("{REPOSITORY_PREFIX}/{name}")
    }
}

pub fn descriptor() -> Descriptor {
    Descriptor {
        name: PLUGIN_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        mediatypes: vec![
            FILE_CONFIG_TYPE.to_string(),
            DIRECTORY_CONFIG_TYPE.to_string(),
            SYMLINK_CONFIG_TYPE.to_string(),
        ],
        policy: PolicyBundle {
            rego: ROUTING_POLICY.as_bytes().to_vec(),
            data: b"{}".to_vec(),
        },
    }
}

pub fn build(
    ctx: &PluginContext,
) -> Result<PluginRuntime<Worker<MirrorProcessor>>, BeskarError> {
    let manager = RepositoryManager::new(
        PathBuf::from(&ctx.config.datadir),
        ctx.config.storage.prefix.clone(),
        ctx.store.clone(),
        ctx.registry.clone(),
        |params| Worker::new(params, MirrorProcessor::new(Arc::new(NoopPlanner))),
    );
    let api_router = api::router(manager.clone());
    let web_router = web::router(manager.clone());
    Ok(PluginRuntime {
        manager,
        api_router,
        web_router,
    })
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    crate::plugin::serve(config, descriptor(), build).await
}

/// One upstream object the sync pipeline decided to fetch.
#[derive(Debug, Clone)]
pub struct PlannedFetch {
    pub path: String,
    pub url: String,
}

/// Seam between the sync orchestration and the upstream metadata parsers,
/// which live outside this tree. Implementations decide what is missing and
/// how to fetch it.
#[async_trait]
pub trait UpstreamPlanner: Send + Sync + 'static {
    async fn plan(
        &self,
        mirror_urls: &[String],
        db: &MirrorDatabase,
    ) -> Result<Vec<PlannedFetch>, BeskarError>;

    async fn fetch(&self, item: &PlannedFetch) -> Result<Vec<u8>, BeskarError>;
}

/// Planner with no upstream understanding: everything already indexed is
/// up to date, nothing new to fetch.
pub struct NoopPlanner;

#[async_trait]
impl UpstreamPlanner for NoopPlanner {
    async fn plan(
        &self,
        _mirror_urls: &[String],
        _db: &MirrorDatabase,
    ) -> Result<Vec<PlannedFetch>, BeskarError> {
        Ok(vec![])
    }

    async fn fetch(&self, item: &PlannedFetch) -> Result<Vec<u8>, BeskarError> {
        Err(BeskarError::Internal(format!(
            "no upstream fetcher available for '{}'",
            item.url
        )))
    }
}

/// Per-kind event handling for mirror trees.
pub struct MirrorProcessor {
    db: RwLock<Option<MirrorDatabase>>,
    planner: Arc<dyn UpstreamPlanner>,
}

impl MirrorProcessor {
    pub fn new(planner: Arc<dyn UpstreamPlanner>) -> Self {
        Self {
            db: RwLock::new(None),
            planner,
        }
    }

    pub fn database(&self) -> Result<MirrorDatabase, BeskarError> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| BeskarError::Unavailable("repository database not open".to_string()))
    }

    pub fn planner(&self) -> Arc<dyn UpstreamPlanner> {
        self.planner.clone()
    }

    fn entry_from_manifest(manifest: &Manifest) -> Result<MirrorFile, BeskarError> {
        let layer = oci::get_layer_filter(manifest, |mt| mt.starts_with(LAYER_TYPE_PREFIX))
            .ok_or_else(|| {
                BeskarError::InvalidArgument("manifest carries no mirror layer".to_string())
            })?;
        let path = layer.annotation(PATH_ANNOTATION).ok_or_else(|| {
            BeskarError::InvalidArgument("mirror layer carries no path annotation".to_string())
        })?;
        let path = web::normalize_path(path);
        let parent = match path.rfind('/') {
            Some(idx) => path[..idx].to_string(),
            None => String::new(),
        };
        let mut mode: i64 = layer
            .annotation(MODE_ANNOTATION)
            .and_then(|m| m.parse().ok())
            .unwrap_or(0o100644);
        let modified_time = layer
            .annotation(MTIME_ANNOTATION)
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);
        let link = match manifest.config.media_type.as_str() {
            SYMLINK_CONFIG_TYPE => layer
                .annotation(LINK_ANNOTATION)
                .ok_or_else(|| {
                    BeskarError::InvalidArgument(
                        "symlink layer carries no link annotation".to_string(),
                    )
                })?
                .to_string(),
            _ => String::new(),
        };
        if manifest.config.media_type == DIRECTORY_CONFIG_TYPE {
            mode |= DIRECTORY_MODE;
        }

        Ok(MirrorFile {
            tag: oci::content_tag(&path),
            name: path,
            reference: layer.digest.clone(),
            parent,
            link,
            modified_time,
            mode,
            size: layer.size,
        })
    }
}

#[async_trait]
impl Processor for MirrorProcessor {
    async fn start(&self, ctx: &WorkerContext) -> Result<(), BeskarError> {
        let db = MirrorDatabase::open(
            ctx.store.clone(),
            &ctx.prefix,
            &ctx.repository,
            &ctx.dir,
        )
        .await?;
        *self.db.write() = Some(db);
        Ok(())
    }

    async fn process_manifest(
        &self,
        ctx: &WorkerContext,
        _event: &Event,
        manifest: &Manifest,
    ) -> Result<(), BeskarError> {
        match manifest.config.media_type.as_str() {
            FILE_CONFIG_TYPE | DIRECTORY_CONFIG_TYPE | SYMLINK_CONFIG_TYPE => {}
            other => {
                return Err(BeskarError::InvalidArgument(format!(
                    "unexpected config media type '{other}'"
                )));
            }
        }
        let entry = Self::entry_from_manifest(manifest)?;
        let db = self.database()?;
        db.add_file(&entry).await?;
        if let Err(e) = db.sync().await {
            warn!("Repository database sync for '{}' failed: {e}", ctx.repository);
            let _ = ctx
                .log
                .add_log("warn", &format!("repository database sync failed: {e}"))
                .await;
        }
        Ok(())
    }

    async fn delete_manifest(
        &self,
        ctx: &WorkerContext,
        _event: &Event,
        manifest: &Manifest,
    ) -> Result<(), BeskarError> {
        let Ok(entry) = Self::entry_from_manifest(manifest) else {
            return Ok(());
        };
        let db = self.database()?;
        db.remove_file(&entry.tag).await?;
        if let Err(e) = db.sync().await {
            warn!("Repository database sync for '{}' failed: {e}", ctx.repository);
            let _ = ctx
                .log
                .add_log("warn", &format!("repository database sync failed: {e}"))
                .await;
        }
        Ok(())
    }

    async fn stop(&self, ctx: &WorkerContext) {
        let db = self.db.write().take();
        if let Some(db) = db {
            if let Err(e) = db.close(true).await {
                warn!("Failed to close repository database for '{}': {e}", ctx.repository);
            }
        }
    }

    fn artifact_name(&self, manifest: &Manifest) -> Option<String> {
        Self::entry_from_manifest(manifest).ok().map(|e| e.name)
    }
}

/// Kicks off a repository synchronization. With `wait`, returns only once
/// the pipeline finished; the sync singleton records progress either way.
pub async fn start_sync(
    worker: Arc<Worker<MirrorProcessor>>,
    wait: bool,
) -> Result<(), BeskarError> {
    let ctx = worker
        .context()
        .ok_or_else(|| BeskarError::Unavailable("repository worker is not running".to_string()))?;
    let status = ctx.status.clone();

    let current = status.sync_status().await?;
    if current.syncing {
        return Err(BeskarError::FailedPrecondition(
            "a synchronization is already running".to_string(),
        ));
    }

    let db = worker.processor().database()?;
    let planner = worker.processor().planner();
    let properties = status.properties().await?;

    let started = SyncStatus {
        syncing: true,
        start_time: chrono::Utc::now().timestamp(),
        end_time: 0,
        total_files: db.count_files().await?,
        synced_files: 0,
        sync_error: String::new(),
    };
    status.update_sync_status(&started).await?;

    let (done_tx, done_rx) = oneshot::channel::<Option<String>>();
    let repository = ctx.repository.clone();
    let registry = ctx.registry.clone();
    let mut shutdown_rx = ctx.subscribe_shutdown();

    tokio::spawn(async move {
        let mut progress = started;
        let outcome: Result<(), BeskarError> = async {
            let plan = planner.plan(&properties.mirror_urls, &db).await?;
            // Files already indexed count as synced; the plan is what is
            // still missing from upstream.
            progress.synced_files = progress.total_files;
            progress.total_files += plan.len() as i64;
            status.update_sync_status(&progress).await?;

            for item in plan {
                if shutdown_rx.try_recv().is_ok() {
                    return Err(BeskarError::WaitingInterruption(item.path));
                }
                let content = planner.fetch(&item).await?;
                let config = serde_json::json!({ "path": item.path }).to_string().into_bytes();
                let mut annotations = HashMap::new();
                annotations.insert(PATH_ANNOTATION.to_string(), item.path.clone());
                annotations.insert(
                    MTIME_ANNOTATION.to_string(),
                    chrono::Utc::now().timestamp().to_string(),
                );
                let layer = StreamLayer::new(
                    std::io::Cursor::new(content),
                    FILE_LAYER_TYPE,
                    Some(annotations),
                );
                let pusher = ImagePusher::new(
                    &repository,
                    &oci::content_tag(&item.path),
                    FILE_CONFIG_TYPE,
                    config,
                );
                pusher.push_stream(&registry, layer).await?;

                progress.synced_files += 1;
                status.update_sync_status(&progress).await?;
            }
            Ok(())
        }
        .await;

        progress.syncing = false;
        progress.end_time = chrono::Utc::now().timestamp();
        let error = match &outcome {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };
        progress.sync_error = error.clone().unwrap_or_default();
        if let Err(e) = status.update_sync_status(&progress).await {
            warn!("Failed to record sync completion for '{repository}': {e}");
        }
        if let Err(e) = status.sync().await {
            warn!("Failed to push status snapshot for '{repository}': {e}");
        }
        let _ = done_tx.send(error);
    });

    if wait {
        match done_rx.await {
            Ok(None) => Ok(()),
            Ok(Some(error)) => Err(BeskarError::Internal(format!(
                "synchronization failed: {error}"
            ))),
            Err(_) => Err(BeskarError::WaitingInterruption("sync".to_string())),
        }
    } else {
        Ok(())
    }
}
