// src/plugins/staticfile/mod.rs

//! The static-file plugin: opaque files stored as OCI artifacts, indexed
//! per repository.

use crate::config::Config;
use crate::core::BeskarError;
use crate::oci::{self, Manifest};
use crate::plugin::server::{PluginContext, PluginRuntime};
use crate::plugin::{Descriptor, PolicyBundle};
use crate::repository::event::Event;
use crate::repository::manager::RepositoryManager;
use crate::repository::worker::{Processor, Worker, WorkerContext};
use async_trait::async_trait;
use axum::Router;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

pub mod api;
pub mod db;

pub use db::{RepositoryFile, StaticDatabase};

pub const PLUGIN_NAME: &str = "static";
pub const API_PREFIX: &str = "/artifacts/static/api/v1";
pub const REPOSITORY_PREFIX: &str = "artifacts/static";

pub const FILE_CONFIG_TYPE: &str = "application/vnd.ciq.static.file.v1.config+json";
pub const FILE_LAYER_TYPE: &str = "application/vnd.ciq.static.v1.file";
pub const FILE_NAME_ANNOTATION: &str = "com.ciq.static.v1.file.name";

/// Routing policy the registry loads for this plugin.
const ROUTING_POLICY: &str = r#"package static

default output = {"found": false}

output = obj {
    some repo
    startswith(input.path, "/artifacts/static/")
    repo := trim_prefix(input.path, "/artifacts/static/")
    obj := {"repository": concat("/", ["artifacts/static", repo]), "found": true}
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
        mediatypes: vec![FILE_CONFIG_TYPE.to_string()],
        policy: PolicyBundle {
            rego: ROUTING_POLICY.as_bytes().to_vec(),
            data: b"{}".to_vec(),
        },
    }
}

/// Wires the static plugin: manager, worker factory, and API router.
pub fn build(
    ctx: &PluginContext,
) -> Result<PluginRuntime<Worker<StaticProcessor>>, BeskarError> {
    let manager = RepositoryManager::new(
        PathBuf::from(&ctx.config.datadir),
        ctx.config.storage.prefix.clone(),
        ctx.store.clone(),
        ctx.registry.clone(),
        |params| Worker::new(params, StaticProcessor::new()),
    );
    let api_router = api::router(manager.clone(), ctx.registry.clone());
    Ok(PluginRuntime {
        manager,
        api_router,
        web_router: Router::new(),
    })
}

/// Convenience used by the binary: descriptor plus builder.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    crate::plugin::serve(config, descriptor(), build).await
}

/// Per-kind event handling for static files.
pub struct StaticProcessor {
    db: RwLock<Option<StaticDatabase>>,
}

impl StaticProcessor {
    pub fn new() -> Self {
        Self {
            db: RwLock::new(None),
        }
    }

    /// The open repository database; unavailable outside start/stop.
    pub fn database(&self) -> Result<StaticDatabase, BeskarError> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| BeskarError::Unavailable("repository database not open".to_string()))
    }

    fn file_from_manifest(manifest: &Manifest) -> Result<(String, i64), BeskarError> {
        let layer = oci::get_layer(manifest, FILE_LAYER_TYPE)
            .or_else(|| {
                oci::get_layer_filter(manifest, |mt| {
                    mt.starts_with("application/vnd.ciq.static.")
                })
            })
            .ok_or_else(|| {
                BeskarError::InvalidArgument("manifest carries no static file layer".to_string())
            })?;
        let name = layer
            .annotation(FILE_NAME_ANNOTATION)
            .ok_or_else(|| {
                BeskarError::InvalidArgument("file layer carries no name annotation".to_string())
            })?
            .to_string();
        Ok((name, layer.size))
    }
}

impl Default for StaticProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for StaticProcessor {
    async fn start(&self, ctx: &WorkerContext) -> Result<(), BeskarError> {
        let db = StaticDatabase::open(
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
        event: &Event,
        manifest: &Manifest,
    ) -> Result<(), BeskarError> {
        if manifest.config.media_type != FILE_CONFIG_TYPE {
            return Err(BeskarError::InvalidArgument(format!(
                "unexpected config media type '{}'",
                manifest.config.media_type
            )));
        }
        let (name, size) = Self::file_from_manifest(manifest)?;
        let db = self.database()?;
        db.add_file(&RepositoryFile {
            tag: oci::content_tag(&name),
            name,
            digest: event.digest.clone(),
            size,
            created: chrono::Utc::now().timestamp(),
        })
        .await?;

        // The local index is authoritative; a failed push to object storage
        // is caught up by the next sync.
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
        let Ok((name, _)) = Self::file_from_manifest(manifest) else {
            // Nothing indexed for a manifest without a file layer.
            return Ok(());
        };
        let db = self.database()?;
        db.remove_file(&oci::content_tag(&name)).await?;
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
        Self::file_from_manifest(manifest).ok().map(|(name, _)| name)
    }
}
