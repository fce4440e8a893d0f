// src/repository/manager.rs

//! Resolves repository names to running workers, lazily spawning them.

use crate::core::{BeskarError, metrics};
use crate::plugin::registry::RegistryClient;
use crate::repository::handler::Handler;
use crate::storage::Store;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Callback a worker uses to remove itself from the manager when its
/// cleanup begins. Closes the worker↔manager ownership cycle without a
/// back-reference.
pub type RemoveFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything a worker needs at construction time.
pub struct WorkerParams {
    pub repository: String,
    /// Local working directory for this repository's SQLite files.
    pub dir: PathBuf,
    /// Object-storage key prefix.
    pub prefix: String,
    pub store: Arc<dyn Store>,
    pub registry: Arc<RegistryClient>,
    pub remove: RemoveFn,
}

type HandlerMap<H> = Arc<Mutex<HashMap<String, Arc<H>>>>;

/// The repository manager. Generic in the handler capability; each plugin
/// supplies a factory producing its concrete worker type.
pub struct RepositoryManager<H: Handler> {
    handlers: HandlerMap<H>,
    factory: Box<dyn Fn(WorkerParams) -> Arc<H> + Send + Sync>,
    datadir: PathBuf,
    prefix: String,
    store: Arc<dyn Store>,
    registry: Arc<RegistryClient>,
    remove: RemoveFn,
}

impl<H: Handler> RepositoryManager<H> {
    pub fn new(
        datadir: PathBuf,
        prefix: String,
        store: Arc<dyn Store>,
        registry: Arc<RegistryClient>,
        factory: impl Fn(WorkerParams) -> Arc<H> + Send + Sync + 'static,
    ) -> Arc<Self> {
        let handlers: HandlerMap<H> = Arc::new(Mutex::new(HashMap::new()));
        let remove: RemoveFn = {
            let handlers = handlers.clone();
            Arc::new(move |repository: &str| {
                let mut map = handlers.lock();
                // Only a stopped worker removes itself; a fresh worker that
                // already took the slot stays.
                if map.get(repository).map(|h| h.stopped()).unwrap_or(false) {
                    map.remove(repository);
                    metrics::LIVE_WORKERS.dec();
                    debug!("Removed worker for repository '{repository}'.");
                }
            })
        };

        Arc::new(Self {
            handlers,
            factory: Box::new(factory),
            datadir,
            prefix,
            store,
            registry,
            remove,
        })
    }

    /// Returns the running worker for `repository`, spawning one if needed.
    /// A worker that already transitioned to stopped counts as absent.
    pub async fn get(&self, repository: &str) -> Result<Arc<H>, BeskarError> {
        loop {
            let existing = self.handlers.lock().get(repository).cloned();
            if let Some(handler) = existing {
                if handler.wait_started().await {
                    return Ok(handler);
                }
                // Stopped under us: clear the stale entry (if still ours)
                // and spawn fresh.
                let mut map = self.handlers.lock();
                if let Some(current) = map.get(repository) {
                    if Arc::ptr_eq(current, &handler) {
                        map.remove(repository);
                        metrics::LIVE_WORKERS.dec();
                    }
                }
                continue;
            }

            let params = WorkerParams {
                repository: repository.to_string(),
                dir: self.datadir.join(repository.trim_matches('/')),
                prefix: self.prefix.clone(),
                store: self.store.clone(),
                registry: self.registry.clone(),
                remove: self.remove.clone(),
            };
            let handler = (self.factory)(params);
            {
                let mut map = self.handlers.lock();
                if map.contains_key(repository) {
                    // Lost the race to a concurrent spawn; retry with theirs.
                    continue;
                }
                map.insert(repository.to_string(), handler.clone());
                metrics::LIVE_WORKERS.inc();
            }
            handler.clone().start();

            if handler.wait_started().await {
                return Ok(handler);
            }
            return Err(BeskarError::Unavailable(format!(
                "worker for repository '{repository}' failed to start"
            )));
        }
    }

    /// Reports presence without starting anything.
    pub fn has(&self, repository: &str) -> bool {
        self.handlers
            .lock()
            .get(repository)
            .map(|h| !h.stopped())
            .unwrap_or(false)
    }

    /// Snapshot of all live handlers, used for shutdown fan-out.
    pub fn get_all(&self) -> Vec<Arc<H>> {
        self.handlers.lock().values().cloned().collect()
    }

    /// Stops every worker in parallel and waits for their cleanup to finish.
    pub async fn stop_all(&self) {
        let handlers = self.get_all();
        let mut tasks = tokio::task::JoinSet::new();
        for handler in handlers {
            tasks.spawn(async move {
                handler.stop().await;
                handler.wait_stopped().await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}
