// src/repository/worker.rs

//! The per-repository worker: owns the event queue and the repository's
//! state, and processes events with at-most-one-concurrent execution inside
//! the repository.

use crate::core::{BeskarError, metrics};
use crate::oci::Manifest;
use crate::plugin::registry::RegistryClient;
use crate::repository::event::{Action, Event};
use crate::repository::handler::{Handler, HandlerState};
use crate::repository::manager::{RemoveFn, WorkerParams};
use crate::repository::queue::EventQueue;
use crate::state::{LogDatabase, StatusDatabase};
use crate::storage::Store;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// The per-kind event handling a plugin supplies. Dispatch by OCI config
/// media type happens inside the implementations.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Opens plugin-specific state. Runs during worker start; a failure here
    /// fails the whole start.
    async fn start(&self, ctx: &WorkerContext) -> Result<(), BeskarError>;

    /// Handles a manifest put. The event carries the manifest digest the
    /// registry assigned.
    async fn process_manifest(
        &self,
        ctx: &WorkerContext,
        event: &Event,
        manifest: &Manifest,
    ) -> Result<(), BeskarError>;

    /// Handles a manifest delete.
    async fn delete_manifest(
        &self,
        ctx: &WorkerContext,
        event: &Event,
        manifest: &Manifest,
    ) -> Result<(), BeskarError>;

    /// Closes plugin-specific state. Runs during worker teardown.
    async fn stop(&self, ctx: &WorkerContext);

    /// The artifact name a manifest refers to, used to settle the
    /// sync-artifact barrier once the corresponding event finishes.
    fn artifact_name(&self, manifest: &Manifest) -> Option<String>;
}

/// Shared state handed to the processor and to API handlers.
pub struct WorkerContext {
    pub repository: String,
    pub dir: PathBuf,
    pub prefix: String,
    pub store: Arc<dyn Store>,
    pub registry: Arc<RegistryClient>,
    pub status: StatusDatabase,
    pub log: LogDatabase,
    shutdown: broadcast::Sender<()>,
}

impl WorkerContext {
    /// A receiver that fires when the worker is being stopped; the context
    /// event handlers run under.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}

type PendingMap = Mutex<HashMap<String, Vec<oneshot::Sender<Result<(), BeskarError>>>>>;

/// The generic repository worker. Plugins instantiate it with their
/// [`Processor`] and hand the resulting factory to the manager.
pub struct Worker<P: Processor> {
    repository: String,
    dir: PathBuf,
    prefix: String,
    store: Arc<dyn Store>,
    registry: Arc<RegistryClient>,
    processor: P,
    queue: EventQueue,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    state_tx: watch::Sender<HandlerState>,
    done_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    context: RwLock<Option<Arc<WorkerContext>>>,
    pending: PendingMap,
    remove: RemoveFn,
}

impl<P: Processor> Worker<P> {
    pub fn new(params: WorkerParams, processor: P) -> Arc<Self> {
        let (queue, wake_rx) = EventQueue::new();
        let (state_tx, _) = watch::channel(HandlerState::Starting);
        let (done_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            repository: params.repository,
            dir: params.dir,
            prefix: params.prefix,
            store: params.store,
            registry: params.registry,
            processor,
            queue,
            wake_rx: Mutex::new(Some(wake_rx)),
            state_tx,
            done_tx,
            stopped: AtomicBool::new(false),
            shutdown_tx,
            context: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            remove: params.remove,
        })
    }

    /// The worker context, available once the worker is running.
    pub fn context(&self) -> Option<Arc<WorkerContext>> {
        self.context.read().clone()
    }

    /// The plugin-supplied processor, for API handlers that reach into
    /// plugin-specific state.
    pub fn processor(&self) -> &P {
        &self.processor
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Registers `name` in the pending map and waits until the processor
    /// finishes an event referring to it. A deadline expiry is a waiting
    /// timeout; a worker stop is a waiting interruption. The two are
    /// distinct failures.
    pub async fn sync_artifact(&self, name: &str, timeout: Duration) -> Result<(), BeskarError> {
        if self.is_stopped() {
            return Err(BeskarError::Unavailable(format!(
                "worker for repository '{}' is stopped",
                self.repository
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(tx);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            result = rx => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(BeskarError::WaitingInterruption(name.to_string())),
            },
            _ = tokio::time::sleep(timeout) => Err(BeskarError::WaitingTimeout(name.to_string())),
            _ = shutdown_rx.recv() => Err(BeskarError::WaitingInterruption(name.to_string())),
        }
    }

    /// Publishes an event outcome to every waiter registered for `name`.
    fn publish_artifact(&self, name: &str, outcome: Result<(), BeskarError>) {
        let waiters = self.pending.lock().remove(name);
        if let Some(waiters) = waiters {
            for tx in waiters {
                let _ = tx.send(outcome.clone());
            }
        }
    }

    /// Closes all outstanding sync-artifact channels, unblocking waiters.
    fn reset_pending(&self) {
        self.pending.lock().clear();
    }

    /// Enqueues an event bypassing durability, used for replay at start.
    fn enqueue_replayed(&self, event: Event) {
        self.queue.push(event);
    }

    async fn run(self: Arc<Self>) {
        let started: Result<Arc<WorkerContext>, BeskarError> = async {
            let status =
                StatusDatabase::open(self.store.clone(), &self.prefix, &self.repository, &self.dir)
                    .await?;
            let log =
                LogDatabase::open(self.store.clone(), &self.prefix, &self.repository, &self.dir)
                    .await?;
            let ctx = Arc::new(WorkerContext {
                repository: self.repository.clone(),
                dir: self.dir.clone(),
                prefix: self.prefix.clone(),
                store: self.store.clone(),
                registry: self.registry.clone(),
                status,
                log,
                shutdown: self.shutdown_tx.clone(),
            });
            self.processor.start(&ctx).await?;

            // Replay the durable inbox before normal operation resumes.
            let backlog = ctx.status.events(&self.repository).await?;
            if !backlog.is_empty() {
                info!(
                    "Replaying {} durable event(s) for repository '{}'.",
                    backlog.len(),
                    self.repository
                );
            }
            for event in backlog {
                self.enqueue_replayed(event);
            }
            Ok(ctx)
        }
        .await;

        let ctx = match started {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(
                    "Worker for repository '{}' failed to start: {e}",
                    self.repository
                );
                self.stopped.store(true, Ordering::SeqCst);
                self.finish(None).await;
                return;
            }
        };

        // Subscribe before the stopped check so a stop landing in between is
        // seen either through the flag or through the broadcast.
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.is_stopped() {
            // Stopped while starting; never report running.
            self.finish(Some(ctx)).await;
            return;
        }

        *self.context.write() = Some(ctx.clone());
        self.state_tx.send_replace(HandlerState::Running);
        info!("Worker for repository '{}' started.", self.repository);

        let mut wake_rx = self
            .wake_rx
            .lock()
            .take()
            .expect("worker run loop entered twice");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                wake = wake_rx.recv() => {
                    if wake.is_none() {
                        break;
                    }
                    for event in self.queue.drain() {
                        if self.is_stopped() {
                            break;
                        }
                        self.process_one(&ctx, event).await;
                    }
                    // Events that arrived mid-pass re-armed the wake slot
                    // themselves; nothing else to do here.
                }
            }
        }

        self.finish(Some(ctx)).await;
    }

    /// Processes a single event. Failures leave the durable row in place
    /// for retry on next start; only malformed manifests are dropped.
    async fn process_one(&self, ctx: &Arc<WorkerContext>, event: Event) {
        let timer = metrics::EVENT_PROCESSING_SECONDS.start_timer();
        let id = event.id();

        let manifest = match Manifest::parse(&event.payload) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Dropping malformed event {id}: {e}");
                if let Err(le) = ctx
                    .log
                    .add_log("error", &format!("dropped malformed event {id}: {e}"))
                    .await
                {
                    warn!("Failed to write log record: {le}");
                }
                // Retry cannot help a parse failure; remove the row.
                if let Err(de) = ctx.status.remove_event(&id).await {
                    warn!("Failed to remove malformed event {id}: {de}");
                }
                metrics::EVENTS_DROPPED_TOTAL.inc();
                timer.observe_duration();
                return;
            }
        };

        let artifact = self.processor.artifact_name(&manifest);

        let result = match event.action {
            Action::Put => {
                let result = self.processor.process_manifest(ctx, &event, &manifest).await;
                if result.is_err() {
                    // Keep the registry consistent with the index: undo the
                    // push we could not absorb.
                    if let Err(de) = ctx
                        .registry
                        .delete_manifest(&event.repository, &event.digest)
                        .await
                    {
                        warn!("Failed to delete manifest {} after processing failure: {de}", event.digest);
                    }
                }
                result
            }
            Action::Delete => self.processor.delete_manifest(ctx, &event, &manifest).await,
            Action::Start => Ok(()),
            Action::Stop => {
                Handler::stop(self).await;
                Ok(())
            }
        };

        match &result {
            Ok(()) => {
                if let Err(e) = ctx.status.remove_event(&id).await {
                    warn!("Failed to remove processed event {id}: {e}");
                }
                if let Err(e) = ctx.status.sync().await {
                    warn!("Failed to sync status database for '{}': {e}", self.repository);
                    if let Err(le) = ctx
                        .log
                        .add_log("warn", &format!("status sync failed: {e}"))
                        .await
                    {
                        debug!("Failed to write log record: {le}");
                    }
                }
                metrics::EVENTS_PROCESSED_TOTAL
                    .with_label_values(&[event.action.as_str()])
                    .inc();
            }
            Err(e) => {
                metrics::EVENTS_FAILED_TOTAL.inc();
                if let Err(le) = ctx
                    .log
                    .add_log("error", &format!("failed to process event {id}: {e}"))
                    .await
                {
                    warn!("Failed to write log record: {le}");
                }
            }
        }

        if let Some(name) = artifact {
            self.publish_artifact(&name, result);
        }
        timer.observe_duration();
    }

    /// Tears the worker down: plugin state, databases, manager entry, and
    /// the local working directory.
    async fn finish(&self, ctx: Option<Arc<WorkerContext>>) {
        self.state_tx.send_replace(HandlerState::Stopped);
        self.reset_pending();

        if let Some(ctx) = ctx {
            self.processor.stop(&ctx).await;
            if let Err(e) = ctx.status.close(true).await {
                warn!("Failed to close status database for '{}': {e}", self.repository);
            }
            if let Err(e) = ctx.log.close(true).await {
                warn!("Failed to close log database for '{}': {e}", self.repository);
            }
        }
        *self.context.write() = None;

        (self.remove)(&self.repository);

        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove working directory for '{}': {e}", self.repository),
        }

        info!("Worker for repository '{}' stopped.", self.repository);
        self.done_tx.send_replace(true);
    }
}

#[async_trait]
impl<P: Processor> Handler for Worker<P> {
    fn repository(&self) -> &str {
        &self.repository
    }

    fn start(self: Arc<Self>) {
        tokio::spawn(self.run());
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Stopping worker for repository '{}'.", self.repository);
        self.state_tx.send_replace(HandlerState::Stopped);
        let _ = self.shutdown_tx.send(());
    }

    fn state(&self) -> HandlerState {
        *self.state_tx.borrow()
    }

    async fn wait_started(&self) -> bool {
        let mut rx = self.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                HandlerState::Running => return true,
                HandlerState::Stopped => return false,
                HandlerState::Starting => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    async fn wait_stopped(&self) {
        let mut rx = self.done_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn queue_event(&self, event: Event, durable: bool) -> Result<(), BeskarError> {
        if self.is_stopped() {
            return Err(BeskarError::Unavailable(format!(
                "worker for repository '{}' is stopped",
                self.repository
            )));
        }
        if durable {
            let ctx = self.context().ok_or_else(|| {
                BeskarError::Unavailable(format!(
                    "worker for repository '{}' is not started",
                    self.repository
                ))
            })?;
            ctx.status.put_event(&event).await?;
        }
        self.queue.push(event);
        Ok(())
    }
}
