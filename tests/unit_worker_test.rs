use beskar::core::BeskarError;
use beskar::oci::{self, Descriptor, Manifest};
use beskar::plugin::registry::RegistryClient;
use beskar::plugins::staticfile::{
    self, FILE_CONFIG_TYPE, FILE_LAYER_TYPE, FILE_NAME_ANNOTATION, StaticProcessor,
};
use beskar::repository::event::{Action, Event};
use beskar::repository::handler::Handler;
use beskar::repository::manager::{RepositoryManager, WorkerParams};
use beskar::repository::worker::{Processor, Worker, WorkerContext};
use beskar::state::StatusDatabase;
use beskar::storage::{MemoryStore, Store};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const REPO: &str = "artifacts/static/test";

fn static_manifest(name: &str, size: i64) -> (Vec<u8>, String) {
    let manifest = Manifest {
        schema_version: 2,
        media_type: Some(oci::MANIFEST_MEDIA_TYPE.to_string()),
        config: Descriptor {
            media_type: FILE_CONFIG_TYPE.to_string(),
            digest: oci::sha256_digest(name.as_bytes()),
            size: 2,
            annotations: None,
        },
        layers: vec![Descriptor {
            media_type: FILE_LAYER_TYPE.to_string(),
            digest: format!("sha256:{}", oci::content_tag(name)),
            size,
            annotations: Some(
                [(FILE_NAME_ANNOTATION.to_string(), name.to_string())]
                    .into_iter()
                    .collect(),
            ),
        }],
        annotations: None,
    };
    let payload = manifest.to_json().unwrap();
    let digest = oci::sha256_digest(&payload);
    (payload, digest)
}

fn put_event(name: &str, size: i64) -> Event {
    let (payload, digest) = static_manifest(name, size);
    Event {
        digest,
        action: Action::Put,
        repository: REPO.to_string(),
        payload,
    }
}

fn new_manager(
    datadir: PathBuf,
    store: Arc<dyn Store>,
) -> Arc<RepositoryManager<Worker<StaticProcessor>>> {
    RepositoryManager::new(
        datadir,
        String::new(),
        store,
        Arc::new(RegistryClient::new_pending()),
        |params| Worker::new(params, StaticProcessor::new()),
    )
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_put_event_indexes_file() {
    let datadir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let manager = new_manager(datadir.path().to_path_buf(), store.clone());

    let worker = manager.get(REPO).await.unwrap();
    worker
        .queue_event(put_event("hello.rpm", 42), true)
        .await
        .unwrap();

    let probe = worker.clone();
    wait_for("file to be indexed", move || {
        let probe = probe.clone();
        async move {
            match probe.processor().database() {
                Ok(db) => db
                    .files()
                    .await
                    .map(|files| files.iter().any(|f| f.name == "hello.rpm" && f.size == 42))
                    .unwrap_or(false),
                Err(_) => false,
            }
        }
    })
    .await;

    // The durable inbox drains once side-effects landed.
    let ctx = worker.context().unwrap();
    wait_for("durable inbox to drain", move || {
        let ctx = ctx.clone();
        async move { ctx.status.events(REPO).await.unwrap().is_empty() }
    })
    .await;

    manager.stop_all().await;
}

#[tokio::test]
async fn test_put_event_is_idempotent() {
    let datadir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let manager = new_manager(datadir.path().to_path_buf(), store);

    let worker = manager.get(REPO).await.unwrap();
    let event = put_event("hello.rpm", 42);
    worker.queue_event(event.clone(), true).await.unwrap();

    let probe = worker.clone();
    wait_for("first pass to index the file", move || {
        let probe = probe.clone();
        async move {
            probe
                .processor()
                .database()
                .unwrap()
                .files()
                .await
                .map(|f| f.len() == 1)
                .unwrap_or(false)
        }
    })
    .await;

    // Re-delivering the same event is a no-op conflict update.
    worker.queue_event(event, true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let files = worker.processor().database().unwrap().files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "hello.rpm");
    assert_eq!(files[0].size, 42);

    manager.stop_all().await;
}

#[tokio::test]
async fn test_malformed_event_is_dropped() {
    let datadir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let manager = new_manager(datadir.path().to_path_buf(), store);

    let worker = manager.get(REPO).await.unwrap();
    worker
        .queue_event(
            Event {
                digest: "sha256:broken".to_string(),
                action: Action::Put,
                repository: REPO.to_string(),
                payload: b"this is not a manifest".to_vec(),
            },
            true,
        )
        .await
        .unwrap();

    // The malformed row is removed, never retried, and nothing is indexed.
    let ctx = worker.context().unwrap();
    wait_for("malformed event to be dropped", move || {
        let ctx = ctx.clone();
        async move { ctx.status.events(REPO).await.unwrap().is_empty() }
    })
    .await;
    assert!(worker.processor().database().unwrap().files().await.unwrap().is_empty());
    assert!(!worker.stopped());

    manager.stop_all().await;
}

#[tokio::test]
async fn test_replay_after_restart() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    // A prior process durably recorded the event and pushed the status
    // database, then died before processing it.
    let staging = tempfile::tempdir().unwrap();
    let status = StatusDatabase::open(store.clone(), "", REPO, staging.path())
        .await
        .unwrap();
    status.put_event(&put_event("hello.rpm", 42)).await.unwrap();
    status.sync().await.unwrap();
    status.close(true).await.unwrap();

    // A fresh process pulls the blob, replays the inbox, and converges to
    // the same state as if no crash had happened.
    let datadir = tempfile::tempdir().unwrap();
    let manager = new_manager(datadir.path().to_path_buf(), store);
    let worker = manager.get(REPO).await.unwrap();

    let probe = worker.clone();
    wait_for("replayed event to be processed", move || {
        let probe = probe.clone();
        async move {
            probe
                .processor()
                .database()
                .unwrap()
                .files()
                .await
                .map(|files| files.iter().any(|f| f.name == "hello.rpm" && f.size == 42))
                .unwrap_or(false)
        }
    })
    .await;

    manager.stop_all().await;
}

#[tokio::test]
async fn test_sync_artifact_timeout_and_interruption() {
    let datadir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let manager = new_manager(datadir.path().to_path_buf(), store);
    let worker = manager.get(REPO).await.unwrap();

    let err = worker
        .sync_artifact("never-arrives.rpm", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, BeskarError::WaitingTimeout(_)));

    let waiter = {
        let worker = worker.clone();
        tokio::spawn(async move {
            worker
                .sync_artifact("interrupted.rpm", Duration::from_secs(30))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    worker.stop().await;

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, BeskarError::WaitingInterruption(_)));

    manager.stop_all().await;
}

#[tokio::test]
async fn test_sync_artifact_settled_by_processing() {
    let datadir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let manager = new_manager(datadir.path().to_path_buf(), store);
    let worker = manager.get(REPO).await.unwrap();

    let waiter = {
        let worker = worker.clone();
        tokio::spawn(async move {
            worker
                .sync_artifact("hello.rpm", Duration::from_secs(10))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    worker
        .queue_event(put_event("hello.rpm", 42), true)
        .await
        .unwrap();
    waiter.await.unwrap().unwrap();

    manager.stop_all().await;
}

/// Records processing order; used for the FIFO property.
struct RecordingProcessor {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn start(&self, _ctx: &WorkerContext) -> Result<(), BeskarError> {
        Ok(())
    }

    async fn process_manifest(
        &self,
        _ctx: &WorkerContext,
        event: &Event,
        _manifest: &Manifest,
    ) -> Result<(), BeskarError> {
        self.seen.lock().unwrap().push(event.digest.clone());
        Ok(())
    }

    async fn delete_manifest(
        &self,
        _ctx: &WorkerContext,
        _event: &Event,
        _manifest: &Manifest,
    ) -> Result<(), BeskarError> {
        Ok(())
    }

    async fn stop(&self, _ctx: &WorkerContext) {}

    fn artifact_name(&self, _manifest: &Manifest) -> Option<String> {
        None
    }
}

#[tokio::test]
async fn test_events_process_in_fifo_order() {
    let datadir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let params = WorkerParams {
        repository: REPO.to_string(),
        dir: datadir.path().join("repo"),
        prefix: String::new(),
        store,
        registry: Arc::new(RegistryClient::new_pending()),
        remove: Arc::new(|_| {}),
    };
    let worker = Worker::new(
        params,
        RecordingProcessor { seen: seen.clone() },
    );
    worker.clone().start();
    assert!(worker.wait_started().await);

    let mut expected = Vec::new();
    for n in 0..20 {
        let (payload, _) = static_manifest(&format!("file-{n:02}.rpm"), n);
        let digest = format!("sha256:event-{n:02}");
        expected.push(digest.clone());
        worker
            .queue_event(
                Event {
                    digest,
                    action: Action::Put,
                    repository: REPO.to_string(),
                    payload,
                },
                true,
            )
            .await
            .unwrap();
    }

    let probe = seen.clone();
    wait_for("all events to be processed", move || {
        let probe = probe.clone();
        async move { probe.lock().unwrap().len() == 20 }
    })
    .await;
    assert_eq!(*seen.lock().unwrap(), expected);

    worker.stop().await;
    worker.wait_stopped().await;
}

#[tokio::test]
async fn test_stop_event_stops_worker() {
    let datadir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let manager = new_manager(datadir.path().to_path_buf(), store);
    let worker = manager.get(REPO).await.unwrap();

    let (payload, digest) = static_manifest("any.rpm", 1);
    worker
        .queue_event(
            Event {
                digest,
                action: Action::Stop,
                repository: REPO.to_string(),
                payload,
            },
            true,
        )
        .await
        .unwrap();

    let probe = worker.clone();
    wait_for("worker to stop", move || {
        let probe = probe.clone();
        async move { probe.stopped() }
    })
    .await;
    worker.wait_stopped().await;
}

#[tokio::test]
async fn test_static_plugin_repository_naming() {
    assert_eq!(staticfile::oci_repository("myrepo"), "artifacts/static/myrepo");
    assert_eq!(
        staticfile::oci_repository("artifacts/static/myrepo"),
        "artifacts/static/myrepo"
    );
}
