use beskar::oci::{self, Descriptor, Manifest};
use beskar::plugin::registry::RegistryClient;
use beskar::plugins::mirror::{
    self, DIRECTORY_CONFIG_TYPE, FILE_CONFIG_TYPE, FILE_LAYER_TYPE, INDEX_LAYER_TYPE,
    LINK_ANNOTATION, MirrorProcessor, NoopPlanner, PATH_ANNOTATION, SYMLINK_CONFIG_TYPE,
};
use beskar::repository::event::{Action, Event};
use beskar::repository::handler::Handler;
use beskar::repository::manager::WorkerParams;
use beskar::repository::worker::Worker;
use beskar::state::Properties;
use beskar::storage::{MemoryStore, Store};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const REPO: &str = "artifacts/mirror/test";

fn mirror_manifest(
    config_type: &str,
    layer_type: &str,
    annotations: HashMap<String, String>,
) -> Vec<u8> {
    Manifest {
        schema_version: 2,
        media_type: Some(oci::MANIFEST_MEDIA_TYPE.to_string()),
        config: Descriptor {
            media_type: config_type.to_string(),
            digest: "sha256:cfg".to_string(),
            size: 2,
            annotations: None,
        },
        layers: vec![Descriptor {
            media_type: layer_type.to_string(),
            digest: "sha256:layerblob".to_string(),
            size: 33,
            annotations: Some(annotations),
        }],
        annotations: None,
    }
    .to_json()
    .unwrap()
}

async fn start_worker(
    datadir: &std::path::Path,
) -> Arc<Worker<MirrorProcessor>> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let params = WorkerParams {
        repository: REPO.to_string(),
        dir: datadir.join("repo"),
        prefix: String::new(),
        store,
        registry: Arc::new(RegistryClient::new_pending()),
        remove: Arc::new(|_| {}),
    };
    let worker = Worker::new(params, MirrorProcessor::new(Arc::new(NoopPlanner)));
    worker.clone().start();
    assert!(worker.wait_started().await);
    worker
}

async fn wait_for_entry(worker: &Arc<Worker<MirrorProcessor>>, path: &str) {
    for _ in 0..100 {
        if let Ok(db) = worker.processor().database() {
            if db.file_by_path(path).await.unwrap().is_some() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("entry '{path}' never appeared in the index");
}

#[tokio::test]
async fn test_file_directory_and_symlink_events_index_entries() {
    let datadir = tempfile::tempdir().unwrap();
    let worker = start_worker(datadir.path()).await;

    let file_payload = mirror_manifest(
        FILE_CONFIG_TYPE,
        FILE_LAYER_TYPE,
        [(PATH_ANNOTATION.to_string(), "pool/pkg.rpm".to_string())]
            .into_iter()
            .collect(),
    );
    let dir_payload = mirror_manifest(
        DIRECTORY_CONFIG_TYPE,
        INDEX_LAYER_TYPE,
        [(PATH_ANNOTATION.to_string(), "pool".to_string())]
            .into_iter()
            .collect(),
    );
    let link_payload = mirror_manifest(
        SYMLINK_CONFIG_TYPE,
        FILE_LAYER_TYPE,
        [
            (PATH_ANNOTATION.to_string(), "latest.rpm".to_string()),
            (LINK_ANNOTATION.to_string(), "pool/pkg.rpm".to_string()),
        ]
        .into_iter()
        .collect(),
    );
    for (n, payload) in [file_payload, dir_payload, link_payload].into_iter().enumerate() {
        worker
            .queue_event(
                Event {
                    digest: format!("sha256:{n}"),
                    action: Action::Put,
                    repository: REPO.to_string(),
                    payload,
                },
                true,
            )
            .await
            .unwrap();
    }

    wait_for_entry(&worker, "latest.rpm").await;
    let db = worker.processor().database().unwrap();

    let file = db.file_by_path("pool/pkg.rpm").await.unwrap().unwrap();
    assert!(!file.is_directory());
    assert_eq!(file.reference, "sha256:layerblob");
    assert_eq!(file.size, 33);
    assert_eq!(file.parent, "pool");

    let dir = db.file_by_path("pool").await.unwrap().unwrap();
    assert!(dir.is_directory());

    let link = db.file_by_path("latest.rpm").await.unwrap().unwrap();
    assert!(link.is_symlink());
    assert_eq!(link.link, "pool/pkg.rpm");

    worker.stop().await;
    worker.wait_stopped().await;
}

#[tokio::test]
async fn test_sync_is_idempotent_with_no_upstream_changes() {
    let datadir = tempfile::tempdir().unwrap();
    let worker = start_worker(datadir.path()).await;
    let ctx = worker.context().unwrap();

    ctx.status
        .update_properties(&Properties {
            created: true,
            mirror: true,
            mirror_urls: vec!["https://mirror.example.com/pub".to_string()],
        })
        .await
        .unwrap();

    for round in 0..2 {
        mirror::start_sync(worker.clone(), true).await.unwrap();
        let status = ctx.status.sync_status().await.unwrap();
        assert!(!status.syncing, "round {round}: sync must have finished");
        assert_eq!(
            status.synced_files, status.total_files,
            "round {round}: everything indexed counts as synced"
        );
        assert_eq!(status.sync_error, "", "round {round}");
        assert!(status.end_time >= status.start_time);
    }

    worker.stop().await;
    worker.wait_stopped().await;
}

#[tokio::test]
async fn test_concurrent_sync_is_rejected_while_running() {
    let datadir = tempfile::tempdir().unwrap();
    let worker = start_worker(datadir.path()).await;
    let ctx = worker.context().unwrap();

    // Simulate an in-flight sync through the singleton.
    let mut status = ctx.status.sync_status().await.unwrap();
    status.syncing = true;
    ctx.status.update_sync_status(&status).await.unwrap();

    let err = mirror::start_sync(worker.clone(), false).await.unwrap_err();
    assert!(err.to_string().contains("already running"));

    worker.stop().await;
    worker.wait_stopped().await;
}

#[tokio::test]
async fn test_mirror_repository_naming() {
    assert_eq!(mirror::oci_repository("rocky"), "artifacts/mirror/rocky");
    assert_eq!(
        mirror::oci_repository("artifacts/mirror/rocky"),
        "artifacts/mirror/rocky"
    );
}
