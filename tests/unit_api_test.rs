use beskar::oci::{self, Descriptor, Manifest};
use beskar::plugin::registry::RegistryClient;
use beskar::plugins::staticfile::{
    self, FILE_CONFIG_TYPE, FILE_LAYER_TYPE, FILE_NAME_ANNOTATION, StaticProcessor,
};
use beskar::repository::event::{Action, Event};
use beskar::repository::handler::Handler;
use beskar::repository::manager::RepositoryManager;
use beskar::repository::worker::Worker;
use beskar::storage::{MemoryStore, Store};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const REPO: &str = "artifacts/static/myrepo";

fn put_event(name: &str, size: i64) -> Event {
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
    Event {
        digest: oci::sha256_digest(&payload),
        action: Action::Put,
        repository: REPO.to_string(),
        payload,
    }
}

async fn start_api() -> (SocketAddr, Arc<RepositoryManager<Worker<StaticProcessor>>>) {
    let datadir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let registry = Arc::new(RegistryClient::new_pending());
    let manager = RepositoryManager::new(
        datadir.path().to_path_buf(),
        String::new(),
        store,
        registry.clone(),
        |params| Worker::new(params, StaticProcessor::new()),
    );
    std::mem::forget(datadir);

    let app = staticfile::api::router(manager.clone(), registry);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, manager)
}

async fn index_file(manager: &Arc<RepositoryManager<Worker<StaticProcessor>>>, name: &str) {
    let worker = manager.get(REPO).await.unwrap();
    worker.queue_event(put_event(name, 42), true).await.unwrap();
    for _ in 0..100 {
        if let Ok(db) = worker.processor().database() {
            if db
                .file(&oci::content_tag(name))
                .await
                .unwrap()
                .is_some()
            {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("file '{name}' never indexed");
}

#[tokio::test]
async fn test_list_and_get_repository_files() {
    let (addr, manager) = start_api().await;
    index_file(&manager, "hello.rpm").await;

    let client = reqwest::Client::new();
    let base = format!("http://{addr}/artifacts/static/api/v1");

    let files: Vec<serde_json::Value> = client
        .post(format!("{base}/repository/files"))
        .json(&json!({ "repository": "myrepo" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["name"], "hello.rpm");
    assert_eq!(files[0]["size"], 42);

    let response = client
        .post(format!("{base}/repository/file"))
        .json(&json!({ "repository": "myrepo", "file": "hello.rpm" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // A file that is not indexed maps to not-found.
    let response = client
        .post(format!("{base}/repository/file"))
        .json(&json!({ "repository": "myrepo", "file": "missing.rpm" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    manager.stop_all().await;
}

#[tokio::test]
async fn test_remove_repository_with_files_needs_preflight() {
    let (addr, manager) = start_api().await;
    index_file(&manager, "hello.rpm").await;

    let client = reqwest::Client::new();
    let base = format!("http://{addr}/artifacts/static/api/v1");

    // Removing a repository that still has files without the delete_files
    // flag is a failed precondition.
    let response = client
        .post(format!("{base}/repository/remove"))
        .json(&json!({ "repository": "myrepo", "delete_files": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("delete_files"));

    manager.stop_all().await;
}

#[tokio::test]
async fn test_invalid_repository_name_rejected() {
    let (addr, manager) = start_api().await;

    let client = reqwest::Client::new();
    let base = format!("http://{addr}/artifacts/static/api/v1");
    let response = client
        .post(format!("{base}/repository/files"))
        .json(&json!({ "repository": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    manager.stop_all().await;
}
