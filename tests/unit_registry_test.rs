use axum::Router;
use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use beskar::core::BeskarError;
use beskar::oci::{self, FileLayer, ImagePusher, Manifest, StreamLayer};
use beskar::plugin::registry::RegistryClient;
use beskar::plugins::staticfile::{FILE_CONFIG_TYPE, FILE_LAYER_TYPE, FILE_NAME_ANNOTATION};
use beskar::repository::event::{Action, Event};
use beskar::repository::handler::Handler;
use beskar::repository::manager::WorkerParams;
use beskar::repository::worker::{Processor, Worker, WorkerContext};
use beskar::storage::MemoryStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// A minimal OCI registry standing in for the real one.
#[derive(Clone, Default)]
struct FakeRegistry {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    manifests: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    deleted: Arc<Mutex<Vec<String>>>,
}

async fn fake_handler(State(registry): State<FakeRegistry>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();
    let body = to_bytes(request.into_body(), usize::MAX).await.unwrap();
    let last = path.rsplit('/').next().unwrap_or("").to_string();

    if method == Method::POST && path.ends_with("/blobs/uploads/") {
        return (StatusCode::ACCEPTED, [("location", "/v2/_upload/session")], "").into_response();
    }
    if method == Method::PUT && path.starts_with("/v2/_upload/") {
        let digest = query
            .split('&')
            .find_map(|kv| kv.strip_prefix("digest="))
            .unwrap_or("")
            .to_string();
        registry.blobs.lock().unwrap().insert(digest, body.to_vec());
        return StatusCode::CREATED.into_response();
    }
    if path.contains("/blobs/") {
        let exists = registry.blobs.lock().unwrap().contains_key(&last);
        return match method {
            Method::HEAD if exists => StatusCode::OK.into_response(),
            Method::GET if exists => {
                let data = registry.blobs.lock().unwrap().get(&last).unwrap().clone();
                (StatusCode::OK, data).into_response()
            }
            _ => StatusCode::NOT_FOUND.into_response(),
        };
    }
    if path.contains("/manifests/") {
        match method {
            Method::PUT => {
                let digest = oci::sha256_digest(&body);
                let mut manifests = registry.manifests.lock().unwrap();
                manifests.insert(last, body.to_vec());
                manifests.insert(digest.clone(), body.to_vec());
                return (StatusCode::CREATED, [("docker-content-digest", digest)], "")
                    .into_response();
            }
            Method::DELETE => {
                registry.deleted.lock().unwrap().push(last.clone());
                return if registry.manifests.lock().unwrap().remove(&last).is_some() {
                    StatusCode::ACCEPTED.into_response()
                } else {
                    StatusCode::NOT_FOUND.into_response()
                };
            }
            _ => return StatusCode::NOT_FOUND.into_response(),
        }
    }
    StatusCode::NOT_FOUND.into_response()
}

async fn start_fake_registry() -> (FakeRegistry, Arc<RegistryClient>) {
    let fake = FakeRegistry::default();
    let app = Router::new()
        .fallback(any(fake_handler))
        .with_state(fake.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = Arc::new(RegistryClient::new_pending());
    client.install_base_url(&format!("http://{addr}"), reqwest::Client::new());
    (fake, client)
}

const REPO: &str = "artifacts/static/test";

#[tokio::test]
async fn test_pending_client_is_unavailable() {
    let client = RegistryClient::new_pending();
    let err = client.delete_manifest(REPO, "sha256:x").await.unwrap_err();
    assert!(matches!(err, BeskarError::Unavailable(_)));
}

#[tokio::test]
async fn test_blob_upload_and_fetch() {
    let (fake, client) = start_fake_registry().await;
    let digest = oci::sha256_digest(b"blob content");

    client
        .upload_blob(REPO, &digest, b"blob content".to_vec().into())
        .await
        .unwrap();
    assert!(fake.blobs.lock().unwrap().contains_key(&digest));

    // Re-uploading short-circuits on the HEAD probe.
    client
        .upload_blob(REPO, &digest, b"blob content".to_vec().into())
        .await
        .unwrap();

    let fetched = client.get_blob(REPO, &digest).await.unwrap();
    assert_eq!(fetched.as_ref(), b"blob content");

    let err = client.get_blob(REPO, "sha256:missing").await.unwrap_err();
    assert!(matches!(err, BeskarError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_manifest_is_idempotent() {
    let (fake, client) = start_fake_registry().await;

    // Deleting a manifest that is already gone counts as success.
    client.delete_manifest(REPO, "sha256:gone").await.unwrap();
    assert_eq!(fake.deleted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_push_file_artifact() {
    let (fake, client) = start_fake_registry().await;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("hello.rpm");
    tokio::fs::write(&file_path, b"rpm bytes").await.unwrap();

    let layer = FileLayer::new(
        &file_path,
        FILE_LAYER_TYPE,
        Some(
            [(FILE_NAME_ANNOTATION.to_string(), "hello.rpm".to_string())]
                .into_iter()
                .collect(),
        ),
    )
    .await
    .unwrap();
    assert_eq!(layer.descriptor().size, 9);
    assert_eq!(layer.descriptor().digest, oci::sha256_digest(b"rpm bytes"));

    let pusher = ImagePusher::new(REPO, "some-tag", FILE_CONFIG_TYPE, b"{}".to_vec());
    let manifest_digest = pusher.push_file(&client, layer).await.unwrap();

    let stored = fake
        .manifests
        .lock()
        .unwrap()
        .get(&manifest_digest)
        .cloned()
        .expect("manifest stored under its digest");
    let manifest = Manifest::parse(&stored).unwrap();
    assert_eq!(manifest.config.media_type, FILE_CONFIG_TYPE);
    assert_eq!(manifest.layers.len(), 1);
    assert_eq!(manifest.layers[0].size, 9);
    assert!(fake
        .blobs
        .lock()
        .unwrap()
        .contains_key(&manifest.layers[0].digest));
}

#[tokio::test]
async fn test_push_stream_artifact() {
    let (fake, client) = start_fake_registry().await;

    let layer = StreamLayer::new(
        b"streamed bytes".as_slice(),
        FILE_LAYER_TYPE,
        None,
    );
    let pusher = ImagePusher::new(REPO, "stream-tag", FILE_CONFIG_TYPE, b"{}".to_vec());
    let manifest_digest = pusher.push_stream(&client, layer).await.unwrap();

    let stored = fake
        .manifests
        .lock()
        .unwrap()
        .get(&manifest_digest)
        .cloned()
        .unwrap();
    let manifest = Manifest::parse(&stored).unwrap();
    assert_eq!(manifest.layers[0].digest, oci::sha256_digest(b"streamed bytes"));
    assert_eq!(manifest.layers[0].size, 14);
}

/// A processor that cannot absorb puts; the worker must undo the push.
struct FailingProcessor;

#[async_trait]
impl Processor for FailingProcessor {
    async fn start(&self, _ctx: &WorkerContext) -> Result<(), BeskarError> {
        Ok(())
    }

    async fn process_manifest(
        &self,
        _ctx: &WorkerContext,
        _event: &Event,
        _manifest: &Manifest,
    ) -> Result<(), BeskarError> {
        Err(BeskarError::Internal("index write failed".to_string()))
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
async fn test_put_failure_issues_compensating_delete_and_keeps_event() {
    let (fake, client) = start_fake_registry().await;

    let datadir = tempfile::tempdir().unwrap();
    let params = WorkerParams {
        repository: REPO.to_string(),
        dir: datadir.path().join("repo"),
        prefix: String::new(),
        store: Arc::new(MemoryStore::new()),
        registry: client,
        remove: Arc::new(|_| {}),
    };
    let worker = Worker::new(params, FailingProcessor);
    worker.clone().start();
    assert!(worker.wait_started().await);

    let manifest = Manifest {
        schema_version: 2,
        media_type: Some(oci::MANIFEST_MEDIA_TYPE.to_string()),
        config: beskar::oci::Descriptor {
            media_type: FILE_CONFIG_TYPE.to_string(),
            digest: "sha256:cfg".to_string(),
            size: 2,
            annotations: None,
        },
        layers: vec![],
        annotations: None,
    };
    let event = Event {
        digest: "sha256:doomed".to_string(),
        action: Action::Put,
        repository: REPO.to_string(),
        payload: manifest.to_json().unwrap(),
    };
    worker.queue_event(event.clone(), true).await.unwrap();

    // The failed put is undone in the registry...
    for _ in 0..100 {
        if fake
            .deleted
            .lock()
            .unwrap()
            .contains(&"sha256:doomed".to_string())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(fake
        .deleted
        .lock()
        .unwrap()
        .contains(&"sha256:doomed".to_string()));

    // ...and the durable row stays for retry on next start.
    let ctx = worker.context().unwrap();
    let events = ctx.status.events(REPO).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id(), event.id());

    worker.stop().await;
    worker.wait_stopped().await;
}
