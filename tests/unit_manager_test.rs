use beskar::plugin::registry::RegistryClient;
use beskar::plugins::staticfile::StaticProcessor;
use beskar::repository::handler::Handler;
use beskar::repository::manager::RepositoryManager;
use beskar::repository::worker::Worker;
use beskar::storage::{MemoryStore, Store};
use std::sync::Arc;
use std::time::Duration;

fn new_manager(
    datadir: std::path::PathBuf,
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

#[tokio::test]
async fn test_get_spawns_lazily_and_caches() {
    let datadir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let manager = new_manager(datadir.path().to_path_buf(), store);

    assert!(!manager.has("artifacts/static/a"));

    let first = manager.get("artifacts/static/a").await.unwrap();
    assert!(first.wait_started().await);
    assert!(manager.has("artifacts/static/a"));

    // Same repository resolves to the same live worker.
    let second = manager.get("artifacts/static/a").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // Has never spawns.
    assert!(!manager.has("artifacts/static/b"));

    manager.stop_all().await;
}

#[tokio::test]
async fn test_stopped_worker_is_treated_as_absent() {
    let datadir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let manager = new_manager(datadir.path().to_path_buf(), store);

    let first = manager.get("artifacts/static/a").await.unwrap();
    first.stop().await;
    first.wait_stopped().await;

    // Cleanup removed the worker from the manager.
    for _ in 0..100 {
        if !manager.has("artifacts/static/a") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!manager.has("artifacts/static/a"));

    // New work after stop yields a freshly spawned worker for the name.
    let second = manager.get("artifacts/static/a").await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.wait_started().await);

    manager.stop_all().await;
}

#[tokio::test]
async fn test_get_all_and_parallel_shutdown() {
    let datadir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let manager = new_manager(datadir.path().to_path_buf(), store);

    for name in ["artifacts/static/a", "artifacts/static/b", "artifacts/static/c"] {
        manager.get(name).await.unwrap();
    }
    assert_eq!(manager.get_all().len(), 3);

    manager.stop_all().await;
    for handler in manager.get_all() {
        assert!(handler.stopped());
    }
}
