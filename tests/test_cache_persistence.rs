//! Publish cache persistence across client restarts


use device_pubsub::client::{CacheStore, ClientOptions, FileCacheStore};
use device_pubsub::prelude::*;
use device_pubsub::testing::{MockConfigProvider, MockTransport};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use test_helpers::*;
use tokio_test::{assert_err, assert_ok};

async fn start_persistent(
    transport: &MockTransport,
    store: &FileCacheStore,
) -> ClientResult<Client> {
    Client::builder(Credentials::device(DEVICE_ID, DEVICE_SECRET))
        .provider(Arc::new(MockConfigProvider::new()))
        .options(ClientOptions {
            reconnect: fast_reconnect(),
            ..Default::default()
        })
        .cache_store(Arc::new(store.clone()))
        .start(transport.clone())
        .await
}

#[tokio::test]
async fn test_cached_publications_survive_restart() {
    let dir = TempDir::new().unwrap();
    let store = FileCacheStore::new(dir.path().join("state").join("cache.json"));

    let first_run = MockTransport::new(Protocol::Queue);
    let client = start_persistent(&first_run, &store).await.unwrap();
    for n in 1..=3 {
        let outcome = client
            .publish("data", json!({ "n": n }), PublishOptions::new().persistent(true))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Cached);
    }
    client.shutdown().await.unwrap();

    let on_disk = store.read_snapshot().await.unwrap();
    assert_eq!(on_disk.len(), 3);
    assert_eq!(on_disk[0].address, "deviceId.data");
    assert!(on_disk[0].options.persistent);

    let second_run = MockTransport::new(Protocol::Queue);
    let client = start_persistent(&second_run, &store).await.unwrap();
    assert_eq!(client.cached_messages().await.unwrap(), 3);

    client.connect().await.unwrap();

    let sent: Vec<_> = second_run
        .publishes()
        .await
        .iter()
        .filter_map(|p| p.body_json())
        .collect();
    assert_eq!(sent, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
    assert!(store.read_snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_publishers_share_one_cache() {
    let dir = TempDir::new().unwrap();
    let store = FileCacheStore::new(dir.path().join("cache.json"));
    let transport = MockTransport::new(Protocol::Queue);
    let client = start_persistent(&transport, &store).await.unwrap();

    let publishes = (0..10).map(|n| {
        let handle = client.clone();
        async move {
            handle
                .publish("data", json!({ "n": n }), PublishOptions::new())
                .await
        }
    });
    for result in futures::future::join_all(publishes).await {
        assert_ok!(result);
    }

    assert_eq!(client.cached_messages().await.unwrap(), 10);
    assert_eq!(store.read_snapshot().await.unwrap().len(), 10);

    client.connect().await.unwrap();
    assert_eq!(transport.publishes().await.len(), 10);
}

#[tokio::test]
async fn test_corrupt_snapshot_fails_start() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.json");
    tokio::fs::write(&path, b"not json").await.unwrap();

    let result = start_persistent(&MockTransport::default(), &FileCacheStore::new(path)).await;

    assert!(matches!(assert_err!(result), ClientError::Persistence(_)));
}
