// Integration tests for the JetStream-backed session store
//
// These need a NATS server with JetStream enabled:
//   nats-server -js
//   cargo test --test nats_store_tests -- --ignored
// Set SOUNDMARK_TEST_NATS_URL to point somewhere other than localhost.

use std::time::Duration;

use anyhow::Result;
use soundmark::error::EngineError;
use soundmark::nats::NatsClient;
use soundmark::session::{SessionDoc, SessionPatch, SessionStore};

fn nats_url() -> String {
    std::env::var("SOUNDMARK_TEST_NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

fn unique_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore = "needs a NATS server with JetStream"]
async fn test_create_rejects_existing_key() -> Result<()> {
    let client = NatsClient::connect(&nats_url()).await?;
    let store = client.session_store("soundmark-test-sessions").await?;
    let id = unique_id("create");

    store.create(&id, SessionDoc::new(&id, None)).await?;
    let again = store.create(&id, SessionDoc::new(&id, None)).await;

    assert_eq!(again, Err(EngineError::SessionExists(id.clone())));
    assert_eq!(store.get(&id).await?.map(|doc| doc.id), Some(id));
    Ok(())
}

#[tokio::test]
#[ignore = "needs a NATS server with JetStream"]
async fn test_subscription_outlives_subscribe_call() -> Result<()> {
    let client = NatsClient::connect(&nats_url()).await?;
    let store = client.session_store("soundmark-test-sessions").await?;
    let id = unique_id("watch");
    store.create(&id, SessionDoc::new(&id, None)).await?;

    // The feed is driven by a spawned task, not by the store borrow
    let mut feed = store.subscribe(&id).await?;
    drop(store);

    let writer = client.session_store("soundmark-test-sessions").await?;
    writer.update(&id, SessionPatch::schedule(42_000)).await?;

    let doc = tokio::time::timeout(Duration::from_secs(5), feed.changed())
        .await?
        .expect("feed open");
    assert_eq!(doc.scheduled_start_ms, Some(42_000));

    feed.unsubscribe();
    client.close().await?;
    Ok(())
}
