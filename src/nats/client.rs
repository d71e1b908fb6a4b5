use anyhow::{Context, Result};
use async_nats::jetstream::{self, kv, object_store};
use async_nats::Client;
use tracing::info;

use super::store::{NatsBlobStore, NatsSessionStore};

pub struct NatsClient {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    /// Connect to NATS server
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        let jetstream = jetstream::new(client.clone());
        Ok(Self { client, jetstream })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Session documents in a JetStream key-value bucket (created if missing)
    pub async fn session_store(&self, bucket: &str) -> Result<NatsSessionStore> {
        let store = self
            .jetstream
            .create_key_value(kv::Config {
                bucket: bucket.to_string(),
                history: 5,
                ..Default::default()
            })
            .await
            .with_context(|| format!("Failed to open key-value bucket {}", bucket))?;

        info!("Using key-value bucket {} for sessions", bucket);

        Ok(NatsSessionStore::new(store))
    }

    /// Artifacts in a JetStream object store bucket (created if missing)
    pub async fn blob_store(&self, bucket: &str, public_url_base: &str) -> Result<NatsBlobStore> {
        let store = self
            .jetstream
            .create_object_store(object_store::Config {
                bucket: bucket.to_string(),
                ..Default::default()
            })
            .await
            .with_context(|| format!("Failed to open object store {}", bucket))?;

        info!("Using object store {} for artifacts", bucket);

        Ok(NatsBlobStore::new(store, bucket, public_url_base))
    }

    /// Flush pending publishes before shutdown
    pub async fn close(self) -> Result<()> {
        info!("Closing NATS connection");
        self.client
            .flush()
            .await
            .context("Failed to flush NATS connection")?;
        Ok(())
    }
}
