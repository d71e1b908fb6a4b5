use async_nats::jetstream::{kv, object_store};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::session::{
    BlobHandle, BlobStore, SessionDoc, SessionEvent, SessionPatch, SessionStore,
    SessionSubscription,
};

/// Optimistic-concurrency retries before a write gives up
const MAX_WRITE_ATTEMPTS: usize = 16;

fn store_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Store(e.to_string())
}

fn decode(id: &str, bytes: &[u8]) -> EngineResult<SessionDoc> {
    serde_json::from_slice(bytes)
        .map_err(|e| EngineError::Store(format!("corrupt session document {}: {}", id, e)))
}

fn encode(doc: &SessionDoc) -> EngineResult<Vec<u8>> {
    serde_json::to_vec(doc).map_err(store_error)
}

/// Session documents as JSON values in a JetStream key-value bucket
///
/// Writes are compare-and-set on the entry revision, so concurrent
/// participants never lose each other's updates.
pub struct NatsSessionStore {
    kv: kv::Store,
}

impl NatsSessionStore {
    pub fn new(kv: kv::Store) -> Self {
        Self { kv }
    }

    async fn modify<F>(&self, id: &str, mut change: F) -> EngineResult<SessionDoc>
    where
        F: FnMut(&mut SessionDoc) -> EngineResult<()> + Send,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let entry = self
                .kv
                .entry(id)
                .await
                .map_err(store_error)?
                .filter(|entry| matches!(entry.operation, kv::Operation::Put))
                .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;

            let mut doc = decode(id, &entry.value)?;
            change(&mut doc)?;

            match self
                .kv
                .update(id, encode(&doc)?.into(), entry.revision)
                .await
            {
                Ok(_) => return Ok(doc),
                Err(e) => debug!(
                    "Write to session {} lost revision race (attempt {}): {}",
                    id, attempt, e
                ),
            }
        }

        Err(EngineError::Store(format!(
            "session {} still contended after {} attempts",
            id, MAX_WRITE_ATTEMPTS
        )))
    }
}

#[async_trait::async_trait]
impl SessionStore for NatsSessionStore {
    async fn create(&self, id: &str, initial: SessionDoc) -> EngineResult<()> {
        // Revision 0 only succeeds if the key has never been written.
        match self.kv.update(id, encode(&initial)?.into(), 0).await {
            Ok(_) => Ok(()),
            Err(e) => match self.kv.get(id).await {
                Ok(Some(_)) => Err(EngineError::SessionExists(id.to_string())),
                _ => Err(store_error(e)),
            },
        }
    }

    async fn get(&self, id: &str) -> EngineResult<Option<SessionDoc>> {
        match self.kv.get(id).await.map_err(store_error)? {
            Some(bytes) => decode(id, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn update(&self, id: &str, patch: SessionPatch) -> EngineResult<SessionDoc> {
        self.modify(id, |doc| doc.apply(&patch)).await
    }

    async fn append_event(&self, id: &str, event: SessionEvent) -> EngineResult<()> {
        self.modify(id, |doc| {
            doc.events.push(event.clone());
            Ok(())
        })
        .await
        .map(|_| ())
    }

    async fn subscribe(&self, id: &str) -> EngineResult<SessionSubscription> {
        let kv = self.kv.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(16);
        let id = id.to_string();
        let watched = id.clone();

        let task = tokio::spawn(async move {
            let mut watch = match kv.watch(&id).await {
                Ok(watch) => {
                    let _ = ready_tx.send(Ok(()));
                    watch
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(store_error(e)));
                    return;
                }
            };

            while let Some(entry) = watch.next().await {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Watch on session {} failed: {}", id, e);
                        break;
                    }
                };

                if !matches!(entry.operation, kv::Operation::Put) {
                    continue;
                }

                match decode(&id, &entry.value) {
                    Ok(doc) => {
                        if tx.send(doc).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("{}", e),
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(SessionSubscription::new(rx, task)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::Store(format!(
                "watch on session {} ended before starting",
                watched
            ))),
        }
    }
}

/// Artifacts in a JetStream object store
///
/// Public URLs are `{public_url_base}/{bucket}/{key}`; something outside this
/// process (a gateway in front of the object store) is expected to serve them.
pub struct NatsBlobStore {
    store: object_store::ObjectStore,
    bucket: String,
    public_url_base: String,
}

impl NatsBlobStore {
    pub fn new(store: object_store::ObjectStore, bucket: &str, public_url_base: &str) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            public_url_base: public_url_base.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for NatsBlobStore {
    async fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> EngineResult<BlobHandle> {
        let meta = object_store::ObjectMetadata {
            name: path.to_string(),
            description: Some(content_type.to_string()),
            ..Default::default()
        };

        let mut reader = bytes;
        self.store
            .put(meta, &mut reader)
            .await
            .map_err(|e| EngineError::UploadFailure(e.to_string()))?;

        Ok(BlobHandle {
            bucket: self.bucket.clone(),
            key: path.to_string(),
            size: bytes.len(),
        })
    }

    fn public_url(&self, handle: &BlobHandle) -> String {
        format!("{}/{}/{}", self.public_url_base, handle.bucket, handle.key)
    }
}
