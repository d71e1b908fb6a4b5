//! Session persistence boundary
//!
//! The core never owns session storage; it talks to a [`SessionStore`] and a
//! [`BlobStore`]. In-process implementations live here, the NATS JetStream
//! ones in `crate::nats`.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::model::{SessionDoc, SessionEvent, SessionPatch};
use crate::error::{EngineError, EngineResult};

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session; fails with `SessionExists` if `id` is taken
    async fn create(&self, id: &str, initial: SessionDoc) -> EngineResult<()>;

    async fn get(&self, id: &str) -> EngineResult<Option<SessionDoc>>;

    /// Read-modify-write of the document, returning the new version
    async fn update(&self, id: &str, patch: SessionPatch) -> EngineResult<SessionDoc>;

    /// Atomically append to the event log
    async fn append_event(&self, id: &str, event: SessionEvent) -> EngineResult<()>;

    /// Receive every new version of the document until unsubscribed
    async fn subscribe(&self, id: &str) -> EngineResult<SessionSubscription>;
}

/// Change feed for one session document
///
/// Dropping the subscription unsubscribes.
pub struct SessionSubscription {
    changes: mpsc::Receiver<SessionDoc>,
    task: Option<JoinHandle<()>>,
}

impl SessionSubscription {
    pub fn new(changes: mpsc::Receiver<SessionDoc>, task: JoinHandle<()>) -> Self {
        Self {
            changes,
            task: Some(task),
        }
    }

    /// Next version of the document, `None` once the feed has closed
    pub async fn changed(&mut self) -> Option<SessionDoc> {
        self.changes.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.changes.close();
    }
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opaque reference to an uploaded blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobHandle {
    pub bucket: String,
    pub key: String,
    pub size: usize,
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> EngineResult<BlobHandle>;

    fn public_url(&self, handle: &BlobHandle) -> String;
}

/// In-process session store
pub struct MemorySessionStore {
    docs: RwLock<HashMap<String, SessionDoc>>,
    changes: broadcast::Sender<SessionDoc>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            docs: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn notify(&self, doc: &SessionDoc) {
        // No subscribers is fine.
        let _ = self.changes.send(doc.clone());
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, id: &str, initial: SessionDoc) -> EngineResult<()> {
        let mut docs = self.docs.write().await;
        if docs.contains_key(id) {
            return Err(EngineError::SessionExists(id.to_string()));
        }
        self.notify(&initial);
        docs.insert(id.to_string(), initial);
        Ok(())
    }

    async fn get(&self, id: &str) -> EngineResult<Option<SessionDoc>> {
        Ok(self.docs.read().await.get(id).cloned())
    }

    async fn update(&self, id: &str, patch: SessionPatch) -> EngineResult<SessionDoc> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
        doc.apply(&patch)?;
        let updated = doc.clone();
        self.notify(&updated);
        Ok(updated)
    }

    async fn append_event(&self, id: &str, event: SessionEvent) -> EngineResult<()> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
        doc.events.push(event);
        let updated = doc.clone();
        self.notify(&updated);
        Ok(())
    }

    async fn subscribe(&self, id: &str) -> EngineResult<SessionSubscription> {
        let mut feed = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(16);
        let id = id.to_string();

        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(doc) if doc.id == id => {
                        if tx.send(doc).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Subscriber for {} skipped {} changes", id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(SessionSubscription::new(rx, task))
    }
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// In-process blob store
pub struct MemoryBlobStore {
    bucket: String,
    public_url_base: String,
    blobs: RwLock<HashMap<String, StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new(bucket: impl Into<String>, public_url_base: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            public_url_base: public_url_base.into(),
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<StoredBlob> {
        self.blobs.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> EngineResult<BlobHandle> {
        let mut blobs = self.blobs.write().await;
        if blobs.contains_key(path) {
            warn!("Overwriting blob {}", path);
        }
        blobs.insert(
            path.to_string(),
            StoredBlob {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );

        Ok(BlobHandle {
            bucket: self.bucket.clone(),
            key: path.to_string(),
            size: bytes.len(),
        })
    }

    fn public_url(&self, handle: &BlobHandle) -> String {
        format!(
            "{}/{}/{}",
            self.public_url_base.trim_end_matches('/'),
            handle.bucket,
            handle.key
        )
    }
}
