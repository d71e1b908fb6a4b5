use crate::session::{SessionConfig, SessionHandle, SessionServices};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Stores, input and reference clock shared by every local runner
    pub services: SessionServices,

    /// Template for runners started through `join`
    pub session_defaults: SessionConfig,

    /// Local runners (session_id → handle)
    pub runners: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl AppState {
    pub fn new(services: SessionServices, session_defaults: SessionConfig) -> Self {
        Self {
            services,
            session_defaults,
            runners: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn runner(&self, session_id: &str) -> Option<SessionHandle> {
        self.runners.read().await.get(session_id).cloned()
    }
}
