use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use super::config::TriggerMode;
use super::state::SessionState;
use crate::clock::ClockOffset;
use crate::trigger::TriggerSource;

/// Snapshot of a participant's session, kept current by the runner
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,

    pub participant: String,

    pub mode: TriggerMode,

    pub state: SessionState,

    /// Generation the runner is working on, once known
    pub generation: Option<u32>,

    /// Scheduled start pinned for this generation (reference epoch ms)
    pub scheduled_start_ms: Option<i64>,

    /// Last offset estimate; `None` until one was attempted
    pub clock_offset: Option<ClockOffset>,

    pub clock_synced: bool,

    pub triggered_by: Option<TriggerSource>,

    pub upload_url: Option<String>,

    pub last_error: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl SessionStats {
    pub fn new(session_id: &str, participant: &str, mode: TriggerMode) -> Self {
        Self {
            session_id: session_id.to_string(),
            participant: participant.to_string(),
            mode,
            state: SessionState::Created,
            generation: None,
            scheduled_start_ms: None,
            clock_offset: None,
            clock_synced: false,
            triggered_by: None,
            upload_url: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Progress notifications for UIs
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// Every state entered, countdown ticks included
    State { state: SessionState, at: Instant },
    ClockSynced { offset: ClockOffset },
    /// Continuing on the local clock with a wider margin
    ClockSyncFailed { reason: String },
    TriggerIgnored { source: TriggerSource, reason: String },
    Error { message: String },
}
