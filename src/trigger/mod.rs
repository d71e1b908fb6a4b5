//! Acoustic trigger detection
//!
//! Recognizes the "two horn blasts within a window" pattern on a live input
//! stream and emits [`TriggerEvent`]s into a session's trigger channel.

mod analyze;
mod detector;
mod listener;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use analyze::{analyze_pcm, AnalysisEvent};
pub use detector::{DetectorConfig, DetectorEvent, PatternState, PulseEvent, TriggerDetector};
pub use listener::TriggerListener;

/// What started a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Two-pulse horn pattern
    Acoustic,
    /// Session's scheduled start reached
    Scheduled,
    /// Operator request
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    pub source: TriggerSource,
    pub at: Instant,
}

impl TriggerEvent {
    pub fn now(source: TriggerSource) -> Self {
        Self {
            source,
            at: Instant::now(),
        }
    }
}
