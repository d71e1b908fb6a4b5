use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::SchedulerConfig;
use crate::trigger::DetectorConfig;

/// Which triggers a participant reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Follow the session's scheduled start only
    Scheduled,
    /// Listen for the horn pattern only
    Acoustic,
    /// Whichever fires first
    Both,
}

impl TriggerMode {
    pub fn listens(&self) -> bool {
        matches!(self, TriggerMode::Acoustic | TriggerMode::Both)
    }

    pub fn follows_schedule(&self) -> bool {
        matches!(self, TriggerMode::Scheduled | TriggerMode::Both)
    }
}

/// Configuration for one participant in a recording session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session identifier in the session store
    pub session_id: String,

    /// Display name; also the artifact slug when set
    pub session_name: Option<String>,

    /// This device's participant id
    pub participant: String,

    pub mode: TriggerMode,

    /// Fixed length of every recording
    /// Default: 15 seconds
    pub recording_duration: Duration,

    /// A countdown starts once the scheduled start is this close
    pub countdown_threshold: Duration,

    /// Countdown step
    pub countdown_tick: Duration,

    /// Session document poll period while waiting for a schedule
    pub poll_interval: Duration,

    /// Round trips per clock offset estimate
    pub clock_samples: usize,

    pub detector: DetectorConfig,

    pub scheduler: SchedulerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: format!("session-{}", uuid::Uuid::new_v4()),
            session_name: None,
            participant: "device".to_string(),
            mode: TriggerMode::Both,
            recording_duration: Duration::from_secs(15),
            countdown_threshold: Duration::from_secs(30),
            countdown_tick: Duration::from_secs(1),
            poll_interval: Duration::from_secs(5),
            clock_samples: 7,
            detector: DetectorConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}
