use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::audio::{AudioBackendConfig, AudioSource};
use crate::clock::SchedulerConfig;
use crate::session::{SessionConfig, TriggerMode};
use crate::trigger::DetectorConfig;

/// Prefix of environment overrides, e.g. `SOUNDMARK__HTTP__PORT=9000`
const ENV_PREFIX: &str = "SOUNDMARK";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub http: HttpConfig,
    pub clock: ClockConfig,
    pub trigger: TriggerConfig,
    pub recording: RecordingConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Participant id of this device
    pub participant: String,
    pub mode: TriggerMode,
    /// Input file replayed instead of the microphone
    pub input_file: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "soundmark".to_string(),
            participant: "device".to_string(),
            mode: TriggerMode::Both,
            input_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// `GET` endpoint returning `{ "now": epoch_ms }`; unset runs on the local clock
    pub reference_url: Option<String>,
    pub samples: usize,
    pub request_timeout_ms: u64,
    pub coarse_lead_ms: u64,
    pub fallback_lead_ms: u64,
    pub frame_tick_ms: u64,
    pub spin_window_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            reference_url: None,
            samples: 7,
            request_timeout_ms: 2000,
            coarse_lead_ms: scheduler.coarse_lead.as_millis() as u64,
            fallback_lead_ms: scheduler.fallback_lead.as_millis() as u64,
            frame_tick_ms: scheduler.frame_tick.as_millis() as u64,
            spin_window_ms: scheduler.spin_window.as_millis() as u64,
        }
    }
}

impl ClockConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            coarse_lead: Duration::from_millis(self.coarse_lead_ms),
            fallback_lead: Duration::from_millis(self.fallback_lead_ms),
            frame_tick: Duration::from_millis(self.frame_tick_ms),
            spin_window: Duration::from_millis(self.spin_window_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub block_size: usize,
    pub amplitude_gate: f32,
    pub band_low_hz: f32,
    pub band_high_hz: f32,
    pub min_band_ratio: f32,
    pub debounce_ms: u64,
    pub pattern_window_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        let detector = DetectorConfig::default();
        Self {
            block_size: detector.block_size,
            amplitude_gate: detector.amplitude_gate,
            band_low_hz: detector.band_hz.0,
            band_high_hz: detector.band_hz.1,
            min_band_ratio: detector.min_band_ratio,
            debounce_ms: detector.debounce.as_millis() as u64,
            pattern_window_ms: detector.pattern_window.as_millis() as u64,
        }
    }
}

impl TriggerConfig {
    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            block_size: self.block_size,
            amplitude_gate: self.amplitude_gate,
            band_hz: (self.band_low_hz, self.band_high_hz),
            min_band_ratio: self.min_band_ratio,
            debounce: Duration::from_millis(self.debounce_ms),
            pattern_window: Duration::from_millis(self.pattern_window_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub duration_secs: f64,
    pub countdown_threshold_secs: f64,
    pub countdown_tick_ms: u64,
    pub poll_interval_secs: f64,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            duration_secs: 15.0,
            countdown_threshold_secs: 30.0,
            countdown_tick_ms: 1000,
            poll_interval_secs: 5.0,
            sample_rate: 48000,
            channels: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process stores; sessions live as long as the process
    Memory,
    /// JetStream key-value and object store
    Nats,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub nats_url: String,
    pub session_bucket: String,
    pub blob_bucket: String,
    /// Prefix of artifact URLs handed out after upload
    pub public_url_base: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            nats_url: "nats://localhost:4222".to_string(),
            session_bucket: "soundmark-sessions".to_string(),
            blob_bucket: "soundmark-artifacts".to_string(),
            public_url_base: "http://localhost:8787/artifacts".to_string(),
        }
    }
}

impl Config {
    /// Load `path` (any format the `config` crate knows, extension optional)
    /// if it exists, then apply `SOUNDMARK__SECTION__KEY` overrides
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config {}", path))?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn audio_source(&self) -> AudioSource {
        match &self.service.input_file {
            Some(path) => AudioSource::File(path.clone()),
            None => AudioSource::Microphone,
        }
    }

    pub fn audio_backend(&self) -> AudioBackendConfig {
        AudioBackendConfig {
            sample_rate: self.recording.sample_rate,
            channels: self.recording.channels,
            ..AudioBackendConfig::default()
        }
    }

    /// Runner configuration for `session_id` with this device's defaults
    pub fn session(&self, session_id: &str) -> SessionConfig {
        let recording = &self.recording;
        SessionConfig {
            session_id: session_id.to_string(),
            session_name: None,
            participant: self.service.participant.clone(),
            mode: self.service.mode,
            recording_duration: Duration::from_secs_f64(recording.duration_secs.max(0.0)),
            countdown_threshold: Duration::from_secs_f64(
                recording.countdown_threshold_secs.max(0.0),
            ),
            countdown_tick: Duration::from_millis(recording.countdown_tick_ms.max(1)),
            poll_interval: Duration::from_secs_f64(recording.poll_interval_secs.max(0.01)),
            clock_samples: self.clock.samples,
            detector: self.trigger.detector(),
            scheduler: self.clock.scheduler(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_runtime_defaults() {
        let cfg = Config::default();
        let session = cfg.session("s1");
        let defaults = SessionConfig::default();

        assert_eq!(session.recording_duration, defaults.recording_duration);
        assert_eq!(session.countdown_threshold, defaults.countdown_threshold);
        assert_eq!(session.poll_interval, defaults.poll_interval);
        assert_eq!(session.detector.block_size, 2048);
        assert_eq!(session.scheduler.coarse_lead, Duration::from_millis(30));
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
    }
}
