use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::{TriggerEvent, TriggerSource};
use crate::audio::{SpectralExtractor, SpectralFrame};

/// Gates and timing of the two-pulse horn pattern
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Samples per analysis block
    pub block_size: usize,
    /// Minimum peak absolute amplitude for a block to be considered
    pub amplitude_gate: f32,
    /// Horn-characteristic band in Hz
    pub band_hz: (f32, f32),
    /// Minimum share of spectral energy inside the band
    pub min_band_ratio: f32,
    /// Qualifying blocks closer than this to the previous one belong to the same pulse
    pub debounce: Duration,
    /// Maximum gap between the two pulses of one pattern
    pub pattern_window: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            block_size: 2048,
            amplitude_gate: 0.25,
            band_hz: (300.0, 2000.0),
            min_band_ratio: 0.6,
            debounce: Duration::from_millis(300),
            pattern_window: Duration::from_millis(2000),
        }
    }
}

/// A single qualifying acoustic event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseEvent {
    pub occurred_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternState {
    Idle,
    OnePulseSeen { first: PulseEvent },
}

/// Status notifications for UI / spectrogram annotation
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    Pulse {
        at: Instant,
        amplitude_peak: f32,
        band_energy_ratio: f32,
    },
    /// A second pulse arrived outside the window and became the new first pulse
    PatternRestarted { stale: Instant, fresh: Instant },
    Triggered { first: Instant, second: Instant },
}

/// Recognizes two horn pulses within the pattern window
pub struct TriggerDetector {
    config: DetectorConfig,
    extractor: SpectralExtractor,
    state: PatternState,
    last_qualifying: Option<Instant>,
    status: Option<mpsc::UnboundedSender<DetectorEvent>>,
}

impl TriggerDetector {
    pub fn new(config: DetectorConfig, sample_rate: u32) -> Self {
        let extractor = SpectralExtractor::new(sample_rate, config.block_size, config.band_hz);
        Self {
            config,
            extractor,
            state: PatternState::Idle,
            last_qualifying: None,
            status: None,
        }
    }

    /// Report pulses and triggers to `sink`
    pub fn with_status(mut self, sink: Option<mpsc::UnboundedSender<DetectorEvent>>) -> Self {
        self.status = sink;
        self
    }

    pub fn state(&self) -> PatternState {
        self.state
    }

    pub fn sample_rate(&self) -> u32 {
        self.extractor.sample_rate()
    }

    pub fn reset(&mut self) {
        self.state = PatternState::Idle;
        self.last_qualifying = None;
    }

    /// Analyze one raw mono block
    ///
    /// The amplitude gate is checked before the FFT so quiet blocks cost one pass.
    pub fn process_block(&mut self, block: &[f32], captured_at: Instant) -> Option<TriggerEvent> {
        let amplitude_peak = SpectralExtractor::amplitude_peak(block);
        if amplitude_peak < self.config.amplitude_gate {
            return None;
        }

        let band_energy_ratio = self.extractor.band_energy_ratio(block);
        self.process_frame(&SpectralFrame {
            amplitude_peak,
            band_energy_ratio,
            captured_at,
        })
    }

    /// Run the gates and pattern logic on pre-extracted features
    pub fn process_frame(&mut self, frame: &SpectralFrame) -> Option<TriggerEvent> {
        if frame.amplitude_peak < self.config.amplitude_gate {
            return None;
        }
        if frame.band_energy_ratio < self.config.min_band_ratio {
            return None;
        }

        let now = frame.captured_at;
        let debounced = self
            .last_qualifying
            .map(|last| now.saturating_duration_since(last) < self.config.debounce)
            .unwrap_or(false);
        // Every qualifying block extends the current pulse, so a sustained blast counts once.
        self.last_qualifying = Some(now);
        if debounced {
            return None;
        }

        debug!(
            "Pulse: peak={:.3}, band ratio={:.3}",
            frame.amplitude_peak, frame.band_energy_ratio
        );
        self.report(DetectorEvent::Pulse {
            at: now,
            amplitude_peak: frame.amplitude_peak,
            band_energy_ratio: frame.band_energy_ratio,
        });

        let pulse = PulseEvent { occurred_at: now };
        match self.state {
            PatternState::Idle => {
                self.state = PatternState::OnePulseSeen { first: pulse };
                None
            }
            PatternState::OnePulseSeen { first } => {
                let delta = now.saturating_duration_since(first.occurred_at);
                if delta > self.config.pattern_window {
                    debug!("Pulse gap {:?} exceeds window; restarting pattern", delta);
                    self.state = PatternState::OnePulseSeen { first: pulse };
                    self.report(DetectorEvent::PatternRestarted {
                        stale: first.occurred_at,
                        fresh: now,
                    });
                    None
                } else {
                    self.state = PatternState::Idle;
                    self.report(DetectorEvent::Triggered {
                        first: first.occurred_at,
                        second: now,
                    });
                    Some(TriggerEvent {
                        source: TriggerSource::Acoustic,
                        at: now,
                    })
                }
            }
        }
    }

    fn report(&self, event: DetectorEvent) {
        if let Some(sink) = &self.status {
            let _ = sink.send(event);
        }
    }
}
