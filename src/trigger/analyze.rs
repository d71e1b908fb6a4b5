use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::detector::{DetectorConfig, DetectorEvent, TriggerDetector};
use crate::audio::PcmBuffer;

/// Detector output for a recorded clip, positioned in seconds from its start
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalysisEvent {
    Pulse {
        at_secs: f64,
        amplitude_peak: f32,
        band_energy_ratio: f32,
    },
    PatternRestarted { stale_secs: f64, fresh_secs: f64 },
    Triggered { first_secs: f64, second_secs: f64 },
}

impl AnalysisEvent {
    pub fn is_trigger(&self) -> bool {
        matches!(self, AnalysisEvent::Triggered { .. })
    }
}

/// Run the detector over a whole clip, block by block
///
/// Block timestamps come from the sample position, so the result does not
/// depend on how fast the clip is processed. A trailing partial block is
/// ignored.
pub fn analyze_pcm(pcm: &PcmBuffer, config: &DetectorConfig) -> Vec<AnalysisEvent> {
    let (sink, mut events) = mpsc::unbounded_channel();
    let mut detector = TriggerDetector::new(config.clone(), pcm.sample_rate).with_status(Some(sink));

    let origin = Instant::now();
    let sample_rate = pcm.sample_rate.max(1) as f64;
    let mono = pcm.to_mono();
    let block_size = config.block_size.max(1);

    for (index, block) in mono.chunks_exact(block_size).enumerate() {
        let offset = Duration::from_secs_f64((index * block_size) as f64 / sample_rate);
        detector.process_block(block, origin + offset);
    }
    drop(detector);

    let secs = |at: Instant| at.saturating_duration_since(origin).as_secs_f64();
    let mut analysis = Vec::new();
    while let Ok(event) = events.try_recv() {
        analysis.push(match event {
            DetectorEvent::Pulse {
                at,
                amplitude_peak,
                band_energy_ratio,
            } => AnalysisEvent::Pulse {
                at_secs: secs(at),
                amplitude_peak,
                band_energy_ratio,
            },
            DetectorEvent::PatternRestarted { stale, fresh } => AnalysisEvent::PatternRestarted {
                stale_secs: secs(stale),
                fresh_secs: secs(fresh),
            },
            DetectorEvent::Triggered { first, second } => AnalysisEvent::Triggered {
                first_secs: secs(first),
                second_secs: secs(second),
            },
        });
    }

    analysis
}
