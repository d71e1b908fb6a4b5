use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{EngineError, EngineResult};

/// Audio sample data (normalized f32 PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples in [-1.0, 1.0], interleaved
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Monotonic instant of the frame's first sample
    pub captured_at: Instant,
}

impl AudioFrame {
    /// Number of sample frames (samples per channel)
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

/// Configuration for audio backend
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Requested sample rate (the device may pick another; frames carry the real one)
    pub sample_rate: u32,
    /// Requested channel count
    pub channels: u16,
    /// Frames buffered between the device callback and the consumer
    pub channel_capacity: usize,
    /// Samples per channel in each frame delivered by file playback
    pub frame_size: usize,
    /// Pace file playback at real time instead of as fast as possible
    pub realtime: bool,
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            channel_capacity: 256,
            frame_size: 1024,
            realtime: true,
        }
    }
}

/// Audio capture backend trait
///
/// Implementations:
/// - Microphone: cpal input stream (feature `microphone`)
/// - File: decoded audio file replayed as frames (analysis, dry runs)
///
/// A backend is owned by exactly one consumer at a time. Dropping the
/// receiver returned from `start` does not release the device; `stop` does.
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive audio frames
    async fn start(&mut self) -> EngineResult<mpsc::Receiver<AudioFrame>>;

    /// Stop capturing audio and release the device
    async fn stop(&mut self) -> EngineResult<()>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Acquires a fresh backend each time a component needs the input stream
pub trait OpenBackend: Send + Sync {
    fn open(&self) -> EngineResult<Box<dyn AudioBackend>>;
}

/// Audio source type
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Default input device
    Microphone,
    /// Decoded audio file
    File(PathBuf),
}

/// Audio backend factory
#[derive(Debug, Clone)]
pub struct AudioBackendFactory {
    pub source: AudioSource,
    pub config: AudioBackendConfig,
}

impl AudioBackendFactory {
    pub fn new(source: AudioSource, config: AudioBackendConfig) -> Self {
        Self { source, config }
    }

    /// Create audio backend based on platform and configuration
    pub fn create(
        source: &AudioSource,
        config: AudioBackendConfig,
    ) -> EngineResult<Box<dyn AudioBackend>> {
        match source {
            AudioSource::Microphone => {
                #[cfg(feature = "microphone")]
                {
                    use super::microphone::MicrophoneBackend;
                    Ok(Box::new(MicrophoneBackend::new(config)))
                }

                #[cfg(not(feature = "microphone"))]
                {
                    let _ = config;
                    Err(EngineError::NoInputDevice(
                        "built without the `microphone` feature".to_string(),
                    ))
                }
            }

            AudioSource::File(path) => {
                use super::file::FileBackend;
                Ok(Box::new(FileBackend::new(path.clone(), config)))
            }
        }
    }
}

impl OpenBackend for AudioBackendFactory {
    fn open(&self) -> EngineResult<Box<dyn AudioBackend>> {
        Self::create(&self.source, self.config.clone())
    }
}
