use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::backend::{AudioBackend, AudioFrame};
use crate::error::{EngineError, EngineResult};

/// Interleaved linear PCM
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    /// Samples in [-1.0, 1.0], interleaved
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmBuffer {
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Average all channels of each frame into one
    pub fn to_mono(&self) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        if channels == 1 {
            return self.samples.clone();
        }

        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

/// Audio captured during a recording, before encoding
#[derive(Debug, Clone)]
pub enum AudioArtifact {
    /// Raw samples buffered from a backend
    Pcm(PcmBuffer),
    /// Compressed clip (e.g. uploaded by a browser participant)
    Container {
        bytes: Vec<u8>,
        /// File extension hint for the demuxer ("ogg", "m4a", ...)
        extension: Option<String>,
    },
}

impl AudioArtifact {
    pub fn from_container(bytes: Vec<u8>, extension: Option<String>) -> Self {
        AudioArtifact::Container { bytes, extension }
    }
}

/// Fixed-duration capture that owns its backend for the whole recording
///
/// Frames are buffered on a tokio task; `stop` releases the device and hands
/// the buffer over as an [`AudioArtifact`].
pub struct Capture {
    backend: Box<dyn AudioBackend>,
    stop_token: CancellationToken,
    task: Option<JoinHandle<CaptureBuffer>>,
}

#[derive(Default)]
struct CaptureBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    frames_received: usize,
    format_changes: usize,
}

impl CaptureBuffer {
    fn push(&mut self, frame: AudioFrame) {
        if self.frames_received == 0 {
            self.sample_rate = frame.sample_rate;
            self.channels = frame.channels;
        } else if frame.sample_rate != self.sample_rate || frame.channels != self.channels {
            self.format_changes += 1;
            return;
        }

        self.samples.extend_from_slice(&frame.samples);
        self.frames_received += 1;
    }
}

impl Capture {
    /// Acquire the backend's stream and begin buffering
    pub async fn start(mut backend: Box<dyn AudioBackend>) -> EngineResult<Self> {
        let mut audio_rx = backend.start().await?;
        let stop_token = CancellationToken::new();
        let token = stop_token.clone();

        info!("Capture started on {}", backend.name());

        let task = tokio::spawn(async move {
            let mut buffer = CaptureBuffer::default();
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        // Take whatever is already queued; it was captured before the stop.
                        while let Ok(frame) = audio_rx.try_recv() {
                            buffer.push(frame);
                        }
                        break;
                    }
                    frame = audio_rx.recv() => match frame {
                        Some(frame) => buffer.push(frame),
                        None => break,
                    },
                }
            }
            buffer
        });

        Ok(Self {
            backend,
            stop_token,
            task: Some(task),
        })
    }

    /// Stop capture, release the device and return the buffered samples
    pub async fn stop(mut self) -> EngineResult<AudioArtifact> {
        self.stop_token.cancel();

        if let Err(e) = self.backend.stop().await {
            error!("Failed to stop capture backend: {}", e);
        }

        let buffer = match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| EngineError::Audio(format!("capture task failed: {}", e)))?,
            None => CaptureBuffer::default(),
        };

        if buffer.format_changes > 0 {
            warn!(
                "Dropped {} frames with a changed stream format",
                buffer.format_changes
            );
        }

        if buffer.frames_received == 0 {
            return Err(EngineError::Audio("no audio captured".to_string()));
        }

        let pcm = PcmBuffer {
            samples: buffer.samples,
            sample_rate: buffer.sample_rate,
            channels: buffer.channels,
        };

        info!(
            "Capture complete: {:.2}s, {}Hz, {} channels",
            pcm.duration_seconds(),
            pcm.sample_rate,
            pcm.channels
        );

        Ok(AudioArtifact::Pcm(pcm))
    }

    /// Discard the recording and release the device
    pub async fn abort(mut self) {
        self.stop_token.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Err(e) = self.backend.stop().await {
            error!("Failed to stop capture backend: {}", e);
        }
        info!("Capture discarded");
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        // stop()/abort() consume the task; anything left here was abandoned mid-recording.
        if let Some(task) = self.task.take() {
            warn!("Capture dropped without stop; discarding buffered audio");
            self.stop_token.cancel();
            task.abort();
        }
    }
}
