//! Live microphone capture through cpal
//!
//! cpal streams are not `Send`, so each backend runs its stream on a dedicated
//! thread that lives until `stop` is called. The device callback only converts
//! samples into pre-allocated ring buffers; that thread drains them into
//! frames for the consumer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, SampleFormat, StreamConfig};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::backend::{AudioBackend, AudioBackendConfig, AudioFrame};
use crate::error::{EngineError, EngineResult};

/// How often the stream thread drains the rings
const DRAIN_INTERVAL: Duration = Duration::from_millis(5);
/// Callbacks that may be pending between drains
const MARK_CAPACITY: usize = 256;

/// One device callback's worth of samples in the sample ring
#[derive(Debug, Clone, Copy)]
struct CallbackMark {
    captured_at: Instant,
    len: usize,
}

/// Producer side of the callback rings, owned by the device callback
struct CallbackRing {
    samples: rtrb::Producer<f32>,
    marks: rtrb::Producer<CallbackMark>,
    samples_per_sec: f64,
    dropped: Arc<AtomicU64>,
}

impl CallbackRing {
    /// Copy one callback into the rings without allocating
    ///
    /// A callback that does not fit whole is dropped and counted.
    fn push<T>(&mut self, data: &[T])
    where
        T: cpal::Sample,
        f32: cpal::FromSample<T>,
    {
        if self.marks.is_full() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Ok(chunk) = self.samples.write_chunk_uninit(data.len()) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let len = chunk.fill_from_iter(data.iter().map(|&s| <f32 as cpal::Sample>::from_sample(s)));

        let now = Instant::now();
        let span = Duration::from_secs_f64(len as f64 / self.samples_per_sec);
        let _ = self.marks.push(CallbackMark {
            captured_at: now.checked_sub(span).unwrap_or(now),
            len,
        });
    }
}

/// Consumer side of the callback rings, owned by the stream thread
struct CaptureRing {
    samples: rtrb::Consumer<f32>,
    marks: rtrb::Consumer<CallbackMark>,
    sample_rate: u32,
    channels: u16,
}

/// Rings holding `capacity` samples between drains
fn capture_ring(
    sample_rate: u32,
    channels: u16,
    capacity: usize,
    dropped: Arc<AtomicU64>,
) -> (CallbackRing, CaptureRing) {
    let (sample_tx, sample_rx) = rtrb::RingBuffer::<f32>::new(capacity);
    let (mark_tx, mark_rx) = rtrb::RingBuffer::<CallbackMark>::new(MARK_CAPACITY);
    (
        CallbackRing {
            samples: sample_tx,
            marks: mark_tx,
            samples_per_sec: sample_rate.max(1) as f64 * channels.max(1) as f64,
            dropped,
        },
        CaptureRing {
            samples: sample_rx,
            marks: mark_rx,
            sample_rate,
            channels,
        },
    )
}

impl CaptureRing {
    /// Turn every complete callback into a frame
    fn forward(&mut self, tx: &mpsc::Sender<AudioFrame>, dropped: &AtomicU64) {
        while let Ok(mark) = self.marks.pop() {
            let Ok(chunk) = self.samples.read_chunk(mark.len) else {
                break;
            };
            let (head, tail) = chunk.as_slices();
            let mut samples = Vec::with_capacity(mark.len);
            samples.extend_from_slice(head);
            samples.extend_from_slice(tail);
            chunk.commit_all();

            let frame = AudioFrame {
                samples,
                sample_rate: self.sample_rate,
                channels: self.channels,
                captured_at: mark.captured_at,
            };
            if tx.try_send(frame).is_err() {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub struct MicrophoneBackend {
    config: AudioBackendConfig,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    capturing: Arc<AtomicBool>,
    dropped_frames: Arc<AtomicU64>,
    name: String,
}

impl MicrophoneBackend {
    pub fn new(config: AudioBackendConfig) -> Self {
        Self {
            config,
            stop_tx: None,
            thread: None,
            capturing: Arc::new(AtomicBool::new(false)),
            dropped_frames: Arc::new(AtomicU64::new(0)),
            name: "microphone".to_string(),
        }
    }

    /// Prefer a device config at the requested rate, fall back to the default one
    fn pick_config(device: &Device, target_sample_rate: u32) -> EngineResult<(StreamConfig, SampleFormat)> {
        if let Ok(configs) = device.supported_input_configs() {
            for range in configs {
                if range.min_sample_rate().0 <= target_sample_rate
                    && range.max_sample_rate().0 >= target_sample_rate
                {
                    let supported = range.with_sample_rate(cpal::SampleRate(target_sample_rate));
                    return Ok((supported.config(), supported.sample_format()));
                }
            }
        }

        let supported = device
            .default_input_config()
            .map_err(|e| EngineError::MicrophonePermissionDenied(e.to_string()))?;
        Ok((supported.config(), supported.sample_format()))
    }

    fn build_stream<T>(
        device: &Device,
        config: &StreamConfig,
        mut ring: CallbackRing,
    ) -> Result<cpal::Stream, BuildStreamError>
    where
        T: cpal::Sample + cpal::SizedSample + Send + 'static,
        f32: cpal::FromSample<T>,
    {
        device.build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| ring.push(data),
            |err| {
                error!("Microphone stream error: {}", err);
            },
            None,
        )
    }

    fn open_stream(
        target_sample_rate: u32,
        dropped: Arc<AtomicU64>,
    ) -> EngineResult<(cpal::Stream, CaptureRing)> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| EngineError::NoInputDevice("no default input device".to_string()))?;

        let device_name = device.name().unwrap_or_else(|_| "Unknown Device".to_string());
        let (config, format) = Self::pick_config(&device, target_sample_rate)?;

        info!(
            "Opening {} at {}Hz, {} channels ({:?})",
            device_name, config.sample_rate.0, config.channels, format
        );

        // Half a second of audio between drains
        let capacity = (config.sample_rate.0 as usize * config.channels.max(1) as usize / 2).max(4096);
        let (producer, ring) = capture_ring(config.sample_rate.0, config.channels, capacity, dropped);

        let stream = match format {
            SampleFormat::F32 => Self::build_stream::<f32>(&device, &config, producer),
            SampleFormat::I16 => Self::build_stream::<i16>(&device, &config, producer),
            SampleFormat::U16 => Self::build_stream::<u16>(&device, &config, producer),
            SampleFormat::I32 => Self::build_stream::<i32>(&device, &config, producer),
            other => {
                return Err(EngineError::Audio(format!(
                    "unsupported sample format: {:?}",
                    other
                )))
            }
        }
        .map_err(|e| match e {
            BuildStreamError::DeviceNotAvailable => {
                EngineError::NoInputDevice(format!("{} not available", device_name))
            }
            other => EngineError::MicrophonePermissionDenied(other.to_string()),
        })?;

        stream
            .play()
            .map_err(|e| EngineError::MicrophonePermissionDenied(e.to_string()))?;

        Ok((stream, ring))
    }
}

#[async_trait::async_trait]
impl AudioBackend for MicrophoneBackend {
    async fn start(&mut self) -> EngineResult<mpsc::Receiver<AudioFrame>> {
        if self.thread.is_some() {
            return Err(EngineError::Audio("microphone already started".to_string()));
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let target_rate = self.config.sample_rate;
        let dropped = Arc::clone(&self.dropped_frames);
        let capturing = Arc::clone(&self.capturing);

        let thread = thread::Builder::new()
            .name("soundmark-mic".to_string())
            .spawn(move || match Self::open_stream(target_rate, Arc::clone(&dropped)) {
                Ok((stream, mut ring)) => {
                    capturing.store(true, Ordering::SeqCst);
                    let _ = ready_tx.send(Ok(()));
                    // Hold the stream until stop() (or the backend is dropped).
                    while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(DRAIN_INTERVAL) {
                        ring.forward(&tx, &dropped);
                    }
                    drop(stream);
                    ring.forward(&tx, &dropped);
                    capturing.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| EngineError::Audio(format!("failed to spawn capture thread: {}", e)))?;

        let ready = ready_rx
            .await
            .map_err(|_| EngineError::Audio("capture thread exited early".to_string()))?;

        match ready {
            Ok(()) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(thread);
                Ok(rx)
            }
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }

    async fn stop(&mut self) -> EngineResult<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(thread) = self.thread.take() {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| EngineError::Audio(format!("join failed: {}", e)))?
                .map_err(|_| EngineError::Audio("capture thread panicked".to_string()))?;

            let dropped = self.dropped_frames.swap(0, Ordering::Relaxed);
            if dropped > 0 {
                warn!("Microphone dropped {} frames (consumer lagging)", dropped);
            }
            info!("Microphone released");
        }

        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
