use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backend::{AudioBackend, AudioBackendConfig, AudioFrame};
use super::capture::PcmBuffer;
use crate::error::{EngineError, EngineResult};

pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioFile {
    /// Decode any symphonia-supported file into interleaved f32 PCM
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let file = File::open(path)
            .map_err(|e| EngineError::Audio(format!("{}: {}", path.display(), e)))?;
        let extension = path.extension().and_then(|ext| ext.to_str());
        let pcm = decode_source(Box::new(file), extension)?;

        let duration_seconds = pcm.duration_seconds();

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            pcm.sample_rate,
            pcm.channels,
            pcm.samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: pcm.sample_rate,
            channels: pcm.channels,
            samples: pcm.samples,
        })
    }

    pub fn into_pcm(self) -> PcmBuffer {
        PcmBuffer {
            samples: self.samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }
}

/// Decode an in-memory container (WAV, MP3, M4A, OGG, FLAC) to linear PCM
pub fn decode_container(bytes: &[u8], extension: Option<&str>) -> EngineResult<PcmBuffer> {
    decode_source(Box::new(Cursor::new(bytes.to_vec())), extension)
}

fn decode_source(source: Box<dyn MediaSource>, extension: Option<&str>) -> EngineResult<PcmBuffer> {
    let stream = MediaSourceStream::new(source, Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, stream, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| EngineError::DecodeFailure(format!("unrecognized container: {}", e)))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| EngineError::DecodeFailure("no audio track".to_string()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| EngineError::DecodeFailure(format!("unsupported codec: {}", e)))?;

    let mut sample_rate = codec_params.sample_rate.unwrap_or(0);
    let mut channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(0);
    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(EngineError::DecodeFailure(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count() as u16;

                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buffer.samples());
            }
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping corrupt packet: {}", e);
            }
            Err(e) => return Err(EngineError::DecodeFailure(e.to_string())),
        }
    }

    if sample_rate == 0 || channels == 0 {
        return Err(EngineError::DecodeFailure(
            "stream has no sample rate or channel layout".to_string(),
        ));
    }

    Ok(PcmBuffer {
        samples,
        sample_rate,
        channels,
    })
}

/// Replays a decoded audio file as a stream of frames
pub struct FileBackend {
    path: PathBuf,
    config: AudioBackendConfig,
    task: Option<JoinHandle<()>>,
    name: String,
}

impl FileBackend {
    pub fn new(path: PathBuf, config: AudioBackendConfig) -> Self {
        let name = format!("file:{}", path.display());
        Self {
            path,
            config,
            task: None,
            name,
        }
    }
}

#[async_trait::async_trait]
impl AudioBackend for FileBackend {
    async fn start(&mut self) -> EngineResult<mpsc::Receiver<AudioFrame>> {
        if self.task.is_some() {
            return Err(EngineError::Audio(format!("{} already started", self.name)));
        }

        let path = self.path.clone();
        let audio = tokio::task::spawn_blocking(move || AudioFile::open(path))
            .await
            .map_err(|e| EngineError::Audio(format!("decode task failed: {}", e)))??;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let frame_size = self.config.frame_size.max(1);
        let realtime = self.config.realtime;
        let name = self.name.clone();

        let task = tokio::spawn(async move {
            let channels = audio.channels.max(1);
            let chunk_len = frame_size * channels as usize;
            let period = Duration::from_secs_f64(frame_size as f64 / audio.sample_rate as f64);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

            for chunk in audio.samples.chunks(chunk_len) {
                if realtime {
                    ticker.tick().await;
                }

                let frame = AudioFrame {
                    samples: chunk.to_vec(),
                    sample_rate: audio.sample_rate,
                    channels,
                    captured_at: Instant::now(),
                };

                if tx.send(frame).await.is_err() {
                    break;
                }
            }

            debug!("{} playback finished", name);
        });

        self.task = Some(task);
        info!("Started {}", self.name);

        Ok(rx)
    }

    async fn stop(&mut self) -> EngineResult<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Stopped {}", self.name);
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
