//! Canonical 16-bit PCM WAV encoding
//!
//! Output layout is the classic 44-byte header: `RIFF`/`WAVE`, a 16-byte
//! `fmt ` chunk (PCM, mono, 16-bit) and a `data` chunk holding exactly
//! `frames * 2` bytes.

use std::io::Cursor;

use hound::{SampleFormat, WavSpec, WavWriter};

use super::capture::{AudioArtifact, PcmBuffer};
use super::file::decode_container;
use crate::error::{EngineError, EngineResult};

/// MIME type of every encoded artifact
pub const CONTENT_TYPE: &str = "audio/wav";

/// Immutable encoded WAV file
#[derive(Debug, Clone, PartialEq)]
pub struct WavBlob {
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
    /// Number of mono sample frames in the data chunk
    pub frames: usize,
}

impl WavBlob {
    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames as f64 / self.sample_rate as f64
    }
}

/// Convert one float sample to signed 16-bit
///
/// Positive values scale by 32767 and negative by 32768 so that both
/// full-scale endpoints map onto the ends of the i16 range.
pub fn float_to_i16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Decode (if needed), down-mix to mono and encode as 16-bit PCM WAV
pub fn encode(artifact: &AudioArtifact) -> EngineResult<WavBlob> {
    match artifact {
        AudioArtifact::Pcm(pcm) => encode_pcm(pcm),
        AudioArtifact::Container { bytes, extension } => {
            let pcm = decode_container(bytes, extension.as_deref())?;
            encode_pcm(&pcm)
        }
    }
}

/// Encode interleaved PCM of any channel count as mono 16-bit WAV
pub fn encode_pcm(pcm: &PcmBuffer) -> EngineResult<WavBlob> {
    if pcm.sample_rate == 0 {
        return Err(EngineError::Audio("sample rate is zero".to_string()));
    }

    let mono = pcm.to_mono();
    let spec = WavSpec {
        channels: 1,
        sample_rate: pcm.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + mono.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| EngineError::Audio(format!("Failed to create WAV writer: {}", e)))?;
        for &sample in &mono {
            writer
                .write_sample(float_to_i16(sample))
                .map_err(|e| EngineError::Audio(format!("Failed to write sample: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| EngineError::Audio(format!("Failed to finalize WAV: {}", e)))?;
    }

    Ok(WavBlob {
        bytes: cursor.into_inner(),
        sample_rate: pcm.sample_rate,
        frames: mono.len(),
    })
}
