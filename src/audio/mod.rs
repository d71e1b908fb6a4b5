pub mod backend;
pub mod blocks;
pub mod capture;
pub mod features;
pub mod file;
pub mod wav;

#[cfg(feature = "microphone")]
pub mod microphone;

pub use backend::{AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFrame, AudioSource, OpenBackend};
pub use blocks::BlockAccumulator;
pub use capture::{AudioArtifact, Capture, PcmBuffer};
pub use features::{SpectralExtractor, SpectralFrame};
pub use file::{decode_container, AudioFile, FileBackend};
pub use wav::WavBlob;
