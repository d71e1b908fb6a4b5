//! Engine error types

use thiserror::Error;

/// Errors raised by the recording engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Fewer than two reference clock samples succeeded
    #[error("Clock sync failed: {succeeded} of {attempted} reference samples succeeded")]
    ClockSyncFailed { succeeded: usize, attempted: usize },

    /// Microphone access was refused or the input stream could not be opened
    #[error("Microphone permission denied: {0}")]
    MicrophonePermissionDenied(String),

    /// No input device is available (or live capture is not compiled in)
    #[error("No audio input device available: {0}")]
    NoInputDevice(String),

    /// A captured container could not be converted to linear PCM
    #[error("Failed to decode captured audio: {0}")]
    DecodeFailure(String),

    /// The blob store rejected the artifact
    #[error("Upload failed: {0}")]
    UploadFailure(String),

    /// Session store transport or storage error
    #[error("Session store error: {0}")]
    Store(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Scheduled start is already set for the current generation
    #[error("Session {id} already scheduled for generation {generation}")]
    ScheduleLocked { id: String, generation: u32 },

    /// The owning session ended before the operation completed
    #[error("Operation cancelled by session teardown")]
    Cancelled,

    /// Audio stream error during capture
    #[error("Audio error: {0}")]
    Audio(String),
}

impl EngineError {
    /// Whether the session may stay in `AwaitingTrigger` and retry later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::MicrophonePermissionDenied(_)
                | EngineError::NoInputDevice(_)
                | EngineError::Audio(_)
        )
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
