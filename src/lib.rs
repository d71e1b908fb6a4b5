pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod nats;
pub mod session;
pub mod trigger;

pub use audio::{
    AudioArtifact, AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFile, AudioFrame,
    AudioSource, Capture, OpenBackend, PcmBuffer, WavBlob,
};
pub use clock::{
    AlignedScheduler, ClockOffset, HttpReferenceClock, LocalClock, OffsetEstimator,
    ReferenceClock, ReferenceTimeline, SchedulerConfig,
};
pub use config::Config;
pub use error::{EngineError, EngineResult};
pub use http::{create_router, AppState};
pub use nats::{NatsBlobStore, NatsClient, NatsSessionStore};
pub use session::{
    BlobStore, MemoryBlobStore, MemorySessionStore, SessionConfig, SessionDoc, SessionHandle,
    SessionOutcome, SessionRunner, SessionServices, SessionState, SessionStats, SessionStore,
    TriggerMode,
};
pub use trigger::{DetectorConfig, TriggerDetector, TriggerEvent, TriggerListener, TriggerSource};
