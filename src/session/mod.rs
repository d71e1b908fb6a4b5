//! Recording session management
//!
//! This module provides:
//! - The shared session document and its store boundary
//! - The per-participant state machine
//! - `SessionRunner`, which drives the state machine from scheduled,
//!   acoustic and manual triggers through capture and upload

mod config;
mod model;
mod runner;
mod state;
mod stats;
mod store;

pub use config::{SessionConfig, TriggerMode};
pub use model::{
    artifact_name, now_ms, slugify, start_after, EventKind, Participant, SessionDoc, SessionEvent, SessionPatch,
};
pub use runner::{
    upload_artifact, SessionHandle, SessionOutcome, SessionRunner, SessionServices, UploadReceipt,
};
pub use state::{SessionMachine, SessionState, TransitionError};
pub use stats::{SessionStats, SessionUpdate};
pub use store::{
    BlobHandle, BlobStore, MemoryBlobStore, MemorySessionStore, SessionStore, SessionSubscription,
    StoredBlob,
};
