//! Reference clock synchronization and aligned scheduling

mod local;
mod offset;
mod scheduler;

pub use local::{ClockOffset, LocalClock, ReferenceTimeline};
pub use offset::{
    median_offset, ClockSample, HttpReferenceClock, OffsetEstimator, ReferenceClock, ReferenceTime,
};
pub use scheduler::{AlignedScheduler, FireReport, SchedulerConfig};
