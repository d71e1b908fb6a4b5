use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Signed offset of the reference clock relative to the local clock (reference − local)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ClockOffset {
    millis: f64,
}

impl ClockOffset {
    pub const ZERO: ClockOffset = ClockOffset { millis: 0.0 };

    pub fn from_millis(millis: f64) -> Self {
        Self { millis }
    }

    pub fn as_millis(&self) -> f64 {
        self.millis
    }
}

/// Local wall clock derived from the monotonic clock
///
/// The wall time is sampled once; every later reading is the anchor plus
/// monotonic elapsed time, so NTP steps on the host cannot move a deadline.
#[derive(Debug, Clone, Copy)]
pub struct LocalClock {
    anchor_wall_ms: f64,
    anchor: Instant,
}

impl LocalClock {
    pub fn system() -> Self {
        Self {
            anchor_wall_ms: Utc::now().timestamp_micros() as f64 / 1000.0,
            anchor: Instant::now(),
        }
    }

    /// Pin `wall_ms` (epoch milliseconds) to `anchor`
    pub fn anchored(wall_ms: f64, anchor: Instant) -> Self {
        Self {
            anchor_wall_ms: wall_ms,
            anchor,
        }
    }

    /// Current local wall time in epoch milliseconds
    pub fn now_ms(&self) -> f64 {
        self.wall_ms_at(Instant::now())
    }

    pub fn wall_ms_at(&self, instant: Instant) -> f64 {
        if instant >= self.anchor {
            self.anchor_wall_ms + (instant - self.anchor).as_secs_f64() * 1000.0
        } else {
            self.anchor_wall_ms - (self.anchor - instant).as_secs_f64() * 1000.0
        }
    }

    /// Monotonic instant at which the local wall clock reads `wall_ms`
    pub fn instant_at(&self, wall_ms: f64) -> Instant {
        let delta_ms = wall_ms - self.anchor_wall_ms;
        if delta_ms >= 0.0 {
            self.anchor + Duration::from_secs_f64(delta_ms / 1000.0)
        } else {
            self.anchor
                .checked_sub(Duration::from_secs_f64(-delta_ms / 1000.0))
                .unwrap_or(self.anchor)
        }
    }
}

/// Local clock plus the offset that maps it onto the reference clock
#[derive(Debug, Clone, Copy)]
pub struct ReferenceTimeline {
    local: LocalClock,
    offset: ClockOffset,
    synced: bool,
}

impl ReferenceTimeline {
    /// Timeline backed by a measured offset
    pub fn synced(local: LocalClock, offset: ClockOffset) -> Self {
        Self {
            local,
            offset,
            synced: true,
        }
    }

    /// Local-clock-only timeline used when the reference could not be reached
    pub fn unsynced(local: LocalClock) -> Self {
        Self {
            local,
            offset: ClockOffset::ZERO,
            synced: false,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn offset(&self) -> ClockOffset {
        self.offset
    }

    pub fn reference_now_ms(&self) -> f64 {
        self.local.now_ms() + self.offset.as_millis()
    }

    /// Milliseconds until `reference_ms` (negative once it has passed)
    pub fn remaining_ms(&self, reference_ms: i64) -> f64 {
        reference_ms as f64 - self.reference_now_ms()
    }

    /// Local monotonic deadline equivalent to a reference-clock instant
    pub fn deadline_for(&self, reference_ms: i64) -> Instant {
        self.local
            .instant_at(reference_ms as f64 - self.offset.as_millis())
    }
}
