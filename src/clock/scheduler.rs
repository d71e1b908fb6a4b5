use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::local::ReferenceTimeline;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Coarse sleep ends this long before the deadline
    pub coarse_lead: Duration,
    /// Coarse lead used when the timeline is not synced to the reference
    pub fallback_lead: Duration,
    /// Poll period of the fine phase
    pub frame_tick: Duration,
    /// Busy-wait for the final stretch; zero disables spinning
    pub spin_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            coarse_lead: Duration::from_millis(30),
            fallback_lead: Duration::from_millis(250),
            frame_tick: Duration::from_millis(16),
            spin_window: Duration::from_millis(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FireReport {
    pub deadline: Instant,
    pub fired_at: Instant,
}

impl FireReport {
    pub fn overshoot(&self) -> Duration {
        self.fired_at.saturating_duration_since(self.deadline)
    }
}

/// Fires at a precise monotonic deadline despite coarse timer granularity
///
/// Phases: one coarse sleep to `deadline - lead`, frame-sized polls, then a
/// spin over the last `spin_window`. Never fires before the deadline.
#[derive(Debug, Clone, Default)]
pub struct AlignedScheduler {
    config: SchedulerConfig,
}

impl AlignedScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Coarse lead for a timeline; unsynced timelines get the wider margin
    pub fn lead_for(&self, timeline: &ReferenceTimeline) -> Duration {
        if timeline.is_synced() {
            self.config.coarse_lead
        } else {
            self.config.fallback_lead
        }
    }

    /// Wait until `target_reference_ms` on the reference clock
    pub async fn wait_for_reference(
        &self,
        target_reference_ms: i64,
        timeline: &ReferenceTimeline,
        cancel: &CancellationToken,
    ) -> EngineResult<FireReport> {
        let deadline = timeline.deadline_for(target_reference_ms);
        self.wait_until(deadline, self.lead_for(timeline), cancel).await
    }

    /// Run `action` at `target_reference_ms`, unless cancelled first
    pub async fn fire_at<F, T>(
        &self,
        target_reference_ms: i64,
        timeline: &ReferenceTimeline,
        cancel: &CancellationToken,
        action: F,
    ) -> EngineResult<T>
    where
        F: FnOnce(FireReport) -> T,
    {
        let report = self
            .wait_for_reference(target_reference_ms, timeline, cancel)
            .await?;
        Ok(action(report))
    }

    /// Wait for a local monotonic deadline
    pub async fn wait_until(
        &self,
        deadline: Instant,
        lead: Duration,
        cancel: &CancellationToken,
    ) -> EngineResult<FireReport> {
        // Coarse phase
        if let Some(wake) = deadline.checked_sub(lead) {
            if wake > Instant::now() {
                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => {}
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                }
            }
        }

        // Fine phase
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let remaining = deadline - now;
            if remaining <= self.config.spin_window {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                while Instant::now() < deadline {
                    std::hint::spin_loop();
                }
                break;
            }

            let nap = (remaining - self.config.spin_window).min(self.config.frame_tick);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }

        let report = FireReport {
            deadline,
            fired_at: Instant::now(),
        };
        debug!("Aligned fire, overshoot {:?}", report.overshoot());

        Ok(report)
    }
}
