use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::local::{ClockOffset, LocalClock};
use crate::error::{EngineError, EngineResult};

/// Body of the reference clock endpoint: `{ "now": <epoch ms> }`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReferenceTime {
    pub now: i64,
}

/// Authoritative time source queried over the network
#[async_trait::async_trait]
pub trait ReferenceClock: Send + Sync {
    /// Current reference instant in epoch milliseconds
    async fn now_ms(&self) -> Result<i64>;
}

/// Reference clock served over HTTP (`GET url → { "now": ... }`)
pub struct HttpReferenceClock {
    client: reqwest::Client,
    url: String,
}

impl HttpReferenceClock {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl ReferenceClock for HttpReferenceClock {
    async fn now_ms(&self) -> Result<i64> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await
            .context("Reference clock request failed")?
            .error_for_status()
            .context("Reference clock returned an error status")?;

        let body: ReferenceTime = response
            .json()
            .await
            .context("Reference clock returned an invalid body")?;

        Ok(body.now)
    }
}

/// One round trip against the reference clock (local times in epoch ms)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    pub local_send_ms: f64,
    pub local_receive_ms: f64,
    pub reference_ms: f64,
}

impl ClockSample {
    pub fn round_trip_ms(&self) -> f64 {
        self.local_receive_ms - self.local_send_ms
    }

    /// Offset assuming the reference was read at the local midpoint of the round trip
    pub fn offset_ms(&self) -> f64 {
        self.reference_ms - (self.local_send_ms + self.round_trip_ms() / 2.0)
    }
}

/// Median of per-sample offsets; the upper median for even counts
pub fn median_offset(samples: &[ClockSample]) -> Option<ClockOffset> {
    if samples.is_empty() {
        return None;
    }

    let mut offsets: Vec<f64> = samples.iter().map(ClockSample::offset_ms).collect();
    offsets.sort_by(|a, b| a.total_cmp(b));
    Some(ClockOffset::from_millis(offsets[offsets.len() / 2]))
}

/// Round-trip sampling estimator
#[derive(Debug, Clone)]
pub struct OffsetEstimator {
    samples: usize,
}

impl Default for OffsetEstimator {
    fn default() -> Self {
        Self { samples: 7 }
    }
}

impl OffsetEstimator {
    pub fn new(samples: usize) -> Self {
        Self {
            samples: samples.max(1),
        }
    }

    /// Take `samples` sequential round trips and return the median offset
    ///
    /// Failed round trips are dropped without retry. Fewer than two successes
    /// is a [`EngineError::ClockSyncFailed`].
    pub async fn estimate(
        &self,
        reference: &dyn ReferenceClock,
        local: &LocalClock,
    ) -> EngineResult<ClockOffset> {
        let mut collected = Vec::with_capacity(self.samples);

        for i in 0..self.samples {
            let local_send_ms = local.now_ms();
            let result = reference.now_ms().await;
            let local_receive_ms = local.now_ms();

            match result {
                Ok(reference_ms) => {
                    let sample = ClockSample {
                        local_send_ms,
                        local_receive_ms,
                        reference_ms: reference_ms as f64,
                    };
                    debug!(
                        "Clock sample {}: rtt={:.1}ms offset={:.1}ms",
                        i,
                        sample.round_trip_ms(),
                        sample.offset_ms()
                    );
                    collected.push(sample);
                }
                Err(e) => warn!("Clock sample {} failed: {:#}", i, e),
            }
        }

        if collected.len() < 2 {
            return Err(EngineError::ClockSyncFailed {
                succeeded: collected.len(),
                attempted: self.samples,
            });
        }

        let offset = median_offset(&collected).ok_or(EngineError::ClockSyncFailed {
            succeeded: 0,
            attempted: self.samples,
        })?;

        info!(
            "Clock offset {:+.1}ms from {}/{} samples",
            offset.as_millis(),
            collected.len(),
            self.samples
        );

        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_offset_uses_midpoint() {
        let sample = ClockSample {
            local_send_ms: 1000.0,
            local_receive_ms: 1040.0,
            reference_ms: 1520.0,
        };
        assert_eq!(sample.round_trip_ms(), 40.0);
        assert_eq!(sample.offset_ms(), 500.0);
    }

    #[test]
    fn test_median_of_even_count_is_upper() {
        let samples: Vec<ClockSample> = [4.0, 1.0, 3.0, 2.0]
            .iter()
            .map(|&offset| ClockSample {
                local_send_ms: 0.0,
                local_receive_ms: 0.0,
                reference_ms: offset,
            })
            .collect();
        assert_eq!(median_offset(&samples), Some(ClockOffset::from_millis(3.0)));
        assert_eq!(median_offset(&[]), None);
    }
}
