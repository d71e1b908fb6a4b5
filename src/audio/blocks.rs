use std::time::Duration;

use tokio::time::Instant;

use super::backend::AudioFrame;

/// Re-chunks interleaved frames of any size into fixed-size mono blocks
///
/// The internal buffer is allocated once; pushing frames never allocates.
pub struct BlockAccumulator {
    block: Vec<f32>,
    filled: usize,
    /// Instant of the pending block's first sample
    started_at: Instant,
}

impl BlockAccumulator {
    pub fn new(block_size: usize) -> Self {
        Self {
            block: vec![0.0; block_size.max(1)],
            filled: 0,
            started_at: Instant::now(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block.len()
    }

    /// Down-mix `frame` into the pending block and call `on_block` for every
    /// block completed, stamped with the instant of the block's first sample.
    ///
    /// A block that spans frames keeps the time it started at in the earlier one.
    pub fn push<F>(&mut self, frame: &AudioFrame, mut on_block: F)
    where
        F: FnMut(&[f32], Instant),
    {
        let channels = frame.channels.max(1) as usize;
        let sample_rate = frame.sample_rate.max(1) as f64;
        for (index, chunk) in frame.samples.chunks_exact(channels).enumerate() {
            if self.filled == 0 {
                self.started_at =
                    frame.captured_at + Duration::from_secs_f64(index as f64 / sample_rate);
            }

            let sample = if channels == 1 {
                chunk[0]
            } else {
                chunk.iter().sum::<f32>() / channels as f32
            };

            self.block[self.filled] = sample;
            self.filled += 1;

            if self.filled == self.block.len() {
                on_block(&self.block, self.started_at);
                self.filled = 0;
            }
        }
    }

    /// Drop any partial block
    pub fn clear(&mut self) {
        self.filled = 0;
    }
}
