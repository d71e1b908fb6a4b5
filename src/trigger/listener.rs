use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::detector::{DetectorConfig, DetectorEvent, TriggerDetector};
use super::TriggerEvent;
use crate::audio::{AudioBackend, BlockAccumulator};
use crate::error::EngineResult;

/// Live acoustic trigger: backend → blocks → extractor → detector
///
/// The listener owns its backend. The backend is stopped when the listener is
/// stopped, when its stream ends, or when the trigger channel closes.
pub struct TriggerListener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TriggerListener {
    pub async fn start(
        mut backend: Box<dyn AudioBackend>,
        config: DetectorConfig,
        triggers: mpsc::Sender<TriggerEvent>,
        status: Option<mpsc::UnboundedSender<DetectorEvent>>,
    ) -> EngineResult<Self> {
        let mut audio_rx = backend.start().await?;
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        info!("Trigger listener started on {}", backend.name());

        let task = tokio::spawn(async move {
            let mut blocks = BlockAccumulator::new(config.block_size);
            let mut detector: Option<TriggerDetector> = None;

            loop {
                let frame = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    frame = audio_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => {
                            warn!("Audio stream ended; trigger listener exiting");
                            break;
                        }
                    },
                };

                if detector.as_ref().map(|d| d.sample_rate()) != Some(frame.sample_rate) {
                    detector = Some(
                        TriggerDetector::new(config.clone(), frame.sample_rate)
                            .with_status(status.clone()),
                    );
                    blocks.clear();
                }

                let mut fired = None;
                if let Some(detector) = detector.as_mut() {
                    blocks.push(&frame, |block, at| {
                        if fired.is_none() {
                            fired = detector.process_block(block, at);
                        }
                    });
                }

                if let Some(event) = fired {
                    info!("Acoustic trigger detected");
                    if triggers.send(event).await.is_err() {
                        break;
                    }
                }
            }

            if let Err(e) = backend.stop().await {
                error!("Failed to stop listener backend: {}", e);
            }
            info!("Trigger listener stopped");
        });

        Ok(Self { cancel, task })
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop listening and wait until the backend has been released
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Trigger listener task failed: {}", e);
        }
    }
}
