// Shared fakes for integration tests
//
// Scripted audio input, a flaky blob store and a scripted reference clock.

#![allow(dead_code)]

use std::f32::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use soundmark::audio::{AudioBackend, AudioFrame, OpenBackend};
use soundmark::clock::{LocalClock, ReferenceClock};
use soundmark::error::{EngineError, EngineResult};
use soundmark::session::{BlobHandle, BlobStore, MemoryBlobStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const SAMPLE_RATE: u32 = 16000;
pub const FRAME_LEN: usize = 2048;

/// Sine tone
pub fn tone(freq_hz: f32, amplitude: f32, len: usize, sample_rate: u32) -> Vec<f32> {
    (0..len)
        .map(|i| amplitude * (2.0 * PI * freq_hz * i as f32 / sample_rate as f32).sin())
        .collect()
}

/// Frame index → samples
pub type Script = Arc<dyn Fn(usize) -> Vec<f32> + Send + Sync>;

pub fn silence() -> Script {
    Arc::new(|_| vec![0.0; FRAME_LEN])
}

/// Horn bursts (500 Hz, 0.8) on the listed frame indices, silence elsewhere
pub fn horn_at(frames: &'static [usize]) -> Script {
    Arc::new(move |index| {
        if frames.contains(&index) {
            tone(500.0, 0.8, FRAME_LEN, SAMPLE_RATE)
        } else {
            vec![0.0; FRAME_LEN]
        }
    })
}

/// Tracks how many backends hold the input at once
#[derive(Default)]
pub struct InputGauge {
    open: AtomicUsize,
    max_open: AtomicUsize,
    opened: AtomicUsize,
}

impl InputGauge {
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn acquire(&self) {
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mono backend producing one scripted frame per frame period
pub struct ScriptedBackend {
    script: Script,
    gauge: Arc<InputGauge>,
    task: Option<JoinHandle<()>>,
}

#[async_trait::async_trait]
impl AudioBackend for ScriptedBackend {
    async fn start(&mut self) -> EngineResult<mpsc::Receiver<AudioFrame>> {
        let (tx, rx) = mpsc::channel(64);
        let script = self.script.clone();
        let period = Duration::from_secs_f64(FRAME_LEN as f64 / SAMPLE_RATE as f64);

        self.gauge.acquire();
        self.task = Some(tokio::spawn(async move {
            let mut index = 0;
            loop {
                let frame = AudioFrame {
                    samples: script(index),
                    sample_rate: SAMPLE_RATE,
                    channels: 1,
                    captured_at: Instant::now(),
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
                index += 1;
                tokio::time::sleep(period).await;
            }
        }));

        Ok(rx)
    }

    async fn stop(&mut self) -> EngineResult<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            self.gauge.release();
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Hands out scripted backends; the first `deny_first` opens are refused
pub struct ScriptedInput {
    pub script: Script,
    pub gauge: Arc<InputGauge>,
    deny_first: AtomicUsize,
}

impl ScriptedInput {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            gauge: Arc::new(InputGauge::default()),
            deny_first: AtomicUsize::new(0),
        }
    }

    pub fn denying(self, count: usize) -> Self {
        self.deny_first.store(count, Ordering::SeqCst);
        self
    }
}

impl OpenBackend for ScriptedInput {
    fn open(&self) -> EngineResult<Box<dyn AudioBackend>> {
        let denied = self
            .deny_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if denied {
            return Err(EngineError::MicrophonePermissionDenied(
                "denied by test".to_string(),
            ));
        }

        Ok(Box::new(ScriptedBackend {
            script: self.script.clone(),
            gauge: self.gauge.clone(),
            task: None,
        }))
    }
}

/// Blob store that rejects the first `failures` uploads
pub struct FlakyBlobStore {
    pub inner: MemoryBlobStore,
    failures: AtomicUsize,
}

impl FlakyBlobStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: MemoryBlobStore::new("artifacts", "https://blobs.test"),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for FlakyBlobStore {
    async fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> EngineResult<BlobHandle> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(EngineError::UploadFailure("503 from blob store".to_string()));
        }
        self.inner.upload(path, bytes, content_type).await
    }

    fn public_url(&self, handle: &BlobHandle) -> String {
        self.inner.public_url(handle)
    }
}

/// One scripted round trip against the fake reference
#[derive(Debug, Clone, Copy)]
pub enum RoundTrip {
    /// Delay before and after the reference reads its clock
    Ok { before: Duration, after: Duration },
    Fail,
}

impl RoundTrip {
    pub fn symmetric(ms: u64) -> Self {
        RoundTrip::Ok {
            before: Duration::from_millis(ms),
            after: Duration::from_millis(ms),
        }
    }
}

/// Reference clock running `offset_ms` ahead of `local`
pub struct ScriptedReference {
    local: LocalClock,
    offset_ms: i64,
    script: Vec<RoundTrip>,
    calls: AtomicUsize,
}

impl ScriptedReference {
    pub fn new(local: LocalClock, offset_ms: i64, script: Vec<RoundTrip>) -> Self {
        Self {
            local,
            offset_ms,
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ReferenceClock for ScriptedReference {
    async fn now_ms(&self) -> anyhow::Result<i64> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .get(call % self.script.len().max(1))
            .copied()
            .unwrap_or(RoundTrip::Fail);

        match step {
            RoundTrip::Fail => anyhow::bail!("connection refused"),
            RoundTrip::Ok { before, after } => {
                tokio::time::sleep(before).await;
                let now = self.local.now_ms().round() as i64 + self.offset_ms;
                tokio::time::sleep(after).await;
                Ok(now)
            }
        }
    }
}
