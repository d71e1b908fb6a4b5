// Integration tests for the session runner
//
// Each test drives a participant through a whole session against in-memory
// stores and scripted audio, in paused time.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{horn_at, silence, FlakyBlobStore, RoundTrip, ScriptedInput, ScriptedReference};
use soundmark::clock::{LocalClock, ReferenceClock, SchedulerConfig};
use soundmark::error::EngineError;
use soundmark::session::{
    BlobStore, EventKind, MemoryBlobStore, MemorySessionStore, SessionConfig, SessionDoc,
    SessionPatch, SessionRunner, SessionServices, SessionState, SessionStore, SessionUpdate,
    TriggerMode,
};
use soundmark::trigger::TriggerSource;
use tokio::sync::broadcast;
use tokio::time::Instant;

const SESSION: &str = "harbor";
const PARTICIPANT: &str = "a1";
const WALL_ANCHOR_MS: i64 = 1_700_000_000_000;

fn config(mode: TriggerMode) -> SessionConfig {
    SessionConfig {
        session_id: SESSION.to_string(),
        session_name: Some("Harbor Walk".to_string()),
        participant: PARTICIPANT.to_string(),
        mode,
        scheduler: SchedulerConfig {
            spin_window: Duration::ZERO,
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Fixture {
    sessions: Arc<MemorySessionStore>,
    input: Arc<ScriptedInput>,
    services: SessionServices,
}

fn fixture(
    input: ScriptedInput,
    blobs: Arc<dyn BlobStore>,
    reference: Option<Arc<dyn ReferenceClock>>,
) -> Fixture {
    let sessions = Arc::new(MemorySessionStore::new());
    let input = Arc::new(input);
    let services = SessionServices {
        sessions: sessions.clone(),
        blobs,
        input: input.clone(),
        reference,
    };
    Fixture {
        sessions,
        input,
        services,
    }
}

fn memory_blobs() -> Arc<MemoryBlobStore> {
    Arc::new(MemoryBlobStore::new("artifacts", "https://blobs.test"))
}

/// Every state published so far, with the instant it was entered
fn drain_states(updates: &mut broadcast::Receiver<SessionUpdate>) -> Vec<(SessionState, Instant)> {
    let mut states = Vec::new();
    while let Ok(update) = updates.try_recv() {
        if let SessionUpdate::State { state, at } = update {
            states.push((state, at));
        }
    }
    states
}

async fn wait_for_state<F>(updates: &mut broadcast::Receiver<SessionUpdate>, wanted: F) -> Result<()>
where
    F: Fn(&SessionState) -> bool,
{
    let wait = async {
        loop {
            if let SessionUpdate::State { state, .. } = updates.recv().await? {
                if wanted(&state) {
                    return Ok::<(), anyhow::Error>(());
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), wait).await?
}

fn countdown_steps(states: &[(SessionState, Instant)]) -> Vec<(u32, Instant)> {
    states
        .iter()
        .filter_map(|(state, at)| match state {
            SessionState::Countdown { remaining } => Some((*remaining, *at)),
            _ => None,
        })
        .collect()
}

fn recording_starts(states: &[(SessionState, Instant)]) -> Vec<(TriggerSource, Instant)> {
    states
        .iter()
        .filter_map(|(state, at)| match state {
            SessionState::Recording { source } => Some((*source, *at)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_manual_trigger_records_once() -> Result<()> {
    // Setup
    let blobs = memory_blobs();
    let fx = fixture(ScriptedInput::new(silence()), blobs.clone(), None);
    fx.sessions
        .create(SESSION, SessionDoc::new(SESSION, Some("Harbor Walk".to_string())))
        .await?;

    let runner = SessionRunner::new(config(TriggerMode::Scheduled), fx.services.clone());
    let handle = runner.handle();
    let mut updates = handle.subscribe();
    let task = tokio::spawn(runner.run());

    // Two operators press record at the same moment
    handle.trigger(TriggerSource::Manual)?;
    handle.trigger(TriggerSource::Manual)?;

    let outcome = task.await?;

    // Verify: exactly one recording, one refused trigger
    assert_eq!(
        outcome.state,
        SessionState::Finished {
            upload_succeeded: true
        }
    );
    assert_eq!(outcome.triggered_by, Some(TriggerSource::Manual));
    assert!(!outcome.left_early);

    let recorded_for = outcome.recorded_for.expect("recording length");
    assert!(recorded_for >= Duration::from_secs(15));
    assert!(recorded_for < Duration::from_secs(15) + Duration::from_millis(5));

    let mut ignored = 0;
    let mut recordings = 0;
    while let Ok(update) = updates.try_recv() {
        match update {
            SessionUpdate::TriggerIgnored { source, .. } => {
                assert_eq!(source, TriggerSource::Manual);
                ignored += 1;
            }
            SessionUpdate::State {
                state: SessionState::Recording { .. },
                ..
            } => recordings += 1,
            _ => {}
        }
    }
    assert_eq!(recordings, 1);
    assert_eq!(ignored, 1);

    // Verify: artifact stored under the session slug and participant
    let upload = outcome.upload.expect("upload receipt");
    assert!(upload.path.starts_with("harbor-walk_a1_"), "{}", upload.path);
    assert!(upload.path.ends_with(".wav"));
    assert_eq!(upload.url, format!("https://blobs.test/artifacts/{}", upload.path));

    let stored = blobs.get(&upload.path).await.expect("blob stored");
    assert_eq!(stored.content_type, "audio/wav");
    assert_eq!(&stored.bytes[0..4], b"RIFF");

    let doc = fx.sessions.get(SESSION).await?.expect("session exists");
    let kinds: Vec<EventKind> = doc.events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Created,
            EventKind::Joined,
            EventKind::Triggered,
            EventKind::Uploaded,
            EventKind::Finished,
        ]
    );
    assert!(doc.participants.contains_key(PARTICIPANT));

    assert!(handle.is_finished());
    assert_eq!(handle.status().upload_url, Some(upload.url));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_countdown_then_recording() -> Result<()> {
    // Setup: start 10s ahead on a device clock anchored at WALL_ANCHOR_MS
    let anchor = Instant::now();
    let local = LocalClock::anchored(WALL_ANCHOR_MS as f64, anchor);
    let fx = fixture(ScriptedInput::new(silence()), memory_blobs(), None);
    fx.sessions
        .create(SESSION, SessionDoc::new(SESSION, None).scheduled(WALL_ANCHOR_MS + 10_000))
        .await?;

    let mut cfg = config(TriggerMode::Scheduled);
    cfg.recording_duration = Duration::from_secs(2);
    let runner = SessionRunner::new(cfg, fx.services.clone()).with_local_clock(local);
    let mut updates = runner.handle().subscribe();

    let outcome = runner.run().await;
    let states = drain_states(&mut updates);

    // Verify: 10..1 on whole seconds, then recording exactly at the start
    let steps = countdown_steps(&states);
    let remaining: Vec<u32> = steps.iter().map(|(r, _)| *r).collect();
    assert_eq!(remaining, (1..=10).rev().collect::<Vec<u32>>());
    for (r, at) in &steps {
        assert_eq!(*at - anchor, Duration::from_secs(10 - *r as u64));
    }

    let starts = recording_starts(&states);
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].0, TriggerSource::Scheduled);
    assert_eq!(starts[0].1 - anchor, Duration::from_secs(10));

    assert_eq!(outcome.triggered_by, Some(TriggerSource::Scheduled));
    assert!(outcome.upload.is_some());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_countdown_waits_for_threshold() -> Result<()> {
    // Setup: start 45s ahead, polled every 5s, 30s threshold
    let anchor = Instant::now();
    let local = LocalClock::anchored(WALL_ANCHOR_MS as f64, anchor);
    let fx = fixture(ScriptedInput::new(silence()), memory_blobs(), None);
    fx.sessions
        .create(SESSION, SessionDoc::new(SESSION, None).scheduled(WALL_ANCHOR_MS + 45_000))
        .await?;

    let mut cfg = config(TriggerMode::Scheduled);
    cfg.recording_duration = Duration::from_secs(1);
    let runner = SessionRunner::new(cfg, fx.services.clone()).with_local_clock(local);
    let mut updates = runner.handle().subscribe();

    runner.run().await;
    let states = drain_states(&mut updates);

    // Verify: the countdown begins on the poll that finds the start 30s out
    let steps = countdown_steps(&states);
    assert_eq!(steps.len(), 30);
    assert_eq!(steps[0].0, 30);
    assert_eq!(steps[0].1 - anchor, Duration::from_secs(15));

    let starts = recording_starts(&states);
    assert_eq!(starts[0].1 - anchor, Duration::from_secs(45));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_schedule_arrives_through_change_feed() -> Result<()> {
    let anchor = Instant::now();
    let local = LocalClock::anchored(WALL_ANCHOR_MS as f64, anchor);
    let fx = fixture(ScriptedInput::new(silence()), memory_blobs(), None);
    fx.sessions.create(SESSION, SessionDoc::new(SESSION, None)).await?;

    let mut cfg = config(TriggerMode::Scheduled);
    cfg.recording_duration = Duration::from_secs(1);
    cfg.poll_interval = Duration::from_secs(60);
    let runner = SessionRunner::new(cfg, fx.services.clone()).with_local_clock(local);
    let mut updates = runner.handle().subscribe();
    let task = tokio::spawn(runner.run());

    // Another participant schedules the start one second in
    tokio::time::sleep(Duration::from_secs(1)).await;
    fx.sessions
        .update(SESSION, SessionPatch::schedule(WALL_ANCHOR_MS + 6_000))
        .await?;

    task.await?;
    let states = drain_states(&mut updates);

    // Verify: picked up immediately, long before the next poll
    let steps = countdown_steps(&states);
    assert_eq!(steps[0].0, 5);
    assert_eq!(steps[0].1 - anchor, Duration::from_secs(1));
    assert_eq!(recording_starts(&states)[0].1 - anchor, Duration::from_secs(6));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_past_start_records_immediately() -> Result<()> {
    let anchor = Instant::now();
    let local = LocalClock::anchored(WALL_ANCHOR_MS as f64, anchor);
    let fx = fixture(ScriptedInput::new(silence()), memory_blobs(), None);
    fx.sessions
        .create(SESSION, SessionDoc::new(SESSION, None).scheduled(WALL_ANCHOR_MS - 3_000))
        .await?;

    let mut cfg = config(TriggerMode::Scheduled);
    cfg.recording_duration = Duration::from_secs(1);
    let runner = SessionRunner::new(cfg, fx.services.clone()).with_local_clock(local);
    let mut updates = runner.handle().subscribe();

    let outcome = runner.run().await;
    let states = drain_states(&mut updates);

    assert!(countdown_steps(&states).is_empty());
    let starts = recording_starts(&states);
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].1, anchor);
    assert_eq!(outcome.triggered_by, Some(TriggerSource::Scheduled));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_synced_clock_aligns_to_reference() -> Result<()> {
    // Setup: the reference runs 2s ahead of this device
    let anchor = Instant::now();
    let local = LocalClock::anchored(WALL_ANCHOR_MS as f64, anchor);
    let reference = Arc::new(ScriptedReference::new(
        local,
        2_000,
        vec![RoundTrip::symmetric(10)],
    ));
    let fx = fixture(ScriptedInput::new(silence()), memory_blobs(), Some(reference));
    let start = WALL_ANCHOR_MS + 2_000 + 5_000;
    fx.sessions
        .create(SESSION, SessionDoc::new(SESSION, None).scheduled(start))
        .await?;

    let mut cfg = config(TriggerMode::Scheduled);
    cfg.recording_duration = Duration::from_secs(1);
    let runner = SessionRunner::new(cfg, fx.services.clone()).with_local_clock(local);
    let handle = runner.handle();
    let mut updates = handle.subscribe();

    runner.run().await;

    let mut synced = None;
    let mut states = Vec::new();
    while let Ok(update) = updates.try_recv() {
        match update {
            SessionUpdate::ClockSynced { offset } => synced = Some(offset),
            SessionUpdate::State { state, at } => states.push((state, at)),
            _ => {}
        }
    }

    // Verify: local deadline is reference start minus the offset
    let offset = synced.expect("clock synced");
    assert!((offset.as_millis() - 2_000.0).abs() < 0.01);
    assert!(handle.status().clock_synced);

    let fired = recording_starts(&states)[0].1 - anchor;
    assert!(fired >= Duration::from_secs(5));
    assert!(fired <= Duration::from_secs(5) + Duration::from_millis(2));
    assert_eq!(countdown_steps(&states)[0].0, 5);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_clock_sync_failure_still_counts_down() -> Result<()> {
    let anchor = Instant::now();
    let local = LocalClock::anchored(WALL_ANCHOR_MS as f64, anchor);
    let reference = Arc::new(ScriptedReference::new(local, 0, vec![RoundTrip::Fail]));
    let fx = fixture(ScriptedInput::new(silence()), memory_blobs(), Some(reference));
    fx.sessions
        .create(SESSION, SessionDoc::new(SESSION, None).scheduled(WALL_ANCHOR_MS + 5_000))
        .await?;

    let mut cfg = config(TriggerMode::Scheduled);
    cfg.recording_duration = Duration::from_secs(1);
    let runner = SessionRunner::new(cfg, fx.services.clone()).with_local_clock(local);
    let handle = runner.handle();
    let mut updates = handle.subscribe();

    let outcome = runner.run().await;

    let mut sync_failed = false;
    let mut states = Vec::new();
    while let Ok(update) = updates.try_recv() {
        match update {
            SessionUpdate::ClockSyncFailed { .. } => sync_failed = true,
            SessionUpdate::State { state, at } => states.push((state, at)),
            _ => {}
        }
    }

    // Verify: local clock used with the wider margin, start still honored
    assert!(sync_failed);
    assert!(!handle.status().clock_synced);
    assert_eq!(
        countdown_steps(&states)
            .iter()
            .map(|(r, _)| *r)
            .collect::<Vec<_>>(),
        vec![5, 4, 3, 2, 1]
    );
    assert_eq!(recording_starts(&states)[0].1 - anchor, Duration::from_secs(5));
    assert_eq!(
        outcome.state,
        SessionState::Finished {
            upload_succeeded: true
        }
    );

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_upload_keeps_artifact_for_retry() -> Result<()> {
    // Setup: the blob store rejects the first upload
    let blobs = Arc::new(FlakyBlobStore::new(1));
    let fx = fixture(ScriptedInput::new(silence()), blobs.clone(), None);

    let mut cfg = config(TriggerMode::Scheduled);
    cfg.recording_duration = Duration::from_secs(3);
    let runner = SessionRunner::new(cfg, fx.services.clone());
    let handle = runner.handle();
    let task = tokio::spawn(runner.run());
    handle.trigger(TriggerSource::Manual)?;

    let mut outcome = task.await?;

    // Verify: finished without upload, WAV retained
    assert_eq!(
        outcome.state,
        SessionState::Finished {
            upload_succeeded: false
        }
    );
    assert!(matches!(outcome.failure, Some(EngineError::UploadFailure(_))));
    let retained = outcome.retained.clone().expect("artifact retained");
    assert!((retained.duration_seconds() - 3.0).abs() < 0.2);
    let path = outcome.artifact_path.clone().expect("artifact path");
    assert!(blobs.inner.get(&path).await.is_none());

    // Retry succeeds under the same name
    let receipt = outcome.retry_upload(&fx.services).await?.clone();
    assert_eq!(receipt.path, path);
    assert_eq!(
        outcome.state,
        SessionState::Finished {
            upload_succeeded: true
        }
    );
    assert!(outcome.retained.is_none());
    assert!(outcome.failure.is_none());

    let stored = blobs.inner.get(&path).await.expect("retried blob stored");
    assert_eq!(stored.bytes, retained.bytes);

    // A second retry has nothing left to upload
    assert!(outcome.retry_upload(&fx.services).await.is_err());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_leave_during_countdown() -> Result<()> {
    let anchor = Instant::now();
    let local = LocalClock::anchored(WALL_ANCHOR_MS as f64, anchor);
    let fx = fixture(ScriptedInput::new(silence()), memory_blobs(), None);
    fx.sessions
        .create(SESSION, SessionDoc::new(SESSION, None).scheduled(WALL_ANCHOR_MS + 10_000))
        .await?;

    let runner =
        SessionRunner::new(config(TriggerMode::Scheduled), fx.services.clone()).with_local_clock(local);
    let handle = runner.handle();
    let task = tokio::spawn(runner.run());

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(matches!(
        handle.status().state,
        SessionState::Countdown { remaining: 7 }
    ));
    handle.leave();

    let outcome = task.await?;

    // Verify: no recording, participant removed, Left logged
    assert!(outcome.left_early);
    assert!(outcome.upload.is_none());
    assert!(outcome.triggered_by.is_none());
    assert_eq!(fx.input.gauge.opened(), 0);

    let doc = fx.sessions.get(SESSION).await?.expect("session exists");
    assert!(!doc.participants.contains_key(PARTICIPANT));
    assert_eq!(doc.events.last().map(|e| e.kind), Some(EventKind::Left));

    assert!(!handle.is_active());
    assert!(handle.trigger(TriggerSource::Manual).is_err());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_leave_interrupts_clock_sync() -> Result<()> {
    // Setup: every round trip to the reference takes 2s
    let anchor = Instant::now();
    let local = LocalClock::anchored(WALL_ANCHOR_MS as f64, anchor);
    let reference = Arc::new(ScriptedReference::new(
        local,
        0,
        vec![RoundTrip::symmetric(1_000)],
    ));
    let fx = fixture(
        ScriptedInput::new(silence()),
        memory_blobs(),
        Some(reference.clone()),
    );
    fx.sessions
        .create(SESSION, SessionDoc::new(SESSION, None).scheduled(WALL_ANCHOR_MS + 60_000))
        .await?;

    let runner =
        SessionRunner::new(config(TriggerMode::Scheduled), fx.services.clone()).with_local_clock(local);
    let handle = runner.handle();
    let task = tokio::spawn(runner.run());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(reference.calls(), 1);
    handle.leave();

    let outcome = task.await?;

    // Verify: teardown did not wait for the remaining samples
    assert!(outcome.left_early);
    assert!(anchor.elapsed() < Duration::from_secs(1), "took {:?}", anchor.elapsed());
    assert_eq!(reference.calls(), 1);
    assert!(!handle.status().clock_synced);

    let doc = fx.sessions.get(SESSION).await?.expect("session exists");
    assert!(!doc.participants.contains_key(PARTICIPANT));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_leave_during_recording_discards_audio() -> Result<()> {
    let blobs = memory_blobs();
    let fx = fixture(ScriptedInput::new(silence()), blobs.clone(), None);

    let runner = SessionRunner::new(config(TriggerMode::Scheduled), fx.services.clone());
    let handle = runner.handle();
    let mut updates = handle.subscribe();
    let task = tokio::spawn(runner.run());

    handle.trigger(TriggerSource::Manual)?;
    wait_for_state(&mut updates, |s| matches!(s, SessionState::Recording { .. })).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    handle.leave();

    let outcome = task.await?;

    assert!(outcome.left_early);
    assert!(outcome.retained.is_none());
    assert!(blobs.keys().await.is_empty());
    assert_eq!(fx.input.gauge.open(), 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_denied_microphone_recovers() -> Result<()> {
    // Setup: the first input open is refused
    let fx = fixture(ScriptedInput::new(silence()).denying(1), memory_blobs(), None);

    let mut cfg = config(TriggerMode::Scheduled);
    cfg.recording_duration = Duration::from_secs(1);
    let runner = SessionRunner::new(cfg, fx.services.clone());
    let handle = runner.handle();
    let mut updates = handle.subscribe();
    let mut observer = handle.subscribe();
    let task = tokio::spawn(runner.run());

    handle.trigger(TriggerSource::Manual)?;
    wait_for_state(&mut observer, |s| matches!(s, SessionState::Recording { .. })).await?;
    wait_for_state(&mut observer, |s| *s == SessionState::AwaitingTrigger).await?;

    // The participant grants access and tries again
    handle.trigger(TriggerSource::Manual)?;
    let outcome = task.await?;

    let states: Vec<SessionState> = drain_states(&mut updates)
        .into_iter()
        .map(|(state, _)| state)
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::AwaitingTrigger,
            SessionState::Recording {
                source: TriggerSource::Manual
            },
            SessionState::AwaitingTrigger,
            SessionState::Recording {
                source: TriggerSource::Manual
            },
            SessionState::Uploading,
            SessionState::Finished {
                upload_succeeded: true
            },
        ]
    );
    assert!(outcome.failure.is_none());
    assert!(handle
        .status()
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("permission denied"));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_acoustic_trigger_hands_input_to_capture() -> Result<()> {
    // Setup: horn blasts on frames 3 and 10 (~0.9s apart)
    let fx = fixture(ScriptedInput::new(horn_at(&[3, 10])), memory_blobs(), None);

    let mut cfg = config(TriggerMode::Acoustic);
    cfg.recording_duration = Duration::from_secs(2);
    let runner = SessionRunner::new(cfg, fx.services.clone());

    let outcome = runner.run().await;

    // Verify: listener and capture never held the input at the same time
    assert_eq!(outcome.triggered_by, Some(TriggerSource::Acoustic));
    assert!(outcome.upload.is_some());
    assert_eq!(fx.input.gauge.opened(), 2);
    assert_eq!(fx.input.gauge.max_open(), 1);
    assert_eq!(fx.input.gauge.open(), 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_runner_creates_missing_session() -> Result<()> {
    let fx = fixture(ScriptedInput::new(silence()), memory_blobs(), None);

    let mut cfg = config(TriggerMode::Scheduled);
    cfg.recording_duration = Duration::from_secs(1);
    let runner = SessionRunner::new(cfg, fx.services.clone());
    let handle = runner.handle();
    let task = tokio::spawn(runner.run());
    handle.trigger(TriggerSource::Manual)?;
    task.await?;

    let doc = fx.sessions.get(SESSION).await?.expect("session created");
    assert_eq!(doc.name.as_deref(), Some("Harbor Walk"));
    assert_eq!(doc.generation, 1);
    assert_eq!(handle.status().generation, Some(1));

    Ok(())
}
