use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::model::{artifact_name, slugify, EventKind, Participant, SessionDoc, SessionEvent, SessionPatch};
use super::state::{SessionMachine, SessionState, TransitionError};
use super::stats::{SessionStats, SessionUpdate};
use super::store::{BlobHandle, BlobStore, SessionStore, SessionSubscription};
use crate::audio::{wav, AudioArtifact, Capture, OpenBackend, WavBlob};
use crate::clock::{
    AlignedScheduler, FireReport, LocalClock, OffsetEstimator, ReferenceClock, ReferenceTimeline,
};
use crate::error::{EngineError, EngineResult};
use crate::trigger::{DetectorEvent, TriggerEvent, TriggerListener, TriggerSource};

/// External collaborators of a running session
#[derive(Clone)]
pub struct SessionServices {
    pub sessions: Arc<dyn SessionStore>,
    pub blobs: Arc<dyn BlobStore>,
    /// Source of a fresh input backend for the listener and for each capture
    pub input: Arc<dyn OpenBackend>,
    /// `None` runs on the local clock alone
    pub reference: Option<Arc<dyn ReferenceClock>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadReceipt {
    pub path: String,
    pub url: String,
    pub handle: BlobHandle,
}

/// Result of one participant's session
#[derive(Debug)]
pub struct SessionOutcome {
    pub session_id: String,
    pub participant: String,
    pub state: SessionState,
    pub triggered_by: Option<TriggerSource>,
    /// Measured length of the capture window
    pub recorded_for: Option<Duration>,
    /// Blob path chosen for the artifact
    pub artifact_path: Option<String>,
    pub upload: Option<UploadReceipt>,
    /// Encoded WAV kept after a failed upload
    pub retained: Option<WavBlob>,
    pub failure: Option<EngineError>,
    /// Torn down before finishing
    pub left_early: bool,
}

impl SessionOutcome {
    /// Upload the retained artifact again under the same path
    pub async fn retry_upload(&mut self, services: &SessionServices) -> EngineResult<&UploadReceipt> {
        let (Some(blob), Some(path)) = (self.retained.as_ref(), self.artifact_path.as_deref()) else {
            return Err(EngineError::UploadFailure(
                "no retained artifact to upload".to_string(),
            ));
        };

        let receipt = upload_artifact(
            services.sessions.as_ref(),
            services.blobs.as_ref(),
            &self.session_id,
            &self.participant,
            path,
            blob,
        )
        .await?;

        self.retained = None;
        self.failure = None;
        self.state = SessionState::Finished {
            upload_succeeded: true,
        };
        Ok(self.upload.insert(receipt))
    }
}

/// Upload an encoded artifact and record it in the session log
///
/// A failure to append the `Uploaded` event is logged; the blob is already
/// stored at that point.
pub async fn upload_artifact(
    sessions: &dyn SessionStore,
    blobs: &dyn BlobStore,
    session_id: &str,
    participant: &str,
    path: &str,
    blob: &WavBlob,
) -> EngineResult<UploadReceipt> {
    let handle = blobs
        .upload(path, &blob.bytes, blob.content_type())
        .await
        .map_err(|e| match e {
            EngineError::UploadFailure(_) => e,
            other => EngineError::UploadFailure(other.to_string()),
        })?;
    let url = blobs.public_url(&handle);

    info!("Uploaded {} ({} bytes) to {}", path, handle.size, url);

    let event = SessionEvent::new(EventKind::Uploaded)
        .by(participant)
        .with_detail(url.clone());
    if let Err(e) = sessions.append_event(session_id, event).await {
        warn!("Failed to record upload of {}: {}", path, e);
    }

    Ok(UploadReceipt {
        path: path.to_string(),
        url,
        handle,
    })
}

/// Control surface of a running session
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    triggers: mpsc::Sender<TriggerEvent>,
    teardown: CancellationToken,
    status: watch::Receiver<SessionStats>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Request a recording; the session refuses it if one is already underway
    pub fn trigger(&self, source: TriggerSource) -> EngineResult<()> {
        match self.triggers.try_send(TriggerEvent::now(source)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Trigger queue full; dropping {:?} trigger", source);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::Cancelled),
        }
    }

    /// Tear the session down; pending waits and captures are cancelled
    pub fn leave(&self) {
        self.teardown.cancel();
    }

    pub fn status(&self) -> SessionStats {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.status.borrow().state.is_finished()
    }

    /// Neither finished nor torn down
    pub fn is_active(&self) -> bool {
        !self.teardown.is_cancelled() && !self.is_finished()
    }
}

#[derive(Debug, Clone, Copy)]
struct Countdown {
    deadline: Instant,
    remaining: u32,
    tick: Duration,
}

impl Countdown {
    /// Instant of the next tick; the last tick is the aligned fire itself
    fn next_tick(&self) -> Option<Instant> {
        if self.remaining <= 1 {
            return None;
        }
        let ahead = self.tick.checked_mul(self.remaining - 1)?;
        self.deadline.checked_sub(ahead)
    }
}

enum ScheduleAction {
    Wait,
    StartNow,
    /// Teardown arrived while planning
    TornDown,
    Countdown { countdown: Countdown, lead: Duration },
}

/// Drives one participant through a session
///
/// Create with [`SessionRunner::new`], take a [`SessionHandle`], then spawn
/// [`SessionRunner::run`].
pub struct SessionRunner {
    config: SessionConfig,
    services: SessionServices,
    local: LocalClock,
    scheduler: AlignedScheduler,
    machine: SessionMachine,
    slug: String,
    generation: Option<u32>,
    /// Start adopted for the current generation
    pinned_start: Option<i64>,
    timeline: Option<ReferenceTimeline>,
    triggers_tx: mpsc::Sender<TriggerEvent>,
    triggers: mpsc::Receiver<TriggerEvent>,
    teardown: CancellationToken,
    updates: broadcast::Sender<SessionUpdate>,
    status: watch::Sender<SessionStats>,
    detector_events: Option<mpsc::UnboundedSender<DetectorEvent>>,
}

impl SessionRunner {
    pub fn new(config: SessionConfig, services: SessionServices) -> Self {
        let (triggers_tx, triggers) = mpsc::channel(8);
        let (updates, _) = broadcast::channel(128);
        let (status, _) = watch::channel(SessionStats::new(
            &config.session_id,
            &config.participant,
            config.mode,
        ));
        let slug = slugify(config.session_name.as_deref().unwrap_or(&config.session_id));

        Self {
            scheduler: AlignedScheduler::new(config.scheduler.clone()),
            config,
            services,
            local: LocalClock::system(),
            machine: SessionMachine::new(),
            slug,
            generation: None,
            pinned_start: None,
            timeline: None,
            triggers_tx,
            triggers,
            teardown: CancellationToken::new(),
            updates,
            status,
            detector_events: None,
        }
    }

    /// Replace the local clock anchor
    pub fn with_local_clock(mut self, local: LocalClock) -> Self {
        self.local = local;
        self
    }

    /// Forward pulse-level detector events (diagnostics)
    pub fn with_detector_events(mut self, sink: mpsc::UnboundedSender<DetectorEvent>) -> Self {
        self.detector_events = Some(sink);
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            session_id: self.config.session_id.clone(),
            triggers: self.triggers_tx.clone(),
            teardown: self.teardown.clone(),
            status: self.status.subscribe(),
            updates: self.updates.clone(),
        }
    }

    /// Run until the session finishes or is torn down
    pub async fn run(mut self) -> SessionOutcome {
        info!(
            "Starting session {} as {} ({:?})",
            self.config.session_id, self.config.participant, self.config.mode
        );

        let teardown = self.teardown.clone();
        let outcome = match until_teardown(&teardown, self.enter()).await {
            Some(()) => {
                self.apply(|m| m.ready());
                self.drive().await
            }
            None => self.left_early().await,
        };

        info!(
            "Session {} ended in {:?}",
            self.config.session_id, outcome.state
        );
        outcome
    }

    async fn drive(&mut self) -> SessionOutcome {
        loop {
            let Some(source) = self.await_trigger().await else {
                return self.left_early().await;
            };

            self.status.send_modify(|s| s.triggered_by = Some(source));
            self.log_event(
                SessionEvent::new(EventKind::Triggered)
                    .by(&self.config.participant)
                    .with_detail(format!("{:?}", source).to_lowercase()),
            )
            .await;

            let capture = match self.open_capture().await {
                Ok(capture) => capture,
                Err(e) if e.is_recoverable() => {
                    warn!("Cannot record yet: {}", e);
                    self.report(&e);
                    let message = e.to_string();
                    self.apply(|m| m.recover(message));
                    continue;
                }
                Err(e) => {
                    error!("Capture failed to start: {}", e);
                    self.apply(|m| m.recording_elapsed());
                    return self.finish_failed(e, None, None, None).await;
                }
            };

            let started = Instant::now();
            let deadline = started + self.config.recording_duration;
            let teardown = self.teardown.clone();
            loop {
                tokio::select! {
                    biased;
                    _ = teardown.cancelled() => {
                        capture.abort().await;
                        return self.left_early().await;
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                    Some(event) = self.triggers.recv() => self.refuse(event.source),
                }
            }
            let recorded_for = started.elapsed();

            let captured = capture.stop().await;
            self.apply(|m| m.recording_elapsed());

            return self.deliver(captured, recorded_for).await;
        }
    }

    async fn open_capture(&self) -> EngineResult<Capture> {
        let backend = self.services.input.open()?;
        Capture::start(backend).await
    }

    /// Wait for the first accepted trigger; `None` on teardown
    async fn await_trigger(&mut self) -> Option<TriggerSource> {
        let teardown = self.teardown.clone();
        let follows_schedule = self.config.mode.follows_schedule();

        let mut subscription = if follows_schedule {
            let feed = self.services.sessions.subscribe(&self.config.session_id);
            match until_teardown(&teardown, feed).await {
                None => return None,
                Some(Ok(subscription)) => Some(subscription),
                Some(Err(e)) => {
                    warn!("Session change feed unavailable, polling only: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut listener: Option<TriggerListener> = None;
        let mut countdown: Option<Countdown> = None;
        let mut aligned: Option<BoxFuture<'static, EngineResult<FireReport>>> = None;

        let fired = loop {
            if self.config.mode.listens() && countdown.is_none() {
                let alive = listener.as_ref().map(|l| l.is_running()).unwrap_or(false);
                if !alive {
                    if let Some(stale) = listener.take() {
                        stale.stop().await;
                    }
                    listener = self.start_listener().await;
                }
            }

            let action = tokio::select! {
                biased;
                _ = teardown.cancelled() => break None,
                Some(event) = self.triggers.recv() => {
                    match self.machine.trigger(event.source) {
                        Ok(state) => {
                            self.publish(state);
                            break Some(event.source);
                        }
                        Err(e) => {
                            self.ignore(event.source, e);
                            ScheduleAction::Wait
                        }
                    }
                }
                fired = wait_aligned(&mut aligned) => {
                    aligned = None;
                    match fired {
                        Ok(report) => {
                            info!("Scheduled start reached (overshoot {:?})", report.overshoot());
                            if self.apply(|m| m.countdown_elapsed()).is_some() {
                                break Some(TriggerSource::Scheduled);
                            }
                            countdown = None;
                            ScheduleAction::Wait
                        }
                        Err(_) => break None,
                    }
                }
                _ = wait_tick(countdown) => {
                    if let Some(c) = countdown.as_mut() {
                        c.remaining -= 1;
                        let remaining = c.remaining;
                        self.apply(|m| m.tick(remaining));
                    }
                    ScheduleAction::Wait
                }
                _ = poll.tick(), if countdown.is_none() => {
                    if follows_schedule {
                        match until_teardown(&teardown, self.fetch_document()).await {
                            Some(Some(doc)) => self.plan_schedule(&doc).await,
                            Some(None) => ScheduleAction::Wait,
                            None => ScheduleAction::TornDown,
                        }
                    } else {
                        ScheduleAction::Wait
                    }
                }
                change = next_change(&mut subscription), if countdown.is_none() => {
                    match change {
                        Some(doc) => self.plan_schedule(&doc).await,
                        None => {
                            warn!("Session change feed closed, polling only");
                            subscription = None;
                            ScheduleAction::Wait
                        }
                    }
                }
            };

            match action {
                ScheduleAction::Wait => {}
                ScheduleAction::TornDown => break None,
                ScheduleAction::StartNow => match self.machine.trigger(TriggerSource::Scheduled) {
                    Ok(state) => {
                        self.publish(state);
                        break Some(TriggerSource::Scheduled);
                    }
                    Err(e) => self.ignore(TriggerSource::Scheduled, e),
                },
                ScheduleAction::Countdown {
                    countdown: planned,
                    lead,
                } => {
                    if self.apply(|m| m.begin_countdown(planned.remaining)).is_some() {
                        // Release the input now so capture can open right at the deadline.
                        if let Some(active) = listener.take() {
                            active.stop().await;
                        }
                        let scheduler = self.scheduler.clone();
                        let token = teardown.clone();
                        aligned = Some(Box::pin(async move {
                            scheduler.wait_until(planned.deadline, lead, &token).await
                        }));
                        countdown = Some(planned);
                    }
                }
            }
        };

        if let Some(active) = listener.take() {
            active.stop().await;
        }
        fired
    }

    async fn start_listener(&self) -> Option<TriggerListener> {
        let backend = match self.services.input.open() {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Acoustic trigger unavailable: {}", e);
                self.report(&e);
                return None;
            }
        };

        match TriggerListener::start(
            backend,
            self.config.detector.clone(),
            self.triggers_tx.clone(),
            self.detector_events.clone(),
        )
        .await
        {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!("Acoustic trigger unavailable: {}", e);
                self.report(&e);
                None
            }
        }
    }

    async fn fetch_document(&self) -> Option<SessionDoc> {
        match self.services.sessions.get(&self.config.session_id).await {
            Ok(Some(doc)) => Some(doc),
            Ok(None) => {
                warn!("Session {} not found", self.config.session_id);
                None
            }
            Err(e) => {
                warn!("Failed to poll session {}: {}", self.config.session_id, e);
                None
            }
        }
    }

    /// Decide what a (new) version of the session document means for us
    async fn plan_schedule(&mut self, doc: &SessionDoc) -> ScheduleAction {
        if !self.config.mode.follows_schedule() {
            return ScheduleAction::Wait;
        }

        if self.generation != Some(doc.generation) {
            if self.generation.is_some() {
                info!(
                    "Session {} re-armed as generation {}",
                    doc.id, doc.generation
                );
            }
            self.generation = Some(doc.generation);
            self.pinned_start = None;
            let generation = doc.generation;
            self.status.send_modify(|s| {
                s.generation = Some(generation);
                s.scheduled_start_ms = None;
            });
        }

        let Some(start) = doc.scheduled_start_ms else {
            return ScheduleAction::Wait;
        };

        let start = match self.pinned_start {
            Some(pinned) => {
                if pinned != start {
                    warn!(
                        "Ignoring changed start {} for session {}; keeping {}",
                        start, doc.id, pinned
                    );
                }
                pinned
            }
            None => {
                info!("Session {} scheduled to start at {}", doc.id, start);
                self.pinned_start = Some(start);
                self.status.send_modify(|s| s.scheduled_start_ms = Some(start));
                start
            }
        };

        let fresh = self.timeline.is_none();
        let Some(mut timeline) = self.timeline().await else {
            return ScheduleAction::TornDown;
        };
        let mut remaining_ms = timeline.remaining_ms(start);

        if remaining_ms > self.config.countdown_threshold.as_secs_f64() * 1000.0 {
            debug!("Scheduled start in {:.0}ms", remaining_ms);
            return ScheduleAction::Wait;
        }

        if remaining_ms > 0.0 && !fresh {
            // The wait itself gets its own estimate.
            let Some(refreshed) = self.refresh_timeline().await else {
                return ScheduleAction::TornDown;
            };
            timeline = refreshed;
            remaining_ms = timeline.remaining_ms(start);
        }

        if remaining_ms <= 0.0 {
            info!("Scheduled start already passed by {:.0}ms", -remaining_ms);
            return ScheduleAction::StartNow;
        }

        let tick_ms = (self.config.countdown_tick.as_secs_f64() * 1000.0).max(1.0);
        let remaining = ((remaining_ms / tick_ms).ceil() as u32).max(1);

        ScheduleAction::Countdown {
            countdown: Countdown {
                deadline: timeline.deadline_for(start),
                remaining,
                tick: self.config.countdown_tick,
            },
            lead: self.scheduler.lead_for(&timeline),
        }
    }

    /// `None` if torn down while estimating
    async fn timeline(&mut self) -> Option<ReferenceTimeline> {
        match self.timeline {
            Some(timeline) => Some(timeline),
            None => self.refresh_timeline().await,
        }
    }

    async fn refresh_timeline(&mut self) -> Option<ReferenceTimeline> {
        let timeline = match self.services.reference.clone() {
            None => ReferenceTimeline::unsynced(self.local),
            Some(reference) => {
                let estimator = OffsetEstimator::new(self.config.clock_samples);
                let estimate = estimator.estimate(reference.as_ref(), &self.local);
                let Some(estimated) = until_teardown(&self.teardown, estimate).await else {
                    debug!("Clock sync abandoned on teardown");
                    return None;
                };
                match estimated {
                    Ok(offset) => {
                        let _ = self.updates.send(SessionUpdate::ClockSynced { offset });
                        ReferenceTimeline::synced(self.local, offset)
                    }
                    Err(e) => {
                        warn!("{}; continuing on the local clock", e);
                        let _ = self.updates.send(SessionUpdate::ClockSyncFailed {
                            reason: e.to_string(),
                        });
                        ReferenceTimeline::unsynced(self.local)
                    }
                }
            }
        };

        self.status.send_modify(|s| {
            s.clock_offset = Some(timeline.offset());
            s.clock_synced = timeline.is_synced();
        });
        self.timeline = Some(timeline);
        Some(timeline)
    }

    async fn deliver(
        &mut self,
        captured: EngineResult<AudioArtifact>,
        recorded_for: Duration,
    ) -> SessionOutcome {
        let encoded = match captured {
            Ok(artifact) => tokio::task::spawn_blocking(move || wav::encode(&artifact))
                .await
                .unwrap_or_else(|e| Err(EngineError::Audio(format!("encoder task failed: {}", e)))),
            Err(e) => Err(e),
        };

        let blob = match encoded {
            Ok(blob) => blob,
            Err(e) => {
                error!("Discarding recording: {}", e);
                return self.finish_failed(e, Some(recorded_for), None, None).await;
            }
        };

        info!(
            "Encoded {:.2}s of audio ({} bytes)",
            blob.duration_seconds(),
            blob.bytes.len()
        );

        let path = artifact_name(&self.slug, &self.config.participant, Local::now().naive_local());

        match upload_artifact(
            self.services.sessions.as_ref(),
            self.services.blobs.as_ref(),
            &self.config.session_id,
            &self.config.participant,
            &path,
            &blob,
        )
        .await
        {
            Ok(receipt) => {
                self.apply(|m| m.finish(true));
                let url = receipt.url.clone();
                self.status.send_modify(|s| s.upload_url = Some(url));
                self.log_event(
                    SessionEvent::new(EventKind::Finished)
                        .by(&self.config.participant)
                        .with_detail(receipt.path.clone()),
                )
                .await;

                let mut outcome = self.outcome();
                outcome.recorded_for = Some(recorded_for);
                outcome.artifact_path = Some(path);
                outcome.upload = Some(receipt);
                outcome
            }
            Err(e) => {
                error!("Upload of {} failed, keeping artifact: {}", path, e);
                self.finish_failed(e, Some(recorded_for), Some(path), Some(blob))
                    .await
            }
        }
    }

    async fn finish_failed(
        &mut self,
        failure: EngineError,
        recorded_for: Option<Duration>,
        artifact_path: Option<String>,
        retained: Option<WavBlob>,
    ) -> SessionOutcome {
        self.report(&failure);
        self.apply(|m| m.finish(false));
        self.log_event(
            SessionEvent::new(EventKind::Finished)
                .by(&self.config.participant)
                .with_detail(failure.to_string()),
        )
        .await;

        let mut outcome = self.outcome();
        outcome.recorded_for = recorded_for;
        outcome.artifact_path = artifact_path;
        outcome.retained = retained;
        outcome.failure = Some(failure);
        outcome
    }

    async fn left_early(&mut self) -> SessionOutcome {
        info!(
            "Leaving session {} in {:?}",
            self.config.session_id,
            self.machine.state()
        );

        if let Err(e) = self
            .services
            .sessions
            .update(&self.config.session_id, SessionPatch::leave(&self.config.participant))
            .await
        {
            warn!("Failed to leave session {}: {}", self.config.session_id, e);
        }
        self.log_event(SessionEvent::new(EventKind::Left).by(&self.config.participant))
            .await;

        let mut outcome = self.outcome();
        outcome.left_early = true;
        outcome
    }

    /// Create the session if needed and register as a participant
    async fn enter(&mut self) {
        let sessions = self.services.sessions.clone();
        let id = self.config.session_id.clone();

        let doc = match sessions.get(&id).await {
            Ok(Some(doc)) => Some(doc),
            Ok(None) => {
                let initial = SessionDoc::new(&id, self.config.session_name.clone());
                match sessions.create(&id, initial.clone()).await {
                    Ok(()) => {
                        info!("Created session {}", id);
                        Some(initial)
                    }
                    Err(EngineError::SessionExists(_)) => sessions.get(&id).await.ok().flatten(),
                    Err(e) => {
                        warn!("Failed to create session {}: {}", id, e);
                        None
                    }
                }
            }
            Err(e) => {
                warn!("Session store unavailable: {}", e);
                self.report(&e);
                None
            }
        };

        if let Some(doc) = doc {
            if self.config.session_name.is_none() && doc.name.is_some() {
                self.slug = doc.slug();
            }
            self.generation = Some(doc.generation);
            let generation = doc.generation;
            self.status.send_modify(|s| s.generation = Some(generation));
        }

        let participant = Participant::new(&self.config.participant);
        match sessions.update(&id, SessionPatch::join(participant)).await {
            Ok(_) => {
                self.log_event(SessionEvent::new(EventKind::Joined).by(&self.config.participant))
                    .await
            }
            Err(e) => warn!("Failed to join session {}: {}", id, e),
        }
    }

    async fn log_event(&self, event: SessionEvent) {
        if let Err(e) = self
            .services
            .sessions
            .append_event(&self.config.session_id, event)
            .await
        {
            warn!("Failed to append session event: {}", e);
        }
    }

    fn apply<F>(&mut self, transition: F) -> Option<SessionState>
    where
        F: FnOnce(&mut SessionMachine) -> Result<SessionState, TransitionError>,
    {
        match transition(&mut self.machine) {
            Ok(state) => {
                self.publish(state);
                Some(state)
            }
            Err(e) => {
                warn!("Session {}: {}", self.config.session_id, e);
                None
            }
        }
    }

    fn publish(&self, state: SessionState) {
        match state {
            SessionState::Countdown { remaining } => debug!("Countdown: {}", remaining),
            _ => info!("Session {} -> {:?}", self.config.session_id, state),
        }

        let _ = self.updates.send(SessionUpdate::State {
            state,
            at: Instant::now(),
        });

        let last_error = self.machine.last_error().map(str::to_string);
        self.status.send_modify(|s| {
            s.state = state;
            if last_error.is_some() {
                s.last_error = last_error;
            }
            s.updated_at = Utc::now();
        });
    }

    fn refuse(&mut self, source: TriggerSource) {
        if let Err(e) = self.machine.trigger(source) {
            self.ignore(source, e);
        }
    }

    fn ignore(&self, source: TriggerSource, reason: TransitionError) {
        info!("Ignoring {:?} trigger: {}", source, reason);
        let _ = self.updates.send(SessionUpdate::TriggerIgnored {
            source,
            reason: reason.to_string(),
        });
    }

    fn report(&self, error: &EngineError) {
        let message = error.to_string();
        let _ = self.updates.send(SessionUpdate::Error {
            message: message.clone(),
        });
        self.status.send_modify(|s| {
            s.last_error = Some(message);
            s.updated_at = Utc::now();
        });
    }

    fn outcome(&self) -> SessionOutcome {
        let stats = self.status.borrow();
        SessionOutcome {
            session_id: self.config.session_id.clone(),
            participant: self.config.participant.clone(),
            state: self.machine.state(),
            triggered_by: stats.triggered_by,
            recorded_for: None,
            artifact_path: None,
            upload: None,
            retained: None,
            failure: None,
            left_early: false,
        }
    }
}

/// Run `work` unless the session is torn down first
async fn until_teardown<F: Future>(teardown: &CancellationToken, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = teardown.cancelled() => None,
        output = work => Some(output),
    }
}

async fn wait_aligned(
    aligned: &mut Option<BoxFuture<'static, EngineResult<FireReport>>>,
) -> EngineResult<FireReport> {
    match aligned {
        Some(wait) => wait.await,
        None => std::future::pending().await,
    }
}

async fn wait_tick(countdown: Option<Countdown>) {
    match countdown.and_then(|c| c.next_tick()) {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_change(subscription: &mut Option<SessionSubscription>) -> Option<SessionDoc> {
    match subscription {
        Some(feed) => feed.changed().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_countdown_ticks_land_on_whole_steps() {
        let deadline = Instant::now() + Duration::from_secs(10);
        let countdown = Countdown {
            deadline,
            remaining: 10,
            tick: Duration::from_secs(1),
        };
        assert_eq!(countdown.next_tick(), Some(deadline - Duration::from_secs(9)));

        let last = Countdown {
            remaining: 1,
            ..countdown
        };
        assert_eq!(last.next_tick(), None);
    }
}
