//! Recording orchestrator.
//!
//! Drives parallel start and stop of a selected subset of sensor recorders
//! under one session:
//!
//! ```text
//! Idle ──▶ Starting ──▶ Active ──▶ Stopping ──▶ Idle
//!              │
//!              └──────────▶ Idle   (no sensor started, or start cancelled)
//! ```
//!
//! Every selected recorder's `start()` runs in its own task; the tasks are
//! joined with one barrier and partitioned into succeeded and failed sets.
//! Recording proceeds with whatever started unless nothing did, or a sensor
//! in the strict set failed, in which case the started ones are rolled back
//! from the same join point. A stop issued while starting cancels the
//! pending starts, rolls back the ones that finished and completes the
//! session as cancelled.

pub mod types;

pub use types::{
    OrchestrationError, OrchestrationResult, OrchestratorEvent, OrchestratorSettings,
    OrchestratorState, RecordingSummary, SensorStatus, StartRequest, StopReport, StopStatus,
    RECORDING_STARTED, RECORDING_STOPPING,
};

use crate::core::{
    join_sensors, ListenerRegistry, RecordingOutcome, SensorKind, SessionSummary,
    SharedTimeBase, SubscriptionId, SyncMark, Timestamp,
};
use crate::recorder::{
    recorder_service_id, RecorderSettings, SharedRecorder, StartError, StopError,
};
use crate::recovery::{health_check, ErrorKind, RecoverableError, SharedRecoveryManager, Severity};
use crate::session::{NewSession, SessionError, SessionManager};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Service id used for orchestration-level error reports.
pub const ORCHESTRATOR_SERVICE_ID: &str = "orchestrator";

const DEFAULT_STOP_REASON: &str = "user_requested";

/// The recording in progress.
#[derive(Debug, Clone)]
struct ActiveRecording {
    session_id: String,
    session_dir: PathBuf,
    sensors: BTreeSet<SensorKind>,
    started_at: Timestamp,
}

/// A start in flight, cancellable by a concurrent stop.
#[derive(Debug)]
struct PendingStart {
    cancel: CancellationToken,
    reason: Option<String>,
}

/// What a stop request found when it inspected the state.
enum StopEntry {
    Idle,
    Busy(OrchestratorState),
    StartInFlight,
    Stop,
}

pub struct RecordingOrchestrator {
    time_base: SharedTimeBase,
    sessions: Arc<SessionManager>,
    recovery: Option<SharedRecoveryManager>,
    recorders: BTreeMap<SensorKind, SharedRecorder>,
    settings: OrchestratorSettings,
    state: watch::Sender<OrchestratorState>,
    pending_start: Mutex<Option<PendingStart>>,
    current: RwLock<Option<ActiveRecording>>,
    last_summary: RwLock<Option<RecordingSummary>>,
    listeners: ListenerRegistry<OrchestratorEvent>,
}

impl RecordingOrchestrator {
    pub fn new(time_base: SharedTimeBase, sessions: Arc<SessionManager>) -> Self {
        Self {
            time_base,
            sessions,
            recovery: None,
            recorders: BTreeMap::new(),
            settings: OrchestratorSettings::default(),
            state: watch::channel(OrchestratorState::Idle).0,
            pending_start: Mutex::new(None),
            current: RwLock::new(None),
            last_summary: RwLock::new(None),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Registers `recorder` for its sensor kind, replacing any previous one.
    pub fn with_recorder(mut self, recorder: SharedRecorder) -> Self {
        self.recorders.insert(recorder.kind(), recorder);
        self
    }

    pub fn with_recovery(mut self, recovery: SharedRecoveryManager) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    pub fn is_recording(&self) -> bool {
        self.state() == OrchestratorState::Active
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.current.read().as_ref().map(|r| r.session_id.clone())
    }

    pub fn active_sensors(&self) -> BTreeSet<SensorKind> {
        self.current
            .read()
            .as_ref()
            .map(|r| r.sensors.clone())
            .unwrap_or_default()
    }

    pub fn session_directory(&self) -> Option<PathBuf> {
        self.current.read().as_ref().map(|r| r.session_dir.clone())
    }

    pub fn last_summary(&self) -> Option<RecordingSummary> {
        self.last_summary.read().clone()
    }

    pub fn recorder(&self, sensor: SensorKind) -> Option<&SharedRecorder> {
        self.recorders.get(&sensor)
    }

    pub fn available_sensors(&self) -> BTreeSet<SensorKind> {
        self.recorders.keys().copied().collect()
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Starts every selected sensor in parallel under one session.
    ///
    /// Caller errors are returned before any recorder is touched. If no
    /// sensor starts, or a strict sensor fails, everything that did start is
    /// stopped again and [`OrchestrationError::AllSensorsFailed`] is returned
    /// with one message per failed sensor. A stop issued meanwhile cancels
    /// the start and yields [`OrchestrationError::StartCancelled`].
    pub async fn start_all(
        &self,
        request: StartRequest,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        if request.sensors.is_empty() {
            return Err(OrchestrationError::EmptySelection);
        }
        let mut selected: Vec<(SensorKind, SharedRecorder)> = Vec::new();
        for &sensor in &request.sensors {
            let recorder = self
                .recorders
                .get(&sensor)
                .ok_or(OrchestrationError::NoRecorder(sensor))?;
            selected.push((sensor, Arc::clone(recorder)));
        }
        if let Some(id) = &request.session_id {
            if self.sessions.is_active(id) {
                return Err(OrchestrationError::SessionCollision(id.clone()));
            }
        }

        let cancel = self.begin_start()?;

        let session = match self.sessions.create_session(NewSession {
            session_id: request.session_id.clone(),
            participant_id: request.participant_id.clone(),
            study_name: request.study_name.clone(),
            metadata: request.metadata.clone(),
        }) {
            Ok(session) => session,
            Err(e) => {
                self.finish_start(OrchestratorState::Idle);
                return Err(match e {
                    SessionError::DuplicateId(id) => OrchestrationError::SessionCollision(id),
                    other => OrchestrationError::Session(other),
                });
            }
        };
        let session_id = session.session_id.clone();
        let session_dir = self.sessions.session_dir(&session_id);
        let started_at = self.time_base.now();

        info!(
            session_id = %session_id,
            sensors = %join_sensors(&request.sensors),
            "starting parallel recording"
        );

        let outcomes = self
            .start_recorders(
                &selected,
                &session_id,
                &session_dir,
                &request,
                &cancel,
            )
            .await;

        let mut succeeded = BTreeSet::new();
        let mut failed = BTreeMap::new();
        let mut recording_outcomes = Vec::new();
        for (sensor, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    info!(session_id = %session_id, sensor = %sensor, "sensor started");
                    succeeded.insert(sensor);
                    recording_outcomes.push(RecordingOutcome::succeeded(sensor, "recording"));
                    self.emit_status(sensor, SensorStatus::Recording);
                }
                Err((message, kind)) => {
                    warn!(session_id = %session_id, sensor = %sensor, "sensor failed to start: {message}");
                    recording_outcomes.push(RecordingOutcome::failed(sensor, message.clone()));
                    self.emit_status(sensor, SensorStatus::Failed(message.clone()));
                    failed.insert(sensor, (message, kind));
                }
            }
        }
        let failures: BTreeMap<SensorKind, String> = failed
            .iter()
            .map(|(sensor, (message, _))| (*sensor, message.clone()))
            .collect();

        if cancel.is_cancelled() {
            return Err(self.cancel_start(&selected, &succeeded, session_id).await);
        }

        let strict_failure = failed
            .keys()
            .any(|sensor| self.settings.strict_sensors.contains(sensor));
        let total_failure = succeeded.is_empty() || strict_failure;

        let severity = if total_failure {
            Severity::High
        } else {
            Severity::Medium
        };
        for (sensor, (message, kind)) in &failed {
            self.report(*kind, *sensor, message, severity, &session_id);
        }

        if total_failure {
            if strict_failure && !succeeded.is_empty() {
                warn!(
                    session_id = %session_id,
                    "strict sensor failed, rolling back {}",
                    join_sensors(&succeeded)
                );
            }
            self.rollback(&selected, &succeeded).await;
            self.sessions.update_session(&session_id, |s| {
                s.metadata
                    .insert("recording_status".to_string(), "failed".to_string());
                s.metadata.insert(
                    "failed_sensors".to_string(),
                    join_sensors(failures.keys()),
                );
            });
            self.sessions.complete_session(&session_id);
            error!(session_id = %session_id, "recording not started, no usable sensors");

            self.finish_start(OrchestratorState::Idle);
            self.listeners.emit(&OrchestratorEvent::StartFailed {
                session_id: session_id.clone(),
                failures: failures.clone(),
            });
            return Err(OrchestrationError::AllSensorsFailed {
                session_id,
                failures,
            });
        }

        let recording_mode = if failures.is_empty() {
            "parallel"
        } else {
            "partial"
        };
        let mut start_metadata = BTreeMap::new();
        start_metadata.insert(
            "sync_timestamp".to_string(),
            started_at.wall_clock_ms.to_string(),
        );
        start_metadata.insert(
            "selected_sensors".to_string(),
            join_sensors(&request.sensors),
        );
        start_metadata.insert("successful_sensors".to_string(), join_sensors(&succeeded));
        start_metadata.insert("failed_sensors".to_string(), join_sensors(failures.keys()));
        start_metadata.insert("recording_mode".to_string(), recording_mode.to_string());

        let start_mark = self.emit_unified_mark(
            &selected,
            &succeeded,
            &session_id,
            started_at,
            RECORDING_STARTED,
            start_metadata.clone(),
        );

        self.sessions.update_session(&session_id, |s| {
            s.metadata.extend(start_metadata);
            for (sensor, message) in &failures {
                s.metadata
                    .insert(format!("start_failure.{}", sensor.as_str()), message.clone());
            }
            for sensor in &succeeded {
                s.mark_data_present(*sensor);
            }
            if let Some(mark) = &start_mark {
                s.add_sync_mark(mark.clone());
            }
        });

        self.register_health_checks(&selected, &succeeded);

        *self.current.write() = Some(ActiveRecording {
            session_id: session_id.clone(),
            session_dir: session_dir.clone(),
            sensors: succeeded.clone(),
            started_at,
        });
        self.finish_start(OrchestratorState::Active);

        let result = OrchestrationResult {
            session_id,
            session_dir,
            selected: request.sensors,
            succeeded,
            failed: failures,
            outcomes: recording_outcomes,
            start_mark,
        };
        info!(session_id = %result.session_id, "{}", result.describe());
        self.listeners
            .emit(&OrchestratorEvent::RecordingStarted(result.clone()));
        Ok(result)
    }

    /// Stops every active sensor. Returns [`StopStatus::NotRecording`] with
    /// the last recording's summary when idle, and
    /// [`StopStatus::StartCancelled`] when it interrupted a start.
    pub async fn stop_all(&self) -> Result<StopReport, OrchestrationError> {
        self.stop_with_reason(DEFAULT_STOP_REASON).await
    }

    pub async fn stop_with_reason(&self, reason: &str) -> Result<StopReport, OrchestrationError> {
        loop {
            let mut entry = StopEntry::Stop;
            self.state.send_if_modified(|state| match *state {
                OrchestratorState::Idle => {
                    entry = StopEntry::Idle;
                    false
                }
                OrchestratorState::Stopping => {
                    entry = StopEntry::Busy(*state);
                    false
                }
                OrchestratorState::Starting => {
                    if let Some(pending) = self.pending_start.lock().as_mut() {
                        pending.reason.get_or_insert_with(|| reason.to_string());
                        pending.cancel.cancel();
                    }
                    entry = StopEntry::StartInFlight;
                    false
                }
                OrchestratorState::Active => {
                    *state = OrchestratorState::Stopping;
                    true
                }
            });
            match entry {
                StopEntry::Idle => {
                    debug!("stop requested while idle");
                    return Ok(StopReport {
                        status: StopStatus::NotRecording,
                        summary: self.last_summary(),
                    });
                }
                StopEntry::Busy(state) => return Err(OrchestrationError::Busy(state)),
                StopEntry::StartInFlight => {
                    info!(
                        reason,
                        "stop requested while starting, cancelling pending starts"
                    );
                    let mut state = self.state.subscribe();
                    let settled = state
                        .wait_for(|s| *s != OrchestratorState::Starting)
                        .await
                        .map(|s| *s)
                        .unwrap_or(OrchestratorState::Idle);
                    if settled == OrchestratorState::Idle {
                        return Ok(StopReport {
                            status: StopStatus::StartCancelled,
                            summary: self.last_summary(),
                        });
                    }
                    // The start went active before it saw the cancellation.
                }
                StopEntry::Stop => break,
            }
        }
        self.emit_transition(OrchestratorState::Active, OrchestratorState::Stopping);

        let recording = self.current.read().clone();
        let Some(recording) = recording else {
            self.transition(OrchestratorState::Idle);
            return Ok(StopReport {
                status: StopStatus::NotRecording,
                summary: self.last_summary(),
            });
        };
        let session_id = recording.session_id.clone();
        let now = self.time_base.now();

        let active: Vec<(SensorKind, SharedRecorder)> = recording
            .sensors
            .iter()
            .filter_map(|sensor| {
                self.recorders
                    .get(sensor)
                    .map(|r| (*sensor, Arc::clone(r)))
            })
            .collect();

        let mut stop_metadata = BTreeMap::new();
        stop_metadata.insert("sync_timestamp".to_string(), now.wall_clock_ms.to_string());
        stop_metadata.insert(
            "session_duration".to_string(),
            now.millis_since(&recording.started_at).to_string(),
        );
        stop_metadata.insert("stop_reason".to_string(), reason.to_string());
        stop_metadata.insert(
            "active_sensors".to_string(),
            join_sensors(&recording.sensors),
        );
        let stop_mark = self.emit_unified_mark(
            &active,
            &recording.sensors,
            &session_id,
            now,
            RECORDING_STOPPING,
            stop_metadata,
        );

        self.unregister_health_checks(&recording.sensors);

        info!(session_id = %session_id, reason, "stopping parallel recording");
        for (sensor, _) in &active {
            self.emit_status(*sensor, SensorStatus::Stopping);
        }
        let outcomes = self.stop_recorders(&active).await;

        let mut summaries = BTreeMap::new();
        let mut stop_failures = BTreeMap::new();
        for (sensor, outcome) in outcomes {
            match outcome {
                Ok(summary) => {
                    info!(
                        session_id = %session_id,
                        sensor = %sensor,
                        samples = summary.sample_count,
                        "sensor stopped"
                    );
                    self.emit_status(sensor, SensorStatus::Completed);
                    summaries.insert(sensor, summary);
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(session_id = %session_id, sensor = %sensor, "sensor failed to stop: {message}");
                    self.emit_status(sensor, SensorStatus::Failed(message.clone()));
                    stop_failures.insert(sensor, message);
                }
            }
        }
        let severity = if summaries.is_empty() && !stop_failures.is_empty() {
            Severity::High
        } else {
            Severity::Medium
        };
        for (sensor, message) in &stop_failures {
            self.report(
                ErrorKind::RecordingStopFailure(*sensor),
                *sensor,
                message,
                severity,
                &session_id,
            );
        }

        let output_files: Vec<PathBuf> = summaries
            .values()
            .flat_map(|s| s.output_files.iter().cloned())
            .collect();
        let total_samples: u64 = summaries.values().map(|s| s.sample_count).sum();

        self.sessions.update_session(&session_id, |s| {
            if let Some(mark) = &stop_mark {
                s.add_sync_mark(mark.clone());
            }
            s.record_sample_count(total_samples);
            for (sensor, summary) in &summaries {
                if summary.sample_count > 0 {
                    s.mark_data_present(*sensor);
                }
                s.sensor_summaries.insert(*sensor, summary.clone());
            }
            s.metadata
                .insert("stop_reason".to_string(), reason.to_string());
            for (sensor, message) in &stop_failures {
                s.metadata
                    .insert(format!("stop_failure.{}", sensor.as_str()), message.clone());
            }
        });

        let session = match self.sessions.complete_session(&session_id) {
            Some(session) => session,
            None => {
                warn!(session_id = %session_id, "session already completed elsewhere");
                match self.sessions.get_session(&session_id) {
                    Some(session) => session,
                    None => {
                        *self.current.write() = None;
                        self.transition(OrchestratorState::Idle);
                        return Err(OrchestrationError::Session(SessionError::NotFound(
                            session_id,
                        )));
                    }
                }
            }
        };

        let summary = RecordingSummary {
            session,
            stop_failures,
            output_files,
        };
        *self.last_summary.write() = Some(summary.clone());
        *self.current.write() = None;
        self.transition(OrchestratorState::Idle);

        info!(
            session_id = %session_id,
            duration_ms = summary.session.duration_ms(0),
            samples = total_samples,
            "recording stopped"
        );
        self.listeners
            .emit(&OrchestratorEvent::RecordingStopped(summary.clone()));
        Ok(StopReport {
            status: StopStatus::Stopped,
            summary: Some(summary),
        })
    }

    /// Stamps a named event and forwards it to every active sensor that
    /// records sync marks. Returns `None` unless recording.
    pub fn add_sync_event(
        &self,
        name: &str,
        metadata: BTreeMap<String, String>,
    ) -> Option<SyncMark> {
        if self.state() != OrchestratorState::Active {
            debug!(event = name, "sync event ignored, not recording");
            return None;
        }
        let recording = self.current.read().clone()?;
        let now = self.time_base.now();

        let mut metadata = metadata;
        metadata.insert("sync_timestamp".to_string(), now.wall_clock_ms.to_string());
        metadata.insert(
            "active_sensors".to_string(),
            join_sensors(&recording.sensors),
        );

        let mut delivered = Vec::new();
        for sensor in &recording.sensors {
            let Some(recorder) = self.recorders.get(sensor) else {
                continue;
            };
            if recorder.supports_sync_marks() && recorder.trigger_sync_mark(name, metadata.clone())
            {
                delivered.push(*sensor);
            }
        }
        if delivered.is_empty() {
            warn!(event = name, "no active sensor accepted the sync mark");
        }

        let mark = SyncMark::new(now, name, recording.session_id.clone(), metadata);
        self.sessions
            .update_session(&recording.session_id, |s| s.add_sync_mark(mark.clone()));
        debug!(event = name, sensors = %join_sensors(&delivered), "sync event recorded");
        Some(mark)
    }

    /// Moves Idle to Starting and hands out the token a stop cancels.
    fn begin_start(&self) -> Result<CancellationToken, OrchestrationError> {
        let mut entered = Err(OrchestrationError::AlreadyRecording);
        self.state.send_if_modified(|state| match *state {
            OrchestratorState::Active | OrchestratorState::Starting => false,
            OrchestratorState::Stopping => {
                entered = Err(OrchestrationError::Busy(*state));
                false
            }
            OrchestratorState::Idle => {
                let cancel = CancellationToken::new();
                *self.pending_start.lock() = Some(PendingStart {
                    cancel: cancel.clone(),
                    reason: None,
                });
                *state = OrchestratorState::Starting;
                entered = Ok(cancel);
                true
            }
        });
        let cancel = entered?;
        self.emit_transition(OrchestratorState::Idle, OrchestratorState::Starting);
        Ok(cancel)
    }

    fn finish_start(&self, to: OrchestratorState) {
        self.pending_start.lock().take();
        self.transition(to);
    }

    fn transition(&self, to: OrchestratorState) {
        let from = self.state.send_replace(to);
        if from != to {
            self.emit_transition(from, to);
        }
    }

    fn emit_transition(&self, from: OrchestratorState, to: OrchestratorState) {
        debug!(%from, %to, "orchestrator state changed");
        self.listeners
            .emit(&OrchestratorEvent::StateChanged { from, to });
    }

    fn emit_status(&self, sensor: SensorKind, status: SensorStatus) {
        self.listeners
            .emit(&OrchestratorEvent::SensorStatusChanged { sensor, status });
    }

    /// Issues every `start()` concurrently and waits for all of them.
    ///
    /// A start that exceeds the timeout, or is cancelled, counts as failed;
    /// its task keeps running and the recorder is stopped as soon as it
    /// finishes starting.
    async fn start_recorders(
        &self,
        selected: &[(SensorKind, SharedRecorder)],
        session_id: &str,
        session_dir: &std::path::Path,
        request: &StartRequest,
        cancel: &CancellationToken,
    ) -> Vec<(SensorKind, Result<(), (String, ErrorKind)>)> {
        let start_timeout = self.settings.start_timeout;
        let starts = selected.iter().map(|(sensor, recorder)| {
            let sensor = *sensor;
            let recorder = Arc::clone(recorder);
            let session_id = session_id.to_string();
            let mut settings = RecorderSettings::new(session_dir);
            if let Some(options) = request.settings.get(&sensor) {
                settings.options = options.clone();
            }
            let cancel = cancel.clone();
            self.emit_status(sensor, SensorStatus::Starting);

            async move {
                if cancel.is_cancelled() {
                    let e = StartError::Cancelled;
                    return (sensor, Err((e.to_string(), e.error_kind(sensor))));
                }
                let task_recorder = Arc::clone(&recorder);
                let mut task = tokio::spawn(async move {
                    task_recorder.start(&session_id, &settings).await
                });
                let waited = tokio::select! {
                    joined = tokio::time::timeout(start_timeout, &mut task) => {
                        joined.map_err(|_| StartError::Timeout(start_timeout))
                    }
                    _ = cancel.cancelled() => Err(StartError::Cancelled),
                };
                let result = match waited {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) => Err(StartError::Failed(format!(
                        "start task aborted: {join_error}"
                    ))),
                    Err(e) => {
                        stop_when_started(sensor, recorder, task);
                        Err(e)
                    }
                };
                (
                    sensor,
                    result.map_err(|e| (e.to_string(), e.error_kind(sensor))),
                )
            }
        });
        join_all(starts).await
    }

    async fn stop_recorders(
        &self,
        recorders: &[(SensorKind, SharedRecorder)],
    ) -> Vec<(SensorKind, Result<SessionSummary, StopError>)> {
        let stop_timeout = self.settings.stop_timeout;
        let stops = recorders.iter().map(|(sensor, recorder)| {
            let sensor = *sensor;
            let recorder = Arc::clone(recorder);
            async move {
                let mut task = tokio::spawn(async move { recorder.stop().await });
                let result = match tokio::time::timeout(stop_timeout, &mut task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) => {
                        Err(StopError::Failed(format!("stop task aborted: {join_error}")))
                    }
                    Err(_) => Err(StopError::Timeout(stop_timeout)),
                };
                (sensor, result)
            }
        });
        join_all(stops).await
    }

    /// Best-effort stop of every sensor that started. Returns the summaries
    /// of the clean stops and the messages of the failed ones.
    async fn rollback(
        &self,
        selected: &[(SensorKind, SharedRecorder)],
        started: &BTreeSet<SensorKind>,
    ) -> (BTreeMap<SensorKind, SessionSummary>, BTreeMap<SensorKind, String>) {
        let to_stop: Vec<(SensorKind, SharedRecorder)> = selected
            .iter()
            .filter(|(sensor, _)| started.contains(sensor))
            .map(|(sensor, recorder)| (*sensor, Arc::clone(recorder)))
            .collect();
        let mut summaries = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for (sensor, outcome) in self.stop_recorders(&to_stop).await {
            match outcome {
                Ok(summary) => {
                    debug!(sensor = %sensor, "rolled back");
                    summaries.insert(sensor, summary);
                }
                Err(e) => {
                    warn!(sensor = %sensor, error = %e, "rollback stop failed");
                    failures.insert(sensor, e.to_string());
                }
            }
            self.emit_status(sensor, SensorStatus::Failed("rolled back".to_string()));
        }
        (summaries, failures)
    }

    /// Unwinds a start a stop request cancelled: stops what started and
    /// completes the session as cancelled.
    async fn cancel_start(
        &self,
        selected: &[(SensorKind, SharedRecorder)],
        started: &BTreeSet<SensorKind>,
        session_id: String,
    ) -> OrchestrationError {
        let reason = self
            .pending_start
            .lock()
            .as_ref()
            .and_then(|pending| pending.reason.clone())
            .unwrap_or_else(|| DEFAULT_STOP_REASON.to_string());
        warn!(
            session_id = %session_id,
            reason = %reason,
            "start cancelled, rolling back {}",
            join_sensors(started)
        );
        let (summaries, stop_failures) = self.rollback(selected, started).await;

        let output_files: Vec<PathBuf> = summaries
            .values()
            .flat_map(|s| s.output_files.iter().cloned())
            .collect();
        let total_samples: u64 = summaries.values().map(|s| s.sample_count).sum();
        self.sessions.update_session(&session_id, |s| {
            s.record_sample_count(total_samples);
            for (sensor, summary) in &summaries {
                if summary.sample_count > 0 {
                    s.mark_data_present(*sensor);
                }
                s.sensor_summaries.insert(*sensor, summary.clone());
            }
            s.metadata
                .insert("recording_status".to_string(), "cancelled".to_string());
            s.metadata.insert("stop_reason".to_string(), reason.clone());
            for (sensor, message) in &stop_failures {
                s.metadata
                    .insert(format!("stop_failure.{}", sensor.as_str()), message.clone());
            }
        });
        let session = self
            .sessions
            .complete_session(&session_id)
            .or_else(|| self.sessions.get_session(&session_id));

        if let Some(session) = session {
            let summary = RecordingSummary {
                session,
                stop_failures,
                output_files,
            };
            *self.last_summary.write() = Some(summary.clone());
            self.finish_start(OrchestratorState::Idle);
            self.listeners
                .emit(&OrchestratorEvent::StartCancelled(summary));
        } else {
            warn!(session_id = %session_id, "cancelled session vanished before completion");
            self.finish_start(OrchestratorState::Idle);
        }
        info!(session_id = %session_id, "recording start cancelled");
        OrchestrationError::StartCancelled { session_id }
    }

    /// Writes one mark through the preferred carrier: the biosignal recorder
    /// if active, else the first active sensor with a sync-mark channel.
    fn emit_unified_mark(
        &self,
        recorders: &[(SensorKind, SharedRecorder)],
        active: &BTreeSet<SensorKind>,
        session_id: &str,
        at: Timestamp,
        event_type: &str,
        metadata: BTreeMap<String, String>,
    ) -> Option<SyncMark> {
        let carriers = recorders
            .iter()
            .filter(|(sensor, recorder)| active.contains(sensor) && recorder.supports_sync_marks());
        let carrier = carriers
            .clone()
            .find(|(sensor, _)| *sensor == SensorKind::Biosignal)
            .or_else(|| carriers.clone().next());

        let Some((sensor, recorder)) = carrier else {
            warn!(session_id, event = event_type, "no active sensor can carry sync marks");
            return None;
        };
        if !recorder.trigger_sync_mark(event_type, metadata.clone()) {
            warn!(session_id, sensor = %sensor, event = event_type, "sync mark rejected");
            return None;
        }
        Some(SyncMark::new(at, event_type, session_id, metadata))
    }

    fn register_health_checks(
        &self,
        recorders: &[(SensorKind, SharedRecorder)],
        active: &BTreeSet<SensorKind>,
    ) {
        let Some(recovery) = &self.recovery else {
            return;
        };
        for (sensor, recorder) in recorders {
            if !active.contains(sensor) {
                continue;
            }
            let recorder = Arc::clone(recorder);
            recovery.register_health_check(
                recorder_service_id(*sensor),
                health_check(move || {
                    let recorder = Arc::clone(&recorder);
                    async move { recorder.is_healthy() }
                }),
            );
        }
    }

    fn unregister_health_checks(&self, sensors: &BTreeSet<SensorKind>) {
        if let Some(recovery) = &self.recovery {
            for sensor in sensors {
                recovery.unregister_service(&recorder_service_id(*sensor));
            }
        }
    }

    fn report(
        &self,
        kind: ErrorKind,
        sensor: SensorKind,
        message: &str,
        severity: Severity,
        session_id: &str,
    ) {
        let Some(recovery) = &self.recovery else {
            return;
        };
        let error = RecoverableError::new(
            kind,
            recorder_service_id(sensor),
            message,
            self.time_base.now(),
        )
        .with_severity(severity)
        .with_context("sensor", sensor.as_str())
        .with_context("session_id", session_id)
        .with_context("reported_by", ORCHESTRATOR_SERVICE_ID);
        recovery.report_error(error);
    }
}

/// Stops `recorder` once its abandoned start task finishes successfully.
fn stop_when_started(
    sensor: SensorKind,
    recorder: SharedRecorder,
    task: JoinHandle<Result<(), StartError>>,
) {
    tokio::spawn(async move {
        if let Ok(Ok(())) = task.await {
            warn!(sensor = %sensor, "late start completed, stopping recorder");
            if let Err(e) = recorder.stop().await {
                warn!(sensor = %sensor, error = %e, "failed to stop late-started recorder");
            }
        }
    });
}

impl std::fmt::Debug for RecordingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingOrchestrator")
            .field("state", &self.state())
            .field("sensors", &self.available_sensors())
            .field("session", &self.current_session_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BiosignalConfig;
    use crate::core::TimeBase;
    use crate::recorder::{BiosignalRecorder, CameraRecorder, FrameSourceError, SimulatedFrameSource};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn orchestrator(dir: &TempDir, rgb_fails: bool) -> RecordingOrchestrator {
        let time_base = TimeBase::shared();
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&time_base),
            dir.path(),
            "Test",
        ));
        let rgb_source = if rgb_fails {
            SimulatedFrameSource::rgb()
                .failing_with(FrameSourceError::Unavailable("no camera".to_string()))
        } else {
            SimulatedFrameSource::rgb()
        };
        let biosignal = BiosignalConfig {
            simulate: true,
            ..BiosignalConfig::default()
        };
        RecordingOrchestrator::new(Arc::clone(&time_base), sessions)
            .with_recorder(Arc::new(CameraRecorder::thermal(
                Box::new(SimulatedFrameSource::thermal()),
                Arc::clone(&time_base),
            )))
            .with_recorder(Arc::new(CameraRecorder::rgb(
                Box::new(rgb_source),
                Arc::clone(&time_base),
            )))
            .with_recorder(Arc::new(BiosignalRecorder::new(
                biosignal,
                Arc::clone(&time_base),
            )))
    }

    #[tokio::test]
    async fn test_start_and_stop_all_sensors() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, false);

        let result = orch
            .start_all(StartRequest::new(SensorKind::ALL))
            .await
            .unwrap();
        assert!(!result.is_partial());
        assert_eq!(result.succeeded.len(), 3);
        assert!(orch.is_recording());
        assert_eq!(orch.current_session_id(), Some(result.session_id.clone()));
        assert_eq!(
            result.start_mark.as_ref().unwrap().metadata["recording_mode"],
            "parallel"
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        let report = orch.stop_all().await.unwrap();
        assert_eq!(report.status, StopStatus::Stopped);
        let summary = report.summary.unwrap();
        assert!(!summary.session.is_active());
        assert_eq!(summary.session.sensor_summaries.len(), 3);
        assert_eq!(orch.state(), OrchestratorState::Idle);
        assert!(result.session_dir.join("session_metadata.json").exists());
    }

    #[tokio::test]
    async fn test_partial_start_proceeds() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, true);

        let result = orch
            .start_all(StartRequest::new(SensorKind::ALL))
            .await
            .unwrap();
        assert!(result.is_partial());
        assert!(result.failed.contains_key(&SensorKind::Rgb));
        assert_eq!(
            orch.active_sensors(),
            BTreeSet::from([SensorKind::Thermal, SensorKind::Biosignal])
        );
        orch.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_strict_sensor_failure_rolls_back() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, true).with_settings(OrchestratorSettings {
            strict_sensors: BTreeSet::from([SensorKind::Rgb]),
            ..OrchestratorSettings::default()
        });

        let err = orch
            .start_all(StartRequest::new(SensorKind::ALL))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::AllSensorsFailed { .. }));
        assert_eq!(orch.state(), OrchestratorState::Idle);
        for sensor in SensorKind::ALL {
            assert!(!orch.recorder(sensor).unwrap().is_running());
        }
    }

    #[tokio::test]
    async fn test_sync_events_only_while_active() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, false);
        assert!(orch.add_sync_event("STIMULUS", BTreeMap::new()).is_none());

        let result = orch
            .start_all(StartRequest::new([SensorKind::Biosignal, SensorKind::Thermal]))
            .await
            .unwrap();
        let mark = orch.add_sync_event("STIMULUS", BTreeMap::new()).unwrap();
        assert_eq!(mark.metadata["active_sensors"], "Thermal,Biosignal");

        let summary = orch.stop_all().await.unwrap().summary.unwrap();
        let events: Vec<&str> = summary
            .session
            .sync_marks
            .iter()
            .map(|m| m.event_type.as_str())
            .collect();
        assert_eq!(events, vec![RECORDING_STARTED, "STIMULUS", RECORDING_STOPPING]);
        assert_eq!(summary.session.session_id, result.session_id);
    }

    #[tokio::test]
    async fn test_state_events() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, false);
        let states = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&states);
        orch.subscribe(move |event| {
            if let OrchestratorEvent::StateChanged { to, .. } = event {
                s.lock().push(*to);
            }
        });

        orch.start_all(StartRequest::new([SensorKind::Biosignal]))
            .await
            .unwrap();
        orch.stop_all().await.unwrap();

        assert_eq!(
            *states.lock(),
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Active,
                OrchestratorState::Stopping,
                OrchestratorState::Idle,
            ]
        );
    }
}
