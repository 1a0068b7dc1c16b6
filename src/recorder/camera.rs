//! Camera recorders (thermal and RGB).
//!
//! The frame pipeline itself (codec, resolution, driver) lives behind the
//! [`FrameSource`] seam. The recorder stamps every delivered frame through the
//! shared time base and writes a frame timestamp index plus its own sync-mark
//! log, so externally encoded video can be aligned with the other streams.

use super::types::{
    recorder_service_id, RecorderEvent, RecorderListener, RecorderSettings, StartError, StopError,
};
use super::{report_fault, SensorRecorder};
use crate::core::{
    ListenerRegistry, SensorKind, SessionSummary, SharedTimeBase, SubscriptionId, SyncMark,
    Timestamp,
};
use crate::recovery::{ErrorKind, SharedRecoveryManager};
use crate::storage::{CsvLog, FrameRow, SessionLayout, StorageError, SyncMarkRow, FRAMES_HEADER};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed capture before trying again.
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Metadata of one delivered frame. Pixel data stays in the driver pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameSourceError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),

    #[error("camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("camera disconnected: {0}")]
    Disconnected(String),

    #[error("frame capture failed: {0}")]
    CaptureFailed(String),
}

impl From<FrameSourceError> for StartError {
    fn from(err: FrameSourceError) -> Self {
        match err {
            FrameSourceError::Unavailable(msg) | FrameSourceError::Disconnected(msg) => {
                StartError::DeviceUnavailable(msg)
            }
            FrameSourceError::PermissionDenied(msg) => StartError::PermissionDenied(msg),
            FrameSourceError::CaptureFailed(msg) => StartError::Failed(msg),
        }
    }
}

/// Driver seam for a camera.
#[async_trait]
pub trait FrameSource: Send {
    /// Opens the device with the opaque per-sensor options.
    async fn open(
        &mut self,
        options: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), FrameSourceError>;

    /// Waits for and returns the next frame.
    async fn capture(&mut self) -> Result<Frame, FrameSourceError>;

    async fn close(&mut self);

    fn is_alive(&self) -> bool;

    fn describe(&self) -> String;
}

/// Frame source that produces blank frames at a fixed rate.
#[derive(Debug, Clone)]
pub struct SimulatedFrameSource {
    fps: f64,
    width: u32,
    height: u32,
    open_delay: Duration,
    open_failure: Option<FrameSourceError>,
    fail_after_frames: Option<u64>,
    frames: u64,
    open: bool,
}

impl SimulatedFrameSource {
    pub fn new(fps: f64, width: u32, height: u32) -> Self {
        Self {
            fps: fps.max(0.1),
            width,
            height,
            open_delay: Duration::ZERO,
            open_failure: None,
            fail_after_frames: None,
            frames: 0,
            open: false,
        }
    }

    /// 25 fps, 256x192.
    pub fn thermal() -> Self {
        Self::new(25.0, 256, 192)
    }

    /// 30 fps, 1920x1080.
    pub fn rgb() -> Self {
        Self::new(30.0, 1920, 1080)
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Every `open` fails with `error`.
    pub fn failing_with(mut self, error: FrameSourceError) -> Self {
        self.open_failure = Some(error);
        self
    }

    /// Captures fail once `frames` frames have been delivered.
    pub fn failing_after(mut self, frames: u64) -> Self {
        self.fail_after_frames = Some(frames);
        self
    }
}

#[async_trait]
impl FrameSource for SimulatedFrameSource {
    async fn open(
        &mut self,
        options: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), FrameSourceError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if let Some(err) = &self.open_failure {
            return Err(err.clone());
        }
        if let Some(fps) = options.get("fps").and_then(|v| v.as_f64()) {
            self.fps = fps.max(0.1);
        }
        if let Some(width) = options.get("width").and_then(|v| v.as_u64()) {
            self.width = width as u32;
        }
        if let Some(height) = options.get("height").and_then(|v| v.as_u64()) {
            self.height = height as u32;
        }
        self.frames = 0;
        self.open = true;
        Ok(())
    }

    async fn capture(&mut self) -> Result<Frame, FrameSourceError> {
        if !self.open {
            return Err(FrameSourceError::Disconnected("source not open".to_string()));
        }
        tokio::time::sleep(Duration::from_secs_f64(1.0 / self.fps)).await;
        if self.fail_after_frames.is_some_and(|limit| self.frames >= limit) {
            return Err(FrameSourceError::CaptureFailed(
                "simulated capture failure".to_string(),
            ));
        }
        self.frames += 1;
        Ok(Frame {
            width: self.width,
            height: self.height,
        })
    }

    async fn close(&mut self) {
        self.open = false;
    }

    fn is_alive(&self) -> bool {
        self.open
    }

    fn describe(&self) -> String {
        format!(
            "simulated camera {}x{} @ {:.1} fps",
            self.width, self.height, self.fps
        )
    }
}

struct ActiveCapture {
    session_id: String,
    started: Timestamp,
    cancel: CancellationToken,
    task: JoinHandle<CaptureLoopResult>,
    sync_log: CsvLog<SyncMarkRow>,
    frames_path: PathBuf,
    sync_path: PathBuf,
}

struct CaptureLoopResult {
    source: Box<dyn FrameSource>,
    frames: CsvLog<FrameRow>,
    error: Option<StorageError>,
}

/// Recorder for a thermal or RGB camera.
pub struct CameraRecorder {
    kind: SensorKind,
    time_base: SharedTimeBase,
    recovery: Option<SharedRecoveryManager>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    active: Mutex<Option<ActiveCapture>>,
    lifecycle: tokio::sync::Mutex<()>,
    running: AtomicBool,
    healthy: Arc<AtomicBool>,
    frame_count: Arc<AtomicU64>,
    last_summary: Mutex<SessionSummary>,
    last_failure: Mutex<Option<StopError>>,
    listeners: Arc<ListenerRegistry<RecorderEvent>>,
}

impl CameraRecorder {
    pub fn new(kind: SensorKind, source: Box<dyn FrameSource>, time_base: SharedTimeBase) -> Self {
        Self {
            kind,
            time_base,
            recovery: None,
            source: Mutex::new(Some(source)),
            active: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            healthy: Arc::new(AtomicBool::new(true)),
            frame_count: Arc::new(AtomicU64::new(0)),
            last_summary: Mutex::new(SessionSummary::empty(kind)),
            last_failure: Mutex::new(None),
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }

    pub fn thermal(source: Box<dyn FrameSource>, time_base: SharedTimeBase) -> Self {
        Self::new(SensorKind::Thermal, source, time_base)
    }

    pub fn rgb(source: Box<dyn FrameSource>, time_base: SharedTimeBase) -> Self {
        Self::new(SensorKind::Rgb, source, time_base)
    }

    /// Reports capture faults to `recovery`.
    pub fn with_recovery(mut self, recovery: SharedRecoveryManager) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Frames written in the current (or last) recording.
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    fn open_logs(
        &self,
        layout: &SessionLayout,
    ) -> Result<(CsvLog<FrameRow>, CsvLog<SyncMarkRow>), StorageError> {
        layout.ensure()?;
        let frames_path = layout.frames_csv(self.kind);
        let frames = CsvLog::create(&frames_path, &FRAMES_HEADER, 1)?;
        match CsvLog::sync_marks(&layout.camera_sync_marks_csv(self.kind)) {
            Ok(sync_log) => Ok((frames, sync_log)),
            Err(e) => {
                drop(frames);
                let _ = std::fs::remove_file(&frames_path);
                Err(e)
            }
        }
    }
}

struct CaptureLoop {
    kind: SensorKind,
    session_id: String,
    source: Box<dyn FrameSource>,
    frames: CsvLog<FrameRow>,
    time_base: SharedTimeBase,
    recovery: Option<SharedRecoveryManager>,
    cancel: CancellationToken,
    healthy: Arc<AtomicBool>,
    frame_count: Arc<AtomicU64>,
    listeners: Arc<ListenerRegistry<RecorderEvent>>,
}

impl CaptureLoop {
    async fn run(mut self) -> CaptureLoopResult {
        let mut outage = false;
        loop {
            let captured = tokio::select! {
                _ = self.cancel.cancelled() => break,
                captured = self.source.capture() => captured,
            };

            match captured {
                Ok(frame) => {
                    let at = self.time_base.now();
                    let row = FrameRow {
                        frame_index: self.frame_count.load(Ordering::SeqCst),
                        timestamp_ms: at.device_ms,
                        utc_timestamp_ms: at.wall_clock_ms,
                        width: frame.width,
                        height: frame.height,
                        session_id: self.session_id.clone(),
                    };
                    if let Err(e) = self.frames.append(&row) {
                        self.fail_storage(&e);
                        return CaptureLoopResult {
                            source: self.source,
                            frames: self.frames,
                            error: Some(e),
                        };
                    }
                    self.frame_count.fetch_add(1, Ordering::SeqCst);

                    if outage {
                        outage = false;
                        self.healthy.store(true, Ordering::SeqCst);
                        info!(sensor = %self.kind, "camera capture resumed");
                        self.listeners
                            .emit(&RecorderEvent::DeviceConnected { sensor: self.kind });
                    }
                }
                Err(e) => {
                    if !outage {
                        outage = true;
                        self.healthy.store(false, Ordering::SeqCst);
                        let kind = if self.source.is_alive() {
                            ErrorKind::DataStreamFailure(self.kind)
                        } else {
                            ErrorKind::SensorDisconnection(self.kind)
                        };
                        warn!(sensor = %self.kind, error = %e, "camera capture failed");
                        self.listeners
                            .emit(&RecorderEvent::DeviceDisconnected { sensor: self.kind });
                        report_fault(
                            self.recovery.as_ref(),
                            &self.time_base,
                            self.kind,
                            kind,
                            e.to_string(),
                        );
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(CAPTURE_RETRY_DELAY) => {}
                    }
                }
            }
        }

        CaptureLoopResult {
            source: self.source,
            frames: self.frames,
            error: None,
        }
    }

    fn fail_storage(&self, e: &StorageError) {
        error!(sensor = %self.kind, error = %e, "frame index write failed");
        self.healthy.store(false, Ordering::SeqCst);
        self.listeners.emit(&RecorderEvent::Error {
            sensor: self.kind,
            message: e.to_string(),
        });
        report_fault(
            self.recovery.as_ref(),
            &self.time_base,
            self.kind,
            e.error_kind()
                .unwrap_or(ErrorKind::DataStreamFailure(self.kind)),
            e.to_string(),
        );
    }
}

#[async_trait]
impl SensorRecorder for CameraRecorder {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    async fn start(&self, session_id: &str, settings: &RecorderSettings) -> Result<(), StartError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.running.load(Ordering::SeqCst) {
            return Err(StartError::AlreadyRunning);
        }

        let mut source = self.source.lock().take().ok_or_else(|| {
            StartError::Failed(format!("{} frame source is unavailable", self.kind))
        })?;

        debug!(sensor = %self.kind, source = %source.describe(), "opening frame source");
        if let Err(e) = source.open(&settings.options).await {
            warn!(sensor = %self.kind, error = %e, "frame source failed to open");
            *self.source.lock() = Some(source);
            return Err(e.into());
        }

        let layout = SessionLayout::at(&settings.session_dir);
        let (frames, sync_log) = match self.open_logs(&layout) {
            Ok(logs) => logs,
            Err(e) => {
                source.close().await;
                *self.source.lock() = Some(source);
                return Err(e.into());
            }
        };

        let frames_path = frames.path().to_path_buf();
        let sync_path = sync_log.path().to_path_buf();
        let started = self.time_base.now();
        let cancel = CancellationToken::new();
        self.frame_count.store(0, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);
        self.last_failure.lock().take();

        let capture = CaptureLoop {
            kind: self.kind,
            session_id: session_id.to_string(),
            source,
            frames,
            time_base: Arc::clone(&self.time_base),
            recovery: self.recovery.clone(),
            cancel: cancel.clone(),
            healthy: Arc::clone(&self.healthy),
            frame_count: Arc::clone(&self.frame_count),
            listeners: Arc::clone(&self.listeners),
        };
        let task = tokio::spawn(capture.run());

        *self.active.lock() = Some(ActiveCapture {
            session_id: session_id.to_string(),
            started,
            cancel,
            task,
            sync_log,
            frames_path,
            sync_path,
        });
        self.running.store(true, Ordering::SeqCst);

        info!(sensor = %self.kind, session_id, "camera recording started");
        self.listeners.emit(&RecorderEvent::Started {
            sensor: self.kind,
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    async fn stop(&self) -> Result<SessionSummary, StopError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(active) = self.active.lock().take() else {
            if let Some(e) = self.last_failure.lock().clone() {
                return Err(e);
            }
            return Ok(self.last_summary.lock().clone());
        };

        let ActiveCapture {
            session_id,
            started,
            cancel,
            task,
            sync_log,
            frames_path,
            sync_path,
        } = active;
        cancel.cancel();

        let mut failure = None;
        match task.await {
            Ok(result) => {
                if let Some(e) = &result.error {
                    warn!(sensor = %self.kind, error = %e, "capture loop ended early");
                }
                if let Err(e) = result.frames.close() {
                    failure = Some(StopError::from(e));
                }
                let mut source = result.source;
                source.close().await;
                *self.source.lock() = Some(source);
            }
            Err(e) => {
                // The frame source was owned by the task and is gone with it.
                error!(
                    sensor = %self.kind,
                    session_id = %session_id,
                    error = %e,
                    "capture task failed, frame source lost; recorder cannot start again"
                );
                self.healthy.store(false, Ordering::SeqCst);
                let message = format!("capture task failed, frame source lost: {e}");
                self.listeners.emit(&RecorderEvent::Error {
                    sensor: self.kind,
                    message: message.clone(),
                });
                report_fault(
                    self.recovery.as_ref(),
                    &self.time_base,
                    self.kind,
                    ErrorKind::SensorDisconnection(self.kind),
                    message,
                );
                failure = Some(StopError::Failed(e.to_string()));
            }
        }

        let sync_mark_count = sync_log.rows_written();
        if let Err(e) = sync_log.close() {
            if failure.is_none() {
                failure = Some(StopError::from(e));
            }
        }

        let ended = self.time_base.now();
        let summary = SessionSummary {
            sensor: self.kind,
            session_id: Some(session_id.clone()),
            start: Some(started),
            end: Some(ended),
            duration_ms: ended.millis_since(&started),
            sample_count: self.frame_count.load(Ordering::SeqCst),
            sync_mark_count,
            fallback_sample_count: 0,
            output_files: vec![frames_path, sync_path],
        };
        *self.last_summary.lock() = summary.clone();
        *self.last_failure.lock() = failure.clone();
        self.running.store(false, Ordering::SeqCst);

        info!(
            sensor = %self.kind,
            session_id = %session_id,
            frames = summary.sample_count,
            duration_ms = summary.duration_ms,
            "camera recording stopped"
        );
        self.listeners.emit(&RecorderEvent::Stopped {
            sensor: self.kind,
            summary: summary.clone(),
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn trigger_sync_mark(&self, event_type: &str, metadata: BTreeMap<String, String>) -> bool {
        let mut active = self.active.lock();
        let Some(capture) = active.as_mut() else {
            return false;
        };
        let mark = SyncMark::new(
            self.time_base.now(),
            event_type,
            capture.session_id.clone(),
            metadata,
        );
        let written = capture.sync_log.append_mark(&mark);
        drop(active);

        match written {
            Ok(()) => {
                debug!(sensor = %self.kind, event_type, "sync mark recorded");
                self.listeners.emit(&RecorderEvent::SyncMarkRecorded {
                    sensor: self.kind,
                    mark,
                });
                true
            }
            Err(e) => {
                warn!(sensor = %self.kind, error = %e, "sync mark write failed");
                self.listeners.emit(&RecorderEvent::Error {
                    sensor: self.kind,
                    message: e.to_string(),
                });
                false
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn subscribe(&self, listener: RecorderListener) -> SubscriptionId {
        self.listeners.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }
}

impl std::fmt::Debug for CameraRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraRecorder")
            .field("kind", &self.kind)
            .field("service_id", &recorder_service_id(self.kind))
            .field("running", &self.is_running())
            .finish()
    }
}
