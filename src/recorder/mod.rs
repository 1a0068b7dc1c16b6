//! Sensor recorders.
//!
//! Every data source (thermal imager, RGB camera, biosignal sensor) is driven
//! through the [`SensorRecorder`] trait. A recorder exclusively owns its
//! hardware handle and its output files; nothing else writes to them.

pub mod biosignal;
pub mod camera;
pub mod types;

pub use biosignal::{
    AcquisitionMode, BiosignalRecorder, FallbackGenerator, GsrTransducer, ReplayTransducer,
    TransducerError,
};
pub use camera::{CameraRecorder, Frame, FrameSource, FrameSourceError, SimulatedFrameSource};
pub use types::{
    recorder_service_id, RecorderEvent, RecorderListener, RecorderSettings, StartError, StopError,
};

use crate::core::{SensorKind, SessionSummary, SharedTimeBase, SubscriptionId};
use crate::recovery::{ErrorKind, RecoverableError, ReportOutcome, SharedRecoveryManager};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Capability interface implemented by every sensor recorder.
///
/// Failures are returned as typed results, never panics.
#[async_trait]
pub trait SensorRecorder: Send + Sync {
    fn kind(&self) -> SensorKind;

    /// Starts recording into `settings.session_dir`.
    ///
    /// Returns [`StartError::AlreadyRunning`] if already started. On any other
    /// error the recorder is fully rolled back.
    async fn start(&self, session_id: &str, settings: &RecorderSettings) -> Result<(), StartError>;

    /// Flushes and closes everything the recorder owns. When not running,
    /// returns the last summary.
    async fn stop(&self) -> Result<SessionSummary, StopError>;

    /// Appends a sync mark. Returns false when not running.
    fn trigger_sync_mark(&self, event_type: &str, metadata: BTreeMap<String, String>) -> bool;

    /// Cheap, non-blocking health probe.
    fn is_healthy(&self) -> bool;

    fn is_running(&self) -> bool;

    /// Whether this recorder has a sync-mark channel.
    fn supports_sync_marks(&self) -> bool {
        true
    }

    fn subscribe(&self, listener: RecorderListener) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

pub type SharedRecorder = Arc<dyn SensorRecorder>;

/// Forwards a recorder fault to the recovery manager, if one is attached.
pub(crate) fn report_fault(
    recovery: Option<&SharedRecoveryManager>,
    time_base: &SharedTimeBase,
    sensor: SensorKind,
    kind: ErrorKind,
    message: String,
) {
    let Some(recovery) = recovery else {
        return;
    };
    let error = RecoverableError::new(kind, recorder_service_id(sensor), message, time_base.now())
        .with_context("sensor", sensor.as_str());
    if let ReportOutcome::Surfaced(reason) = recovery.report_error(error) {
        warn!(sensor = %sensor, kind = %kind, reason = %reason, "recorder fault not recoverable");
    }
}
