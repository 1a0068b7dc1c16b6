//! Types shared by all sensor recorders.

use crate::core::{SensorKind, SessionSummary, SyncMark};
use crate::recovery::ErrorKind;
use crate::storage::StorageError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Settings handed to [`SensorRecorder::start`](super::SensorRecorder::start).
#[derive(Debug, Clone, Default)]
pub struct RecorderSettings {
    /// Session directory, filled in by the orchestrator
    pub session_dir: PathBuf,
    /// Opaque per-sensor options, passed through untouched
    pub options: BTreeMap<String, serde_json::Value>,
}

impl RecorderSettings {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn option_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(|v| v.as_f64())
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(|v| v.as_u64())
    }
}

/// Errors that can occur when starting a recorder. A recorder that returns
/// one of these has left no files or open hardware behind.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("recorder is already running")]
    AlreadyRunning,

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("start timed out after {0:?}")]
    Timeout(Duration),

    #[error("start cancelled")]
    Cancelled,

    #[error("start failed: {0}")]
    Failed(String),
}

impl StartError {
    /// Recovery classification of this failure for `sensor`.
    pub fn error_kind(&self, sensor: SensorKind) -> ErrorKind {
        match self {
            StartError::PermissionDenied(_) if sensor != SensorKind::Biosignal => {
                ErrorKind::CameraAccessDenied
            }
            StartError::DeviceUnavailable(_) => ErrorKind::SensorDisconnection(sensor),
            StartError::Storage(e) => e
                .error_kind()
                .unwrap_or(ErrorKind::RecordingStartFailure(sensor)),
            _ => ErrorKind::RecordingStartFailure(sensor),
        }
    }
}

/// Why a stop failed. A recorder keeps its last stop failure and reports it
/// again on repeated `stop()` calls, so the error is cheap to clone.
#[derive(Debug, Clone, Error)]
pub enum StopError {
    #[error("storage error: {0}")]
    Storage(#[source] Arc<StorageError>),

    #[error("stop timed out after {0:?}")]
    Timeout(Duration),

    #[error("stop failed: {0}")]
    Failed(String),
}

impl From<StorageError> for StopError {
    fn from(e: StorageError) -> Self {
        StopError::Storage(Arc::new(e))
    }
}

/// Events published by a recorder.
#[derive(Debug, Clone)]
pub enum RecorderEvent {
    Started {
        sensor: SensorKind,
        session_id: String,
    },
    Stopped {
        sensor: SensorKind,
        summary: SessionSummary,
    },
    SyncMarkRecorded {
        sensor: SensorKind,
        mark: SyncMark,
    },
    Error {
        sensor: SensorKind,
        message: String,
    },
    DeviceConnected {
        sensor: SensorKind,
    },
    DeviceDisconnected {
        sensor: SensorKind,
    },
}

pub type RecorderListener = Box<dyn Fn(&RecorderEvent) + Send + Sync>;

/// Service id a recorder uses for health checks and error reports.
pub fn recorder_service_id(kind: SensorKind) -> String {
    format!("recorder.{}", kind.as_str())
}
