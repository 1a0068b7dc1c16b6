//! Types for the recording orchestrator.

use crate::config::Config;
use crate::core::{join_sensors, RecordingOutcome, SensorKind, Session, SyncMark};
use crate::session::SessionError;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Sync mark emitted once all selected sensors have been started.
pub const RECORDING_STARTED: &str = "RECORDING_STARTED";
/// Sync mark emitted before the active sensors are stopped.
pub const RECORDING_STOPPING: &str = "PARALLEL_RECORDING_STOPPING";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Starting,
    Active,
    Stopping,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::Starting => "starting",
            OrchestratorState::Active => "active",
            OrchestratorState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Per-sensor status as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorStatus {
    Starting,
    Recording,
    Failed(String),
    Stopping,
    Completed,
}

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Bound on each recorder's `start()`
    pub start_timeout: Duration,
    /// Bound on each recorder's `stop()`
    pub stop_timeout: Duration,
    /// If any of these fails to start, the whole start is rolled back.
    pub strict_sensors: BTreeSet<SensorKind>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            strict_sensors: BTreeSet::new(),
        }
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            start_timeout: config.start_timeout,
            stop_timeout: config.stop_timeout,
            strict_sensors: config.strict_sensors.clone(),
        }
    }
}

/// A request to start recording.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub sensors: BTreeSet<SensorKind>,
    pub session_id: Option<String>,
    pub participant_id: Option<String>,
    pub study_name: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Opaque per-sensor options, passed through to the matching recorder
    pub settings: BTreeMap<SensorKind, BTreeMap<String, serde_json::Value>>,
}

impl StartRequest {
    pub fn new(sensors: impl IntoIterator<Item = SensorKind>) -> Self {
        Self {
            sensors: sensors.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn participant(mut self, participant_id: impl Into<String>) -> Self {
        self.participant_id = Some(participant_id.into());
        self
    }

    pub fn study(mut self, study_name: impl Into<String>) -> Self {
        self.study_name = Some(study_name.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn sensor_option(
        mut self,
        sensor: SensorKind,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.settings
            .entry(sensor)
            .or_default()
            .insert(key.into(), value);
        self
    }
}

/// Outcome of a successful (possibly partial) start.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationResult {
    pub session_id: String,
    pub session_dir: PathBuf,
    pub selected: BTreeSet<SensorKind>,
    pub succeeded: BTreeSet<SensorKind>,
    /// One message per sensor that failed to start
    pub failed: BTreeMap<SensorKind, String>,
    pub outcomes: Vec<RecordingOutcome>,
    /// The `RECORDING_STARTED` mark, if a sensor could carry it
    pub start_mark: Option<SyncMark>,
}

impl OrchestrationResult {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Operator-facing description of which sensors are active.
    pub fn describe(&self) -> String {
        if self.failed.is_empty() {
            return format!("Recording with {}", join_sensors(&self.succeeded));
        }
        let failures: Vec<String> = self
            .failed
            .iter()
            .map(|(sensor, message)| format!("{}: {message}", sensor.display_name()))
            .collect();
        format!(
            "Recording with {} (failed: {})",
            join_sensors(&self.succeeded),
            failures.join("; ")
        )
    }
}

/// Final view of a stopped recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    /// The finalized session, with per-sensor summaries merged in
    pub session: Session,
    pub stop_failures: BTreeMap<SensorKind, String>,
    pub output_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    Stopped,
    NotRecording,
    /// The stop arrived while sensors were starting; the start was abandoned
    StartCancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopReport {
    pub status: StopStatus,
    /// The summary of this stop, or of the last recording when idle
    pub summary: Option<RecordingSummary>,
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("no sensors selected")]
    EmptySelection,

    #[error("no recorder registered for {0}")]
    NoRecorder(SensorKind),

    #[error("session {0} already exists")]
    SessionCollision(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("recording not started for session {session_id}: {}", describe_failures(failures))]
    AllSensorsFailed {
        session_id: String,
        failures: BTreeMap<SensorKind, String>,
    },

    #[error("orchestrator is busy ({0})")]
    Busy(OrchestratorState),

    #[error("start of session {session_id} was cancelled by a stop request")]
    StartCancelled { session_id: String },
}

fn describe_failures(failures: &BTreeMap<SensorKind, String>) -> String {
    failures
        .iter()
        .map(|(sensor, message)| format!("{}: {message}", sensor.display_name()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Events published by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    StateChanged {
        from: OrchestratorState,
        to: OrchestratorState,
    },
    SensorStatusChanged {
        sensor: SensorKind,
        status: SensorStatus,
    },
    RecordingStarted(OrchestrationResult),
    StartFailed {
        session_id: String,
        failures: BTreeMap<SensorKind, String>,
    },
    RecordingStopped(RecordingSummary),
    /// A start was abandoned by a stop request; the session is finalized.
    StartCancelled(RecordingSummary),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_messages_are_kept_per_sensor() {
        let mut failures = BTreeMap::new();
        failures.insert(SensorKind::Thermal, "device unavailable: no USB".to_string());
        failures.insert(SensorKind::Rgb, "permission denied: camera".to_string());
        let err = OrchestrationError::AllSensorsFailed {
            session_id: "S1".to_string(),
            failures,
        };
        let message = err.to_string();
        assert!(message.contains("Thermal: device unavailable: no USB"));
        assert!(message.contains("RGB: permission denied: camera"));
    }

    #[test]
    fn test_request_builder() {
        let request = StartRequest::new([SensorKind::Biosignal, SensorKind::Rgb])
            .with_session_id("S1")
            .participant("P01")
            .sensor_option(SensorKind::Rgb, "fps", serde_json::json!(60));
        assert_eq!(request.sensors.len(), 2);
        assert_eq!(request.session_id.as_deref(), Some("S1"));
        assert_eq!(
            request.settings[&SensorKind::Rgb]["fps"],
            serde_json::json!(60)
        );
    }
}
