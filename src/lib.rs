//! Multimodal Capture - timestamp-aligned multi-sensor recording.
//!
//! This library coordinates simultaneous capture from a thermal imager, an
//! RGB camera and a galvanic-skin-response biosignal sensor under one
//! recording session, and keeps the recording alive across transient
//! hardware and software faults.
//!
//! # Guarantees
//!
//! - **One time base**: every record carries a device/wall-clock timestamp
//!   pair from the shared [`TimeBase`]
//! - **Partial success**: a recording proceeds with whichever sensors started
//! - **No half-started sensors**: a recorder is either running or fully
//!   rolled back
//! - **Crash-safe metadata**: session metadata is written atomically
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Multimodal Capture                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐    │
//! │  │ Orchestrator │───▶│   Session    │───▶│     Storage      │    │
//! │  │ (start/stop) │    │   Manager    │    │ (csv, json, dir) │    │
//! │  └──────────────┘    └──────────────┘    └──────────────────┘    │
//! │     │        │                                     ▲             │
//! │     │        ▼                                     │             │
//! │     │  ┌──────────────────────────────────────────────┐          │
//! │     │  │  Recorders: Thermal │ RGB │ Biosignal (GSR)  │          │
//! │     │  └──────────────────────────────────────────────┘          │
//! │     │        │ faults                                            │
//! │     ▼        ▼                                                   │
//! │  ┌──────────────────┐    ┌──────────────┐                        │
//! │  │ Error Recovery + │───▶│  Audit Log   │                        │
//! │  │  Health Monitor  │    └──────────────┘                        │
//! │  └──────────────────┘                                            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use multimodal_capture::{
//!     BiosignalRecorder, Config, RecordingOrchestrator, SensorKind, SessionManager,
//!     StartRequest, TimeBase,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let time_base = TimeBase::shared();
//! let sessions = Arc::new(SessionManager::new(
//!     time_base.clone(),
//!     config.sessions_path.clone(),
//!     config.session_prefix.clone(),
//! ));
//! let orchestrator = RecordingOrchestrator::new(time_base.clone(), sessions).with_recorder(
//!     Arc::new(BiosignalRecorder::new(config.biosignal.clone(), time_base.clone())),
//! );
//!
//! let result = orchestrator
//!     .start_all(StartRequest::new([SensorKind::Biosignal]))
//!     .await?;
//! println!("{}", result.describe());
//! orchestrator.stop_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod core;
pub mod orchestrator;
pub mod recorder;
pub mod recovery;
pub mod session;
pub mod storage;

// Re-export key types at crate root for convenience
pub use audit::{AuditLog, AuditStats, SharedAuditLog};
pub use config::{BiosignalConfig, CameraConfig, Config, ConfigError, SensorSelection};
pub use core::{
    BiosignalSample, RecordingOutcome, SensorKind, Session, SessionSummary, SharedTimeBase,
    SyncMark, TimeBase, Timestamp,
};
pub use orchestrator::{
    OrchestrationError, OrchestrationResult, OrchestratorEvent, OrchestratorSettings,
    OrchestratorState, RecordingOrchestrator, StartRequest, StopReport, StopStatus,
};
pub use recorder::{
    BiosignalRecorder, CameraRecorder, RecorderSettings, SensorRecorder, SharedRecorder,
    SimulatedFrameSource, StartError, StopError,
};
pub use recovery::{
    ErrorKind, ErrorRecoveryManager, RecoverableError, RecoveryEvent, SharedRecoveryManager,
    Severity,
};
pub use session::{NewSession, SessionError, SessionEvent, SessionManager, SessionStats};
pub use storage::{SessionLayout, SignalStatistics, StorageError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
