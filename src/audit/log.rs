//! Persisted audit statistics.
//!
//! Counters only; no sample values or participant data are kept here.

use crate::core::SubscriptionId;
use crate::orchestrator::{OrchestratorEvent, RecordingOrchestrator};
use crate::recovery::{ErrorRecoveryManager, RecoveryEvent};
use crate::storage::{read_json, write_json_atomic, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Running counters for the capture stack.
#[derive(Debug)]
pub struct AuditLog {
    sessions_started: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,
    partial_starts: AtomicU64,
    sync_marks: AtomicU64,
    samples_recorded: AtomicU64,
    recoveries_started: AtomicU64,
    recoveries_succeeded: AtomicU64,
    recoveries_failed: AtomicU64,
    unresolved_errors: AtomicU64,
    health_flips: AtomicU64,
    run_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            partial_starts: AtomicU64::new(0),
            sync_marks: AtomicU64::new(0),
            samples_recorded: AtomicU64::new(0),
            recoveries_started: AtomicU64::new(0),
            recoveries_succeeded: AtomicU64::new(0),
            recoveries_failed: AtomicU64::new(0),
            unresolved_errors: AtomicU64::new(0),
            health_flips: AtomicU64::new(0),
            run_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Audit log backed by `path`, seeded from it if it exists.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            warn!(error = %e, "could not load previous audit stats");
        }

        log
    }

    pub fn record_session_started(&self, partial: bool) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        if partial {
            self.partial_starts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_session_completed(&self, samples: u64, sync_marks: u64) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
        self.samples_recorded.fetch_add(samples, Ordering::Relaxed);
        self.sync_marks.fetch_add(sync_marks, Ordering::Relaxed);
    }

    pub fn record_session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery_event(&self, event: &RecoveryEvent) {
        let counter = match event {
            RecoveryEvent::RecoveryStarted { .. } => &self.recoveries_started,
            RecoveryEvent::RecoverySucceeded { .. } => &self.recoveries_succeeded,
            RecoveryEvent::RecoveryFailed { .. } => &self.recoveries_failed,
            RecoveryEvent::Unresolved { .. } => &self.unresolved_errors,
            RecoveryEvent::ServiceHealthChanged { .. } => &self.health_flips,
            RecoveryEvent::ErrorDetected(_) | RecoveryEvent::AttemptFailed { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts orchestrator outcomes. Saves after every stopped recording when
    /// persistence is enabled.
    pub fn observe_orchestrator(
        self: &Arc<Self>,
        orchestrator: &RecordingOrchestrator,
    ) -> SubscriptionId {
        let log = Arc::clone(self);
        orchestrator.subscribe(move |event| match event {
            OrchestratorEvent::RecordingStarted(result) => {
                log.record_session_started(result.is_partial());
            }
            OrchestratorEvent::StartFailed { .. } => log.record_session_failed(),
            OrchestratorEvent::RecordingStopped(summary) => {
                log.record_session_completed(
                    summary.session.sample_count(),
                    summary.session.sync_marks.len() as u64,
                );
                if let Err(e) = log.save() {
                    warn!(error = %e, "failed to save audit stats");
                }
            }
            OrchestratorEvent::StartCancelled(_)
            | OrchestratorEvent::StateChanged { .. }
            | OrchestratorEvent::SensorStatusChanged { .. } => {}
        })
    }

    pub fn observe_recovery(self: &Arc<Self>, recovery: &ErrorRecoveryManager) -> SubscriptionId {
        let log = Arc::clone(self);
        recovery.subscribe(move |event| log.record_recovery_event(event))
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            partial_starts: self.partial_starts.load(Ordering::Relaxed),
            sync_marks: self.sync_marks.load(Ordering::Relaxed),
            samples_recorded: self.samples_recorded.load(Ordering::Relaxed),
            recoveries_started: self.recoveries_started.load(Ordering::Relaxed),
            recoveries_succeeded: self.recoveries_succeeded.load(Ordering::Relaxed),
            recoveries_failed: self.recoveries_failed.load(Ordering::Relaxed),
            unresolved_errors: self.unresolved_errors.load(Ordering::Relaxed),
            health_flips: self.health_flips.load(Ordering::Relaxed),
            last_updated: Utc::now(),
        }
    }

    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Recording Statistics:\n\
             - Sessions started: {} ({} partial)\n\
             - Sessions completed: {}\n\
             - Sessions failed to start: {}\n\
             - Samples recorded: {}\n\
             - Sync marks: {}\n\
             \n\
             Recovery:\n\
             - Recoveries started: {}\n\
             - Recoveries succeeded: {}\n\
             - Recoveries failed: {}\n\
             - Unresolved errors: {}\n\
             - Service health changes: {}\n\
             \n\
             Running for {} seconds",
            stats.sessions_started,
            stats.partial_starts,
            stats.sessions_completed,
            stats.sessions_failed,
            stats.samples_recorded,
            stats.sync_marks,
            stats.recoveries_started,
            stats.recoveries_succeeded,
            stats.recoveries_failed,
            stats.unresolved_errors,
            stats.health_flips,
            (Utc::now() - self.run_start).num_seconds().max(0)
        )
    }

    /// Writes the counters to the persistence path, if any.
    pub fn save(&self) -> Result<(), StorageError> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }
            write_json_atomic(path, &self.stats())?;
            debug!(path = %path.display(), "audit stats saved");
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), StorageError> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let persisted: AuditStats = read_json(path)?;
        self.sessions_started
            .store(persisted.sessions_started, Ordering::Relaxed);
        self.sessions_completed
            .store(persisted.sessions_completed, Ordering::Relaxed);
        self.sessions_failed
            .store(persisted.sessions_failed, Ordering::Relaxed);
        self.partial_starts
            .store(persisted.partial_starts, Ordering::Relaxed);
        self.sync_marks.store(persisted.sync_marks, Ordering::Relaxed);
        self.samples_recorded
            .store(persisted.samples_recorded, Ordering::Relaxed);
        self.recoveries_started
            .store(persisted.recoveries_started, Ordering::Relaxed);
        self.recoveries_succeeded
            .store(persisted.recoveries_succeeded, Ordering::Relaxed);
        self.recoveries_failed
            .store(persisted.recoveries_failed, Ordering::Relaxed);
        self.unresolved_errors
            .store(persisted.unresolved_errors, Ordering::Relaxed);
        self.health_flips
            .store(persisted.health_flips, Ordering::Relaxed);
        Ok(())
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the audit counters; also the `audit.json` format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub partial_starts: u64,
    pub sync_marks: u64,
    pub samples_recorded: u64,
    pub recoveries_started: u64,
    pub recoveries_succeeded: u64,
    pub recoveries_failed: u64,
    #[serde(default)]
    pub unresolved_errors: u64,
    #[serde(default)]
    pub health_flips: u64,
    pub last_updated: DateTime<Utc>,
}

pub type SharedAuditLog = Arc<AuditLog>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SensorKind, Timestamp};
    use crate::recovery::{ErrorKind, RecoverableError, UnresolvedReason};
    use tempfile::TempDir;

    fn error() -> RecoverableError {
        RecoverableError::new(
            ErrorKind::SensorDisconnection(SensorKind::Biosignal),
            "recorder.biosignal",
            "link lost",
            Timestamp::default(),
        )
    }

    #[test]
    fn test_counting() {
        let log = AuditLog::new();
        log.record_session_started(false);
        log.record_session_started(true);
        log.record_session_completed(1280, 3);
        log.record_recovery_event(&RecoveryEvent::RecoverySucceeded {
            error: error(),
            attempts: 2,
        });
        log.record_recovery_event(&RecoveryEvent::Unresolved {
            error: error(),
            reason: UnresolvedReason::NoStrategy,
        });
        log.record_recovery_event(&RecoveryEvent::ErrorDetected(error()));

        let stats = log.stats();
        assert_eq!(stats.sessions_started, 2);
        assert_eq!(stats.partial_starts, 1);
        assert_eq!(stats.samples_recorded, 1280);
        assert_eq!(stats.sync_marks, 3);
        assert_eq!(stats.recoveries_succeeded, 1);
        assert_eq!(stats.unresolved_errors, 1);
        assert_eq!(stats.recoveries_started, 0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.json");

        let log = AuditLog::with_persistence(path.clone());
        log.record_session_started(true);
        log.record_session_completed(10, 2);
        log.save().unwrap();

        let reloaded = AuditLog::with_persistence(path);
        let stats = reloaded.stats();
        assert_eq!(stats.sessions_started, 1);
        assert_eq!(stats.partial_starts, 1);
        assert_eq!(stats.samples_recorded, 10);
    }

    #[test]
    fn test_summary_format() {
        let summary = AuditLog::new().summary();
        assert!(summary.contains("Sessions started"));
        assert!(summary.contains("Recoveries succeeded"));
    }
}
