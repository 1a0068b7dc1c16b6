//! Types for error classification and recovery.

use crate::core::{SensorKind, Timestamp};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Closed taxonomy of faults the recovery manager understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SensorDisconnection(SensorKind),
    DataStreamFailure(SensorKind),
    CameraAccessDenied,
    RecordingStartFailure(SensorKind),
    RecordingStopFailure(SensorKind),
    StorageFull,
    StorageAccessDenied,
    /// e.g. a Bluetooth link to the biosignal device
    TransportConnectionLost,
    DeviceUnresponsive,
    SessionCorruption,
    SynchronizationFailure,
    BatteryCritical,
    MemoryExhaustion,
    /// Raised by the health monitor after repeated failed polls
    ServiceUnhealthy,
}

impl ErrorKind {
    /// Severity assigned when the reporter does not choose one.
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::StorageFull
            | ErrorKind::BatteryCritical
            | ErrorKind::SessionCorruption
            | ErrorKind::MemoryExhaustion
            | ErrorKind::CameraAccessDenied => Severity::High,
            _ => Severity::Medium,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::SensorDisconnection(s) => write!(f, "{s} sensor disconnection"),
            ErrorKind::DataStreamFailure(s) => write!(f, "{s} data stream failure"),
            ErrorKind::CameraAccessDenied => f.write_str("camera access denied"),
            ErrorKind::RecordingStartFailure(s) => write!(f, "{s} recording start failure"),
            ErrorKind::RecordingStopFailure(s) => write!(f, "{s} recording stop failure"),
            ErrorKind::StorageFull => f.write_str("storage full"),
            ErrorKind::StorageAccessDenied => f.write_str("storage access denied"),
            ErrorKind::TransportConnectionLost => f.write_str("transport connection lost"),
            ErrorKind::DeviceUnresponsive => f.write_str("device unresponsive"),
            ErrorKind::SessionCorruption => f.write_str("session corruption"),
            ErrorKind::SynchronizationFailure => f.write_str("synchronization failure"),
            ErrorKind::BatteryCritical => f.write_str("battery critical"),
            ErrorKind::MemoryExhaustion => f.write_str("memory exhaustion"),
            ErrorKind::ServiceUnhealthy => f.write_str("service unhealthy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    /// Never retried; dependent recording must halt
    Fatal,
}

/// A detected fault, handed to the recovery manager exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverableError {
    pub kind: ErrorKind,
    pub service_id: String,
    pub message: String,
    pub timestamp: Timestamp,
    pub severity: Severity,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl RecoverableError {
    pub fn new(
        kind: ErrorKind,
        service_id: impl Into<String>,
        message: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            kind,
            service_id: service_id.into(),
            message: message.into(),
            timestamp,
            severity: kind.default_severity(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for RecoverableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.service_id, self.kind, self.message)
    }
}

/// Result of one recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryResult {
    Recovered,
    /// Attempt failed; try again after the strategy delay
    Retry(String),
    /// Attempt failed in a way retrying cannot fix
    Abort(String),
}

/// Async health probe registered by a service. `true` means healthy.
pub type HealthCheck = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Wraps an async closure as a [`HealthCheck`].
pub fn health_check<F, Fut>(probe: F) -> HealthCheck
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, bool> { Box::pin(probe()) })
}

/// What a recovery action is given for one attempt.
#[derive(Clone)]
pub struct RecoveryContext {
    pub error: RecoverableError,
    /// 1-based
    pub attempt: u32,
    pub max_retries: u32,
    health_check: Option<HealthCheck>,
}

impl RecoveryContext {
    pub(crate) fn new(
        error: RecoverableError,
        attempt: u32,
        max_retries: u32,
        health_check: Option<HealthCheck>,
    ) -> Self {
        Self {
            error,
            attempt,
            max_retries,
            health_check,
        }
    }

    /// Runs the originating service's health check, if one is registered.
    pub async fn probe_health(&self) -> Option<bool> {
        match &self.health_check {
            Some(check) => Some(check().await),
            None => None,
        }
    }
}

impl std::fmt::Debug for RecoveryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryContext")
            .field("error", &self.error)
            .field("attempt", &self.attempt)
            .field("has_health_check", &self.health_check.is_some())
            .finish()
    }
}

pub type RecoveryAction =
    Arc<dyn Fn(RecoveryContext) -> BoxFuture<'static, RecoveryResult> + Send + Sync>;

/// Bounded-retry remediation for one error kind.
#[derive(Clone)]
pub struct RecoveryStrategy {
    pub name: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub requires_intervention: bool,
    action: RecoveryAction,
}

impl RecoveryStrategy {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        max_retries: u32,
        retry_delay: Duration,
        action: F,
    ) -> Self
    where
        F: Fn(RecoveryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RecoveryResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            max_retries: max_retries.max(1),
            retry_delay,
            requires_intervention: false,
            action: Arc::new(move |ctx| -> BoxFuture<'static, RecoveryResult> {
                Box::pin(action(ctx))
            }),
        }
    }

    pub fn requiring_intervention(mut self) -> Self {
        self.requires_intervention = true;
        self
    }

    pub(crate) fn run(&self, ctx: RecoveryContext) -> BoxFuture<'static, RecoveryResult> {
        (self.action)(ctx)
    }
}

impl std::fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("requires_intervention", &self.requires_intervention)
            .finish()
    }
}

/// Why a reported error was not (or could not be) recovered automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    Fatal,
    NoStrategy,
    InterventionRequired(String),
    ShuttingDown,
}

impl std::fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnresolvedReason::Fatal => f.write_str("fatal severity"),
            UnresolvedReason::NoStrategy => f.write_str("no recovery strategy registered"),
            UnresolvedReason::InterventionRequired(msg) => {
                write!(f, "user intervention required: {msg}")
            }
            UnresolvedReason::ShuttingDown => f.write_str("recovery manager shutting down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStatus {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// Terminal result of one recovery loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    pub error: RecoverableError,
    pub status: RecoveryStatus,
    pub attempts: u32,
}

impl RecoveryOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RecoveryStatus::Succeeded
    }
}

/// Events emitted by the recovery manager.
#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    ErrorDetected(RecoverableError),
    RecoveryStarted {
        error: RecoverableError,
        strategy: String,
        max_retries: u32,
    },
    AttemptFailed {
        error: RecoverableError,
        attempt: u32,
        message: String,
    },
    RecoverySucceeded {
        error: RecoverableError,
        attempts: u32,
    },
    RecoveryFailed {
        error: RecoverableError,
        attempts: u32,
        message: String,
    },
    Unresolved {
        error: RecoverableError,
        reason: UnresolvedReason,
    },
    ServiceHealthChanged {
        service_id: String,
        healthy: bool,
    },
}

/// Last observed health of a registered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_checked: Option<Timestamp>,
}

impl Default for ServiceHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_checked: None,
        }
    }
}
