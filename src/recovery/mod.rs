//! Error recovery manager.
//!
//! Fault detection happens in recorders and the orchestrator; remediation
//! happens here. Each [`ErrorKind`] maps to at most one [`RecoveryStrategy`],
//! fixed when the manager is built. Reported errors either surface immediately
//! (fatal severity, no strategy) or run a bounded retry loop on a background
//! task. A health monitor polls registered services and escalates services
//! that stay unhealthy.

pub mod health;
pub mod strategies;
pub mod types;

pub use strategies::{default_strategies, health_probe_strategy};
pub use types::{
    health_check, ErrorKind, HealthCheck, RecoverableError, RecoveryContext, RecoveryEvent,
    RecoveryOutcome, RecoveryResult, RecoveryStatus, RecoveryStrategy, ServiceHealth, Severity,
    UnresolvedReason,
};

use crate::core::{ListenerRegistry, SharedTimeBase, SubscriptionId};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

type RecoveryKey = (String, ErrorKind);

/// What [`ErrorRecoveryManager::report_error`] did with an error.
#[derive(Debug)]
pub enum ReportOutcome {
    /// Not retried; the caller must halt or degrade the affected recording.
    Surfaced(UnresolvedReason),
    /// A recovery loop was started.
    Recovering(RecoveryHandle),
    /// A recovery loop for the same service and kind is already running.
    Deduplicated,
}

impl ReportOutcome {
    pub fn is_surfaced(&self) -> bool {
        matches!(self, ReportOutcome::Surfaced(_))
    }
}

/// Handle to a running recovery loop.
#[derive(Debug)]
pub struct RecoveryHandle {
    error: RecoverableError,
    join: JoinHandle<RecoveryOutcome>,
}

impl RecoveryHandle {
    /// Waits for the loop to finish.
    pub async fn wait(self) -> RecoveryOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "recovery task ended abnormally");
                RecoveryOutcome {
                    error: self.error,
                    status: RecoveryStatus::Cancelled,
                    attempts: 0,
                }
            }
        }
    }
}

pub(crate) struct Inner {
    time_base: SharedTimeBase,
    strategies: HashMap<ErrorKind, RecoveryStrategy>,
    active: Mutex<HashSet<RecoveryKey>>,
    health_checks: RwLock<BTreeMap<String, HealthCheck>>,
    health: RwLock<BTreeMap<String, ServiceHealth>>,
    listeners: ListenerRegistry<RecoveryEvent>,
    shutdown: CancellationToken,
    monitor_started: AtomicBool,
    health_check_interval: Duration,
    health_check_timeout: Duration,
    health_failure_threshold: u32,
}

/// Builder for [`ErrorRecoveryManager`].
pub struct RecoveryManagerBuilder {
    time_base: SharedTimeBase,
    strategies: HashMap<ErrorKind, RecoveryStrategy>,
    health_check_interval: Duration,
    health_check_timeout: Duration,
    health_failure_threshold: u32,
}

impl RecoveryManagerBuilder {
    /// Registers the built-in strategy table.
    pub fn with_default_strategies(mut self) -> Self {
        self.strategies.extend(default_strategies());
        self
    }

    /// Registers (or replaces) the strategy for `kind`.
    pub fn with_strategy(mut self, kind: ErrorKind, strategy: RecoveryStrategy) -> Self {
        self.strategies.insert(kind, strategy);
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn health_failure_threshold(mut self, threshold: u32) -> Self {
        self.health_failure_threshold = threshold.max(1);
        self
    }

    pub fn build(self) -> Arc<ErrorRecoveryManager> {
        info!(
            strategies = self.strategies.len(),
            interval_ms = self.health_check_interval.as_millis() as u64,
            threshold = self.health_failure_threshold,
            "error recovery manager initialized"
        );
        Arc::new(ErrorRecoveryManager {
            inner: Arc::new(Inner {
                time_base: self.time_base,
                strategies: self.strategies,
                active: Mutex::new(HashSet::new()),
                health_checks: RwLock::new(BTreeMap::new()),
                health: RwLock::new(BTreeMap::new()),
                listeners: ListenerRegistry::new(),
                shutdown: CancellationToken::new(),
                monitor_started: AtomicBool::new(false),
                health_check_interval: self.health_check_interval,
                health_check_timeout: self.health_check_timeout,
                health_failure_threshold: self.health_failure_threshold,
            }),
        })
    }
}

/// Process-wide recovery policy engine. Construct once and share the `Arc`.
pub struct ErrorRecoveryManager {
    inner: Arc<Inner>,
}

/// Thread-safe shared recovery manager.
pub type SharedRecoveryManager = Arc<ErrorRecoveryManager>;

impl ErrorRecoveryManager {
    pub fn builder(time_base: SharedTimeBase) -> RecoveryManagerBuilder {
        RecoveryManagerBuilder {
            time_base,
            strategies: HashMap::new(),
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            health_failure_threshold: DEFAULT_HEALTH_FAILURE_THRESHOLD,
        }
    }

    /// Manager with the built-in strategy table and default health settings.
    pub fn with_defaults(time_base: SharedTimeBase) -> SharedRecoveryManager {
        Self::builder(time_base).with_default_strategies().build()
    }

    pub fn time_base(&self) -> &SharedTimeBase {
        &self.inner.time_base
    }

    pub fn strategy(&self, kind: ErrorKind) -> Option<&RecoveryStrategy> {
        self.inner.strategies.get(&kind)
    }

    /// Classifies `error` and starts recovery if a strategy applies.
    ///
    /// Must be called from within a tokio runtime when a strategy is found.
    pub fn report_error(&self, error: RecoverableError) -> ReportOutcome {
        Inner::report(&self.inner, error)
    }

    /// `(service_id, kind)` pairs with a recovery loop in flight.
    pub fn active_recoveries(&self) -> Vec<(String, ErrorKind)> {
        let mut active: Vec<_> = self.inner.active.lock().iter().cloned().collect();
        active.sort();
        active
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&RecoveryEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancels the health monitor and every in-flight recovery loop, and
    /// drops all listeners.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!(
            active = self.inner.active.lock().len(),
            "shutting down error recovery manager"
        );
        self.inner.shutdown.cancel();
        self.inner.health_checks.write().clear();
        self.inner.listeners.clear();
    }
}

impl Drop for ErrorRecoveryManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Removes the dedup key when the recovery task ends, however it ends.
struct ActiveGuard {
    inner: Arc<Inner>,
    key: RecoveryKey,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.active.lock().remove(&self.key);
    }
}

impl Inner {
    fn emit(&self, event: RecoveryEvent) {
        self.listeners.emit(&event);
    }

    fn report(this: &Arc<Self>, error: RecoverableError) -> ReportOutcome {
        warn!(
            service_id = %error.service_id,
            kind = %error.kind,
            severity = ?error.severity,
            "error reported: {}",
            error.message
        );
        this.emit(RecoveryEvent::ErrorDetected(error.clone()));

        if error.severity == Severity::Fatal {
            return this.surface(error, UnresolvedReason::Fatal);
        }
        if this.shutdown.is_cancelled() {
            return this.surface(error, UnresolvedReason::ShuttingDown);
        }
        let Some(strategy) = this.strategies.get(&error.kind).cloned() else {
            return this.surface(error, UnresolvedReason::NoStrategy);
        };

        let key = (error.service_id.clone(), error.kind);
        if !this.active.lock().insert(key.clone()) {
            debug!(
                service_id = %error.service_id,
                kind = %error.kind,
                "recovery already in progress, report deduplicated"
            );
            return ReportOutcome::Deduplicated;
        }

        let guard = ActiveGuard {
            inner: Arc::clone(this),
            key,
        };
        let inner = Arc::clone(this);
        let cancel = this.shutdown.child_token();
        let task_error = error.clone();
        let join = tokio::spawn(async move {
            let outcome = inner.run_recovery(task_error, strategy, cancel).await;
            drop(guard);
            inner.finish(&outcome);
            outcome
        });

        ReportOutcome::Recovering(RecoveryHandle { error, join })
    }

    fn surface(&self, error: RecoverableError, reason: UnresolvedReason) -> ReportOutcome {
        error!(
            service_id = %error.service_id,
            kind = %error.kind,
            reason = %reason,
            "error surfaced without recovery: {}",
            error.message
        );
        self.emit(RecoveryEvent::Unresolved {
            error,
            reason: reason.clone(),
        });
        ReportOutcome::Surfaced(reason)
    }

    async fn run_recovery(
        &self,
        error: RecoverableError,
        strategy: RecoveryStrategy,
        cancel: CancellationToken,
    ) -> RecoveryOutcome {
        info!(
            service_id = %error.service_id,
            kind = %error.kind,
            strategy = %strategy.name,
            max_retries = strategy.max_retries,
            "starting recovery"
        );
        self.emit(RecoveryEvent::RecoveryStarted {
            error: error.clone(),
            strategy: strategy.name.clone(),
            max_retries: strategy.max_retries,
        });

        let mut last_message = String::new();
        for attempt in 1..=strategy.max_retries {
            if attempt > 1 {
                tokio::select! {
                    _ = cancel.cancelled() => return cancelled(error, attempt - 1),
                    _ = tokio::time::sleep(strategy.retry_delay) => {}
                }
            }

            let health = self.health_checks.read().get(&error.service_id).cloned();
            let ctx = RecoveryContext::new(error.clone(), attempt, strategy.max_retries, health);
            let action = AssertUnwindSafe(async { strategy.run(ctx).await })
                .catch_unwind();
            let result = tokio::select! {
                _ = cancel.cancelled() => return cancelled(error, attempt),
                result = action => result,
            };
            let result = match result {
                Ok(result) => result,
                Err(panic) => {
                    let message = format!("recovery action panicked: {}", panic_message(&*panic));
                    error!(
                        service_id = %error.service_id,
                        kind = %error.kind,
                        attempt,
                        "{message}"
                    );
                    return RecoveryOutcome {
                        error,
                        status: RecoveryStatus::Failed(message),
                        attempts: attempt,
                    };
                }
            };

            match result {
                RecoveryResult::Recovered => {
                    return RecoveryOutcome {
                        error,
                        status: RecoveryStatus::Succeeded,
                        attempts: attempt,
                    };
                }
                RecoveryResult::Retry(message) => {
                    warn!(
                        service_id = %error.service_id,
                        kind = %error.kind,
                        attempt,
                        max_retries = strategy.max_retries,
                        "recovery attempt failed: {message}"
                    );
                    self.emit(RecoveryEvent::AttemptFailed {
                        error: error.clone(),
                        attempt,
                        message: message.clone(),
                    });
                    last_message = message;
                }
                RecoveryResult::Abort(message) => {
                    if strategy.requires_intervention {
                        self.emit(RecoveryEvent::Unresolved {
                            error: error.clone(),
                            reason: UnresolvedReason::InterventionRequired(message.clone()),
                        });
                    }
                    return RecoveryOutcome {
                        error,
                        status: RecoveryStatus::Failed(message),
                        attempts: attempt,
                    };
                }
            }
        }

        RecoveryOutcome {
            error,
            status: RecoveryStatus::Failed(format!(
                "gave up after {} attempts: {last_message}",
                strategy.max_retries
            )),
            attempts: strategy.max_retries,
        }
    }

    fn finish(&self, outcome: &RecoveryOutcome) {
        let error = &outcome.error;
        match &outcome.status {
            RecoveryStatus::Succeeded => {
                info!(
                    service_id = %error.service_id,
                    kind = %error.kind,
                    attempts = outcome.attempts,
                    "recovery succeeded"
                );
                self.emit(RecoveryEvent::RecoverySucceeded {
                    error: error.clone(),
                    attempts: outcome.attempts,
                });
            }
            RecoveryStatus::Failed(message) => {
                error!(
                    service_id = %error.service_id,
                    kind = %error.kind,
                    attempts = outcome.attempts,
                    "recovery failed: {message}"
                );
                self.emit(RecoveryEvent::RecoveryFailed {
                    error: error.clone(),
                    attempts: outcome.attempts,
                    message: message.clone(),
                });
            }
            RecoveryStatus::Cancelled => {
                debug!(
                    service_id = %error.service_id,
                    kind = %error.kind,
                    "recovery cancelled"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn cancelled(error: RecoverableError, attempts: u32) -> RecoveryOutcome {
    RecoveryOutcome {
        error,
        status: RecoveryStatus::Cancelled,
        attempts,
    }
}
