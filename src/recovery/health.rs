//! Background health monitoring for registered services.

use super::types::{ErrorKind, HealthCheck, RecoverableError, RecoveryEvent, ServiceHealth, Severity};
use super::{ErrorRecoveryManager, Inner};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl ErrorRecoveryManager {
    /// Registers (or replaces) the health check for `service_id` and makes
    /// sure the monitor loop is running.
    pub fn register_health_check(&self, service_id: impl Into<String>, check: HealthCheck) {
        let service_id = service_id.into();
        debug!(service_id = %service_id, "health check registered");
        self.inner
            .health_checks
            .write()
            .insert(service_id.clone(), check);
        self.inner
            .health
            .write()
            .entry(service_id)
            .or_default();
        self.start_health_monitor();
    }

    /// Returns false if the service was not registered.
    pub fn unregister_service(&self, service_id: &str) -> bool {
        self.inner.health.write().remove(service_id);
        let removed = self.inner.health_checks.write().remove(service_id).is_some();
        if removed {
            debug!(service_id, "health check unregistered");
        }
        removed
    }

    pub fn service_health(&self) -> BTreeMap<String, ServiceHealth> {
        self.inner.health.read().clone()
    }

    /// Starts the polling loop if it is not already running. A no-op outside a
    /// tokio runtime or after shutdown.
    pub fn start_health_monitor(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, health monitor not started");
            return;
        };
        if self.inner.monitor_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            info!(
                interval_ms = inner.health_check_interval.as_millis() as u64,
                "health monitor started"
            );
            let mut ticker = tokio::time::interval(inner.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => Inner::poll_services(&inner).await,
                }
            }
            info!("health monitor stopped");
        });
    }

    /// Polls every registered service once. The monitor loop calls this on
    /// each tick; it is public so callers can force a check.
    pub async fn check_services(&self) {
        Inner::poll_services(&self.inner).await;
    }
}

impl Inner {
    async fn poll_services(this: &Arc<Self>) {
        let checks: Vec<(String, HealthCheck)> = this
            .health_checks
            .read()
            .iter()
            .map(|(id, check)| (id.clone(), Arc::clone(check)))
            .collect();
        if checks.is_empty() {
            return;
        }

        let timeout = this.health_check_timeout;
        let results = join_all(checks.into_iter().map(|(service_id, check)| async move {
            let healthy = tokio::time::timeout(timeout, check()).await.unwrap_or(false);
            (service_id, healthy)
        }))
        .await;

        for (service_id, healthy) in results {
            Self::record_health(this, service_id, healthy);
        }
    }

    fn record_health(this: &Arc<Self>, service_id: String, healthy: bool) {
        let now = this.time_base.now();
        let (flipped, escalate, failures) = {
            let mut health = this.health.write();
            // Unregistered while the probe was in flight.
            let Some(entry) = health.get_mut(&service_id) else {
                return;
            };
            let flipped = entry.healthy != healthy;
            entry.healthy = healthy;
            entry.last_checked = Some(now);
            if healthy {
                entry.consecutive_failures = 0;
            } else {
                entry.consecutive_failures += 1;
            }
            let escalate = !healthy
                && entry.consecutive_failures % this.health_failure_threshold == 0;
            (flipped, escalate, entry.consecutive_failures)
        };

        if flipped {
            if healthy {
                info!(service_id = %service_id, "service healthy again");
            } else {
                warn!(service_id = %service_id, "service became unhealthy");
            }
            this.emit(RecoveryEvent::ServiceHealthChanged {
                service_id: service_id.clone(),
                healthy,
            });
        }

        if escalate {
            let error = RecoverableError::new(
                ErrorKind::ServiceUnhealthy,
                service_id.clone(),
                format!("{service_id} failed {failures} consecutive health checks"),
                now,
            )
            .with_severity(Severity::High)
            .with_context("consecutive_failures", failures.to_string());
            Self::report(this, error);
        }
    }
}
