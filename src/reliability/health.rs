use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::HealthCheckConfig;
use crate::error::Result;
use crate::executor::{BackendTarget, ExecutorRouter};

/// Periodic (or on-demand) backend target health probing.
///
/// Consecutive failed pings accumulate on the target; successful pings decay
/// the counter. A target past the failure threshold reads as unhealthy until
/// the check interval has elapsed since its last probe.
pub struct HealthChecker {
    config: HealthCheckConfig,
    router: Arc<ExecutorRouter>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig, router: Arc<ExecutorRouter>) -> Self {
        Self { config, router }
    }

    /// Whether the target currently counts as healthy.
    pub fn is_healthy(&self, target: &BackendTarget) -> bool {
        if target.health_check_failures < self.config.failure_threshold {
            return true;
        }
        let interval = chrono::Duration::milliseconds(self.config.check_interval_ms as i64);
        target
            .last_health_check
            .map_or(true, |t| Utc::now() - t >= interval)
    }

    /// Ping one target and update its health counters. Returns the probe
    /// verdict.
    pub async fn check_target(&self, target_id: Uuid) -> Result<bool> {
        let target = self
            .router
            .get_target(target_id)
            .ok_or_else(|| crate::error::Error::InvalidConfiguration(format!(
                "unknown target {target_id}"
            )))?;
        let executor = self.router.executor_for(&target)?;
        let health = executor.health().await;
        let now = Utc::now();

        let recovery_step = self.config.recovery_step.max(1);
        self.router.update_target(target_id, |t| {
            t.last_health_check = Some(now);
            if health.healthy {
                t.health_check_failures = t.health_check_failures.saturating_sub(recovery_step);
            } else {
                t.health_check_failures += 1;
            }
        });

        if health.healthy {
            tracing::debug!(
                target = %target.endpoint,
                latency_ms = health.latency.as_millis() as u64,
                "Health check passed"
            );
        } else {
            tracing::warn!(
                target = %target.endpoint,
                error = health.error.as_deref().unwrap_or("unknown"),
                "Health check failed"
            );
        }
        Ok(health.healthy)
    }

    /// Probe every configured target once.
    pub async fn check_all(&self) -> Vec<(Uuid, bool)> {
        let mut results = Vec::new();
        for target in self.router.all_targets() {
            match self.check_target(target.id).await {
                Ok(healthy) => results.push((target.id, healthy)),
                Err(e) => {
                    tracing::warn!(target = %target.endpoint, error = %e, "Health probe errored");
                    results.push((target.id, false));
                }
            }
        }
        results
    }

    /// Periodic probe loop; exits promptly on cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.check_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Health checker stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.check_all().await;
                }
            }
        }
    }
}
