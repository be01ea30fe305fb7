use std::sync::Arc;
use std::time::Duration;

use crate::config::FallbackConfig;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::scheduler::job::Job;

/// Walks an ordered chain of executors until one accepts a job.
pub struct FallbackManager {
    backoff_base: Duration,
    backoff_max: Duration,
}

impl FallbackManager {
    pub fn new(config: &FallbackConfig) -> Self {
        Self {
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before attempt `attempt` (1-based): doubling, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .backoff_base
            .as_millis()
            .saturating_mul(1u128 << shift)
            .min(self.backoff_max.as_millis());
        Duration::from_millis(ms as u64)
    }

    /// Try the primary, then each fallback in order, sleeping between
    /// attempts. Every attempt stamps a routing note onto the job. Returns
    /// the first successful execution id, or the last error once the chain
    /// is exhausted.
    pub async fn execute_with_fallback(
        &self,
        job: &mut Job,
        primary: Arc<dyn Executor>,
        fallbacks: &[Arc<dyn Executor>],
    ) -> Result<String> {
        let mut last_error: Option<Error> = None;
        let chain = std::iter::once(&primary).chain(fallbacks.iter());
        let total = 1 + fallbacks.len();

        for (index, executor) in chain.enumerate() {
            let attempt = index as u32 + 1;
            let note = if index == 0 {
                format!("primary {} (attempt {attempt}/{total})", executor.kind())
            } else {
                format!("fallback {} (attempt {attempt}/{total})", executor.kind())
            };
            job.metadata.insert("routing_reason".to_string(), note);

            if attempt > 1 {
                tokio::time::sleep(self.backoff_delay(attempt - 1)).await;
            }

            match executor.launch(job).await {
                Ok(execution_id) => {
                    if index > 0 {
                        tracing::info!(
                            job_id = %job.id,
                            backend = %executor.kind(),
                            attempt,
                            "Fallback launch succeeded"
                        );
                    }
                    return Ok(execution_id);
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        backend = %executor.kind(),
                        attempt,
                        error = %e,
                        "Launch attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::Internal("empty executor chain".to_string())))
    }

    /// Retry a single executor with the same backoff curve.
    pub async fn retry_with_backoff(
        &self,
        job: &mut Job,
        executor: &dyn Executor,
        max_attempts: u32,
    ) -> Result<String> {
        let mut last_error: Option<Error> = None;

        for attempt in 1..=max_attempts.max(1) {
            if attempt > 1 {
                tokio::time::sleep(self.backoff_delay(attempt - 1)).await;
            }
            job.metadata.insert(
                "routing_reason".to_string(),
                format!("retry {} (attempt {attempt}/{max_attempts})", executor.kind()),
            );

            match executor.launch(job).await {
                Ok(execution_id) => return Ok(execution_id),
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        backend = %executor.kind(),
                        attempt,
                        error = %e,
                        "Retry attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::Internal("retry budget was zero".to_string())))
    }
}
