use std::collections::HashMap;

use crate::executor::BackendKind;

/// Retry/backoff tuning for a single named strategy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum launch attempts before a job is parked as failed.
    pub max_attempts: u32,
    /// Base delay for the exponential backoff curve.
    pub base_delay_ms: u64,
    /// Ceiling applied before jitter.
    pub max_delay_ms: u64,
    /// Fraction of the delay added as random jitter (0.0 disables).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5_000,
            max_delay_ms: 300_000,
            jitter_factor: 0.25,
        }
    }
}

/// Circuit breaker tuning, applied per backend name.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a trial.
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

/// Health check cadence and thresholds for backend targets.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Minimum time between checks of the same target.
    pub check_interval_ms: u64,
    /// Consecutive failures before a target is considered unhealthy.
    pub failure_threshold: u32,
    /// Successful checks subtract this much from the failure counter.
    pub recovery_step: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 15_000,
            failure_threshold: 3,
            recovery_step: 1,
        }
    }
}

/// Graceful degradation tuning.
#[derive(Debug, Clone)]
pub struct DegradationConfig {
    /// Memory at or above this marks a job as high-memory.
    pub high_memory_mb: u64,
    /// Factor applied to memory/cpu when reducing resources.
    pub resource_reduction_factor: f64,
    /// Jobs whose name contains this substring may be delayed.
    pub delayable_name_pattern: String,
    /// Delay applied by the delay-execution strategy.
    pub delay_ms: u64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            high_memory_mb: 4_096,
            resource_reduction_factor: 0.75,
            delayable_name_pattern: "batch".to_string(),
            delay_ms: 60_000,
        }
    }
}

/// Fallback chain tuning: which backends to try after the primary, per kind.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Ordered fallback backends per primary backend kind.
    pub chains: HashMap<BackendKind, Vec<BackendKind>>,
    /// Base delay between fallback attempts.
    pub backoff_base_ms: u64,
    /// Ceiling on the inter-attempt delay.
    pub backoff_max_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        let mut chains = HashMap::new();
        chains.insert(BackendKind::Docker, vec![BackendKind::Cloud]);
        chains.insert(BackendKind::Cloud, vec![BackendKind::Docker]);
        Self {
            chains,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

/// Worker orchestration loop tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Global cap on simultaneously running jobs for this worker.
    pub max_concurrent: usize,
    /// How often the loop polls for ready jobs and running-job status.
    pub poll_interval_ms: u64,
    /// Wall-clock budget for a single batch of claims.
    pub batch_timeout_ms: u64,
    /// Ceiling on draining in-flight jobs during shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            poll_interval_ms: 1_000,
            batch_timeout_ms: 30_000,
            shutdown_timeout_ms: 60_000,
        }
    }
}

/// Queue-level limits and claim contention tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum jobs admitted to the queue at once.
    pub max_queued_jobs: usize,
    /// Attempts at claiming before a busy store error surfaces.
    pub claim_attempts: u32,
    /// Base delay for claim-contention backoff.
    pub claim_backoff_base_ms: u64,
    /// Cap on the claim-contention backoff delay.
    pub claim_backoff_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queued_jobs: 10_000,
            claim_attempts: 5,
            claim_backoff_base_ms: 50,
            claim_backoff_max_ms: 1_000,
        }
    }
}

/// Sandbox hardening applied to every container the Docker backend starts.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Image used when a job does not name one.
    pub default_image: String,
    /// Disable network access in the container.
    pub network_disabled: bool,
    /// Drop all capabilities and forbid privilege escalation.
    pub hardened: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            default_image: "alpine:latest".to_string(),
            network_disabled: true,
            hardened: true,
        }
    }
}

/// Connection descriptor for a serverless container platform.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Base URL of the platform's job API.
    pub base_url: String,
    /// Bearer token, if the platform requires one.
    pub api_token: Option<String>,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8801".to_string(),
            api_token: None,
            request_timeout_ms: 30_000,
        }
    }
}
