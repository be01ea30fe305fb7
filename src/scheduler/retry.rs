use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Classification of a launch/execution error for retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Worth retrying: the condition is expected to clear on its own.
    Transient,
    /// Retrying cannot help without operator intervention.
    Permanent,
    /// Unrecognized; treated as retryable but logged distinctly.
    Unknown,
}

const TRANSIENT_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timed out",
    "timeout",
    "temporarily unavailable",
    "resource temporarily",
    "out of memory",
    "cannot allocate memory",
    "no space left",
    "too many open files",
];

const PERMANENT_PATTERNS: &[&str] = &[
    "not found",
    "no such image",
    "no such file",
    "permission denied",
    "unauthorized",
    "access denied",
    "forbidden",
    "command not found",
    "executable file not found",
];

/// Map a free-text error signal to a retry classification.
pub fn classify(message: &str) -> ErrorKind {
    let msg = message.to_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| msg.contains(p)) {
        return ErrorKind::Transient;
    }
    if PERMANENT_PATTERNS.iter().any(|p| msg.contains(p)) {
        return ErrorKind::Permanent;
    }
    ErrorKind::Unknown
}

/// A named retry policy: attempt ceiling plus a capped exponential backoff
/// curve with jitter. Selected per job from its priority.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    pub name: &'static str,
    pub max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl RetryStrategy {
    pub fn from_config(name: &'static str, cfg: &RetryConfig) -> Self {
        Self {
            name,
            max_attempts: cfg.max_attempts,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            jitter_factor: cfg.jitter_factor,
        }
    }

    pub fn standard() -> Self {
        Self::from_config("standard", &RetryConfig::default())
    }

    /// Fast retries with a larger attempt budget, for urgent jobs.
    pub fn aggressive() -> Self {
        Self::from_config(
            "aggressive",
            &RetryConfig {
                max_attempts: 5,
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                jitter_factor: 0.25,
            },
        )
    }

    /// Few attempts, long delays, for jobs that can wait.
    pub fn conservative() -> Self {
        Self::from_config(
            "conservative",
            &RetryConfig {
                max_attempts: 2,
                base_delay_ms: 30_000,
                max_delay_ms: 900_000,
                jitter_factor: 0.25,
            },
        )
    }

    /// Strategy selection by job priority.
    pub fn for_priority(priority: i32) -> Self {
        if priority >= 80 {
            Self::aggressive()
        } else if priority <= 20 {
            Self::conservative()
        } else {
            Self::standard()
        }
    }

    /// Delay before attempt `attempt` (1-based). The first retry is
    /// immediate; later retries double up to the cap, plus jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(20);
        let exp_ms = self
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << shift)
            .min(self.max_delay.as_millis());
        let jitter = 1.0 + self.jitter_factor * rand::thread_rng().gen::<f64>();
        Duration::from_millis((exp_ms as f64 * jitter) as u64)
    }

    /// Whether a failed attempt should be retried under this strategy.
    pub fn should_retry(&self, attempt: u32, kind: ErrorKind) -> bool {
        kind != ErrorKind::Permanent && attempt < self.max_attempts
    }
}
