use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
        }
    }
}

/// Per-backend-name circuit breaker.
///
/// An open circuit rejects calls outright until the recovery timeout
/// elapses, then admits exactly one trial call (half-open). The trial's
/// outcome closes the circuit or re-opens it for another cool-down.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_millis(config.recovery_timeout_ms),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, name: &str) -> CircuitState {
        self.entries
            .lock()
            .expect("breaker lock poisoned")
            .get(name)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Admission check. Fails fast with [`Error::CircuitOpen`] while the
    /// circuit is open; flips to half-open (admitting this one call) once
    /// the recovery timeout has elapsed.
    pub fn check(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("breaker lock poisoned");
        let entry = entries
            .entry(name.to_string())
            .or_insert_with(BreakerEntry::new);

        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Err(Error::CircuitOpen(name.to_string())),
            CircuitState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.recovery_timeout {
                    entry.state = CircuitState::HalfOpen;
                    tracing::info!(backend = name, "Circuit half-open, admitting trial call");
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(name.to_string()))
                }
            }
        }
    }

    pub fn record_success(&self, name: &str) {
        let mut entries = self.entries.lock().expect("breaker lock poisoned");
        let entry = entries
            .entry(name.to_string())
            .or_insert_with(BreakerEntry::new);
        if entry.state != CircuitState::Closed {
            tracing::info!(backend = name, "Circuit closed");
        }
        entry.state = CircuitState::Closed;
        entry.failure_count = 0;
        entry.opened_at = None;
    }

    pub fn record_failure(&self, name: &str) {
        let mut entries = self.entries.lock().expect("breaker lock poisoned");
        let entry = entries
            .entry(name.to_string())
            .or_insert_with(BreakerEntry::new);
        entry.failure_count += 1;

        let should_open = entry.state == CircuitState::HalfOpen
            || entry.failure_count >= self.failure_threshold;
        if should_open && entry.state != CircuitState::Open {
            entry.state = CircuitState::Open;
            entry.opened_at = Some(Instant::now());
            tracing::warn!(
                backend = name,
                failures = entry.failure_count,
                "Circuit opened"
            );
        } else if should_open {
            // Already open; restart the cool-down.
            entry.opened_at = Some(Instant::now());
        }
    }

    /// Route a call through the breaker: admission check, then outcome
    /// bookkeeping.
    pub async fn call<T, F, Fut>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check(name)?;
        match f().await {
            Ok(value) => {
                self.record_success(name);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(name);
                Err(e)
            }
        }
    }
}
