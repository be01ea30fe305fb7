use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. All subsystems should monitor this token and drain gracefully.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}

/// Concurrency-safe set of in-flight job ids.
///
/// The worker adds every launched job and marks them off as the monitor
/// harvests them; shutdown blocks on the set draining.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    running: Mutex<HashSet<Uuid>>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_running(&self, id: Uuid) {
        self.running.lock().expect("tracker lock poisoned").insert(id);
    }

    /// No-op for ids the tracker never saw.
    pub fn mark_completed(&self, id: Uuid) {
        self.running.lock().expect("tracker lock poisoned").remove(&id);
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().expect("tracker lock poisoned").len()
    }

    pub fn running_ids(&self) -> Vec<Uuid> {
        self.running
            .lock()
            .expect("tracker lock poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Poll until every tracked job completed or `timeout` elapses.
    /// Returns whether the set drained in time.
    pub async fn wait_for_completion(&self, timeout: Duration, poll_interval: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.running_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }
    }
}

/// Tracks process-termination state for the orchestration loop.
///
/// Wraps the cancellation token so every blocking call can observe shutdown
/// promptly, and keeps the shutdown start time for the drain ceiling.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    started_at: Mutex<Option<Instant>>,
    max_shutdown: Duration,
}

impl ShutdownCoordinator {
    pub fn new(token: CancellationToken, max_shutdown: Duration) -> Self {
        Self {
            token,
            started_at: Mutex::new(None),
            max_shutdown,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request shutdown programmatically (tests, admin surface).
    pub fn trigger(&self) {
        self.mark_started();
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        if self.token.is_cancelled() {
            self.mark_started();
            return true;
        }
        false
    }

    /// Resolves once shutdown is requested, by signal or trigger.
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
        self.mark_started();
    }

    /// Whether the drain ceiling has passed since shutdown began.
    pub fn check_timeout(&self) -> bool {
        self.started_at
            .lock()
            .expect("coordinator lock poisoned")
            .map_or(false, |t| t.elapsed() >= self.max_shutdown)
    }

    pub fn remaining(&self) -> Duration {
        self.started_at
            .lock()
            .expect("coordinator lock poisoned")
            .map_or(self.max_shutdown, |t| {
                self.max_shutdown.saturating_sub(t.elapsed())
            })
    }

    fn mark_started(&self) {
        let mut started = self.started_at.lock().expect("coordinator lock poisoned");
        if started.is_none() {
            *started = Some(Instant::now());
        }
    }
}
