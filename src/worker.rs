//! Worker orchestration loop.
//!
//! Each tick fills free launch slots from the queue and polls running jobs
//! for completion. On shutdown the loop stops claiming new work and keeps
//! monitoring until in-flight jobs drain or the ceiling passes; whatever is
//! still running then is reported as interrupted, never force-failed.

use std::sync::Arc;
use std::time::Duration;

use crate::config::WorkerConfig;
use crate::scheduler::QueueManager;
use crate::shutdown::{CompletionTracker, ShutdownCoordinator};

pub struct Worker {
    queue: Arc<QueueManager>,
    tracker: Arc<CompletionTracker>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(queue: Arc<QueueManager>, config: WorkerConfig) -> Self {
        Self {
            queue,
            tracker: Arc::new(CompletionTracker::new()),
            config,
        }
    }

    pub fn tracker(&self) -> Arc<CompletionTracker> {
        self.tracker.clone()
    }

    /// Run until shutdown is requested, then drain.
    pub async fn run(&self, shutdown: &ShutdownCoordinator) {
        let cancel = shutdown.token();
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            poll_interval_ms = self.config.poll_interval_ms,
            "Worker started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick(&cancel).await;
                }
            }
        }

        self.drain(shutdown).await;
    }

    async fn tick(&self, cancel: &tokio_util::sync::CancellationToken) {
        let batch_timeout = Duration::from_millis(self.config.batch_timeout_ms);
        match self
            .queue
            .launch_next_batch(self.config.max_concurrent, batch_timeout, cancel)
            .await
        {
            Ok(outcome) => {
                for id in &outcome.launched {
                    self.tracker.add_running(*id);
                }
                for (id, error) in &outcome.errors {
                    tracing::warn!(job_id = %id, error = %error, "Job launch failed in batch");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Batch launch failed");
            }
        }

        self.monitor().await;
    }

    async fn monitor(&self) {
        match self.queue.monitor_running().await {
            Ok(report) => {
                for id in report
                    .completed
                    .iter()
                    .chain(report.failed.iter())
                    .chain(report.missing.iter())
                {
                    self.tracker.mark_completed(*id);
                }
                for (id, error) in &report.errors {
                    tracing::warn!(job_id = %id, error = %error, "Monitoring error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Monitoring pass failed");
            }
        }
    }

    /// Block for in-flight jobs after shutdown was requested, monitoring so
    /// completions are still observed, bounded by the shutdown ceiling.
    async fn drain(&self, shutdown: &ShutdownCoordinator) {
        let in_flight = self.tracker.running_count();
        if in_flight == 0 {
            tracing::info!("Worker stopped with no jobs in flight");
            return;
        }
        tracing::info!(in_flight, "Shutdown requested, draining in-flight jobs");

        let poll = Duration::from_millis(self.config.poll_interval_ms);
        while !shutdown.check_timeout() {
            self.monitor().await;
            if self.tracker.running_count() == 0 {
                tracing::info!("All in-flight jobs drained");
                return;
            }
            tokio::time::sleep(poll.min(shutdown.remaining())).await;
        }

        for id in self.tracker.running_ids() {
            tracing::warn!(job_id = %id, "Job still running at shutdown timeout, interrupted");
        }
    }
}
