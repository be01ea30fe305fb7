//! Queue manager: enqueue, claim, launch, retry.
//!
//! Many worker processes poll one shared [`JobStore`] concurrently; the
//! store's claim protocol is the only coordination between them. Launch
//! calls are I/O-bound and happen after the claim committed, never under a
//! store lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::executor::{BackendTarget, Executor, ExecutorRouter};
use crate::reliability::CircuitBreaker;
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::retry::{classify, ErrorKind, RetryStrategy};
use crate::scheduler::store::{JobStore, QueueStats};

/// Result of one batch of claims.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub launched: Vec<Uuid>,
    /// Per-job failures; these never abort the batch.
    pub errors: Vec<(Uuid, String)>,
}

/// What happened to one claimed job.
#[derive(Debug)]
pub enum LaunchOutcome {
    /// Backend accepted the job; it is now running.
    Launched(Job),
    /// Launch failed with a retryable error; a retry is scheduled.
    Rescheduled(Job),
    /// Launch failed permanently or the budget is spent; parked as failed
    /// pending manual intervention.
    Failed(Job),
}

/// Operator-facing view of a worker's load.
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    pub queue: QueueStats,
    pub max_concurrent: usize,
    pub available_slots: usize,
}

/// Findings of one pass over running jobs.
#[derive(Debug, Default)]
pub struct MonitorReport {
    pub completed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    /// Executions the backend no longer knows about.
    pub missing: Vec<Uuid>,
    pub errors: Vec<(Uuid, String)>,
}

enum LaunchFailure {
    /// Routing/claim/store problems: the batch caller must see these.
    Systemic(Error),
    /// The backend rejected or failed the launch; retry policy applies.
    Backend(Error),
}

pub struct QueueManager {
    store: Arc<JobStore>,
    router: Arc<ExecutorRouter>,
    config: QueueConfig,
    worker_id: String,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl QueueManager {
    pub fn new(
        store: Arc<JobStore>,
        router: Arc<ExecutorRouter>,
        config: QueueConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            router,
            config,
            worker_id: worker_id.into(),
            breaker: None,
        }
    }

    /// Route backend launch calls through a circuit breaker. While a
    /// backend's circuit is open its launches fail fast and go through the
    /// normal retry policy without touching the backend.
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<ExecutorRouter> {
        &self.router
    }

    /// Register a freshly created job with the store.
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        self.store.insert(job)
    }

    /// Put a job on the queue, optionally scheduled for a future time.
    pub fn enqueue(
        &self,
        job_id: Uuid,
        schedule_for: Option<chrono::DateTime<Utc>>,
        priority: Option<i32>,
    ) -> Result<Job> {
        let mut job = self.store.get(job_id)?;
        if job.status == JobStatus::Queued {
            return Err(Error::JobAlreadyQueued(job_id.to_string()));
        }
        if job.status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: job.status,
                to: JobStatus::Queued,
                legal: job.status.legal_transitions().to_vec(),
            });
        }
        let queued = self.store.queued_count()?;
        if queued >= self.config.max_queued_jobs {
            return Err(Error::QueueAtCapacity(self.config.max_queued_jobs));
        }

        if let Some(priority) = priority {
            job.priority = priority;
        }
        job.scheduled_for = schedule_for;
        job.mark_queued(Utc::now())?;
        self.store.update(&job)?;
        tracing::info!(job_id = %job.id, priority = job.priority, "Job enqueued");
        Ok(job)
    }

    /// Take a job off the queue, reverting it to pending.
    pub fn dequeue(&self, job_id: Uuid) -> Result<Job> {
        let mut job = self.store.get(job_id)?;
        if job.status != JobStatus::Queued || job.queued_at.is_none() {
            return Err(Error::JobNotQueued(job_id.to_string()));
        }
        job.transition(JobStatus::Pending)?;
        job.queued_at = None;
        job.scheduled_for = None;
        job.retry_count = 0;
        job.claimed_by = None;
        job.claimed_at = None;
        self.store.update(&job)?;
        tracing::info!(job_id = %job.id, "Job dequeued");
        Ok(job)
    }

    /// Ordered view of claimable jobs (priority descending, FIFO tie-break).
    pub fn ready_jobs(&self, limit: Option<usize>, exclude: &[Uuid]) -> Result<Vec<Job>> {
        self.store.ready_jobs(Utc::now(), limit, exclude)
    }

    /// Claim the single best ready job, or `None` when nothing is claimable.
    ///
    /// Store contention is retried with exponential backoff capped at the
    /// configured ceiling plus jitter, a bounded number of times; exhausting
    /// the attempts surfaces the underlying error.
    pub async fn acquire_next(&self) -> Result<Option<Job>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.claim_next(Utc::now(), &self.worker_id) {
                Ok(claimed) => return Ok(claimed),
                Err(e) if e.is_contention() && attempt < self.config.claim_attempts => {
                    let delay = self.claim_backoff(attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Claim contention, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn claim_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        let exp = self
            .config
            .claim_backoff_base_ms
            .saturating_mul(1 << shift)
            .min(self.config.claim_backoff_max_ms);
        let jitter = rand::thread_rng().gen_range(0..=exp / 4 + 1);
        Duration::from_millis(exp + jitter)
    }

    /// Launch a claimed job. On success the job is `running` with its
    /// backend execution id recorded. On backend failure the retry counter
    /// is bumped and the claim released, but no status decision is made;
    /// that is the caller's policy (see [`QueueManager::launch_with_retry`]).
    pub async fn launch(&self, job: &Job) -> Result<Job> {
        match self.try_launch(job.id).await {
            Ok(job) => Ok(job),
            Err(LaunchFailure::Systemic(e)) | Err(LaunchFailure::Backend(e)) => Err(e),
        }
    }

    /// Launch a claimed job, applying retry policy to backend failures:
    /// transient/unknown errors with budget remaining get a scheduled retry,
    /// anything else parks the job as failed. Routing/store problems are
    /// systemic and propagate as errors instead.
    pub async fn launch_with_retry(&self, job: &Job) -> Result<LaunchOutcome> {
        let backend_error = match self.try_launch(job.id).await {
            Ok(job) => return Ok(LaunchOutcome::Launched(job)),
            Err(LaunchFailure::Systemic(e)) => return Err(e),
            Err(LaunchFailure::Backend(e)) => e,
        };

        // try_launch already bumped retry_count and released the claim.
        let mut job = self.store.get(job.id)?;
        let now = Utc::now();
        let message = backend_error.to_string();
        let kind = classify(&message);
        let strategy = RetryStrategy::for_priority(job.priority);

        job.last_error = Some(message.clone());
        job.last_error_at = Some(now);

        if kind == ErrorKind::Unknown {
            tracing::warn!(job_id = %job.id, error = %message, "Unclassified launch error, treating as retryable");
        }

        if strategy.should_retry(job.retry_count, kind) && job.retry_count < job.max_retries {
            let delay = strategy.delay(job.retry_count);
            job.scheduled_for = Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64));
            job.transition(JobStatus::Failed)?;
            job.transition(JobStatus::Retrying)?;
            self.store.update(&job)?;
            tracing::warn!(
                job_id = %job.id,
                retry_count = job.retry_count,
                delay_ms = delay.as_millis() as u64,
                strategy = strategy.name,
                error = %message,
                "Launch failed, retry scheduled"
            );
            Ok(LaunchOutcome::Rescheduled(job))
        } else {
            job.transition(JobStatus::Failed)?;
            job.queued_at = None;
            self.store.update(&job)?;
            tracing::error!(
                job_id = %job.id,
                retry_count = job.retry_count,
                error = %message,
                "Launch failed permanently, manual intervention required"
            );
            Ok(LaunchOutcome::Failed(job))
        }
    }

    async fn try_launch(&self, job_id: Uuid) -> std::result::Result<Job, LaunchFailure> {
        // Systemic failures must not leave the claim stamped: the job would
        // be invisible to every worker from then on.
        let systemic = |store: &JobStore, e: Error| {
            let _ = store.release_claim(job_id);
            LaunchFailure::Systemic(e)
        };

        // Re-read and re-verify: the claim may be stale.
        let mut job = self
            .store
            .get(job_id)
            .map_err(|e| LaunchFailure::Systemic(e))?;
        self.verify_launchable(&job)
            .map_err(|e| systemic(&self.store, e))?;

        let decision = self.router.route(&job);
        job.metadata
            .insert("routing_reason".to_string(), decision.reason.clone());

        let target = self
            .router
            .select_target(decision.backend)
            .map_err(|e| systemic(&self.store, e))?;
        let executor = self
            .router
            .executor_for(&target)
            .map_err(|e| systemic(&self.store, e))?;
        self.router
            .reserve_slot(target.id)
            .map_err(|e| systemic(&self.store, e))?;

        // A retried job re-enters the queue for this attempt.
        if job.status == JobStatus::Retrying {
            if let Err(e) = job.transition(JobStatus::Queued) {
                self.router.release_slot(target.id);
                return Err(systemic(&self.store, e));
            }
        }

        let launch_result = match executor.validate(&job) {
            Ok(()) => match &self.breaker {
                Some(breaker) => {
                    breaker
                        .call(decision.backend.as_str(), || executor.launch(&job))
                        .await
                }
                None => executor.launch(&job).await,
            },
            Err(e) => Err(e),
        };

        match launch_result {
            Ok(execution_id) => {
                job.execution_id = Some(execution_id);
                job.target_id = Some(target.id);
                job.backend = decision.backend;
                job.claimed_by = None;
                job.claimed_at = None;
                if let Err(e) = job.mark_running(Utc::now()) {
                    self.router.release_slot(target.id);
                    return Err(systemic(&self.store, e));
                }
                self.store.update(&job).map_err(LaunchFailure::Systemic)?;
                tracing::info!(
                    job_id = %job.id,
                    backend = %decision.backend,
                    target = %target.endpoint,
                    execution_id = job.execution_id.as_deref().unwrap_or(""),
                    "Job launched"
                );
                Ok(job)
            }
            Err(e) => {
                self.router.release_slot(target.id);
                job.retry_count += 1;
                job.claimed_by = None;
                job.claimed_at = None;
                self.store.update(&job).map_err(LaunchFailure::Systemic)?;
                Err(LaunchFailure::Backend(e))
            }
        }
    }

    fn verify_launchable(&self, job: &Job) -> Result<()> {
        let ok = matches!(job.status, JobStatus::Queued | JobStatus::Retrying)
            && job.queued_at.is_some()
            && job.launched_at.is_none()
            && job.retry_budget_remains()
            && job.scheduled_for.map_or(true, |t| t <= Utc::now())
            && job
                .claimed_by
                .as_deref()
                .map_or(true, |w| w == self.worker_id);
        if ok {
            Ok(())
        } else {
            Err(Error::JobNotQueued(job.id.to_string()))
        }
    }

    /// Fill available launch slots from the ready queue.
    ///
    /// Claims and launches until `max_concurrent` running jobs is reached,
    /// the queue is drained, the deadline passes, or cancellation is
    /// requested. Individual job failures are reported, never raised.
    pub async fn launch_next_batch(
        &self,
        max_concurrent: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        let deadline = Instant::now() + timeout;
        let mut outcome = BatchOutcome::default();

        let running = self.store.running_count()?;
        let mut slots = max_concurrent.saturating_sub(running);

        while slots > 0 && Instant::now() < deadline && !cancel.is_cancelled() {
            let claimed = match self.acquire_next().await? {
                Some(job) => job,
                None => break,
            };

            match self.launch_with_retry(&claimed).await? {
                LaunchOutcome::Launched(job) => {
                    outcome.launched.push(job.id);
                    slots -= 1;
                }
                LaunchOutcome::Rescheduled(job) | LaunchOutcome::Failed(job) => {
                    let message = job
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "launch failed".to_string());
                    outcome.errors.push((job.id, message));
                }
            }
        }

        tracing::debug!(
            launched = outcome.launched.len(),
            errors = outcome.errors.len(),
            "Batch complete"
        );
        Ok(outcome)
    }

    /// Manual override for a permanently failed job: put it back on the
    /// queue for an immediate attempt, optionally zeroing the retry counter.
    pub fn retry_failed_job(&self, job_id: Uuid, reset_count: bool) -> Result<Job> {
        let mut job = self.store.get(job_id)?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Retrying) {
            return Err(Error::InvalidStateTransition {
                from: job.status,
                to: JobStatus::Retrying,
                legal: job.status.legal_transitions().to_vec(),
            });
        }

        if job.status == JobStatus::Failed {
            job.transition(JobStatus::Retrying)?;
        }
        job.transition(JobStatus::Queued)?;
        if reset_count {
            job.retry_count = 0;
        }
        job.queued_at = Some(Utc::now());
        job.scheduled_for = None;
        job.last_error = None;
        job.last_error_at = None;
        job.launched_at = None;
        job.execution_id = None;
        job.claimed_by = None;
        job.claimed_at = None;
        self.store.update(&job)?;
        tracing::info!(job_id = %job.id, reset_count, "Failed job requeued manually");
        Ok(job)
    }

    /// Cancel a job. Running executions are cleaned up on their backend.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job> {
        let mut job = self.store.get(job_id)?;

        if job.status == JobStatus::Running {
            if let (Some(execution_id), Some(target)) = (
                job.execution_id.clone(),
                job.target_id.and_then(|id| self.router.get_target(id)),
            ) {
                let executor = self.router.executor_for(&target)?;
                if let Err(e) = executor.cleanup(&execution_id).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Cleanup failed during cancel");
                }
                self.router.release_slot(target.id);
            }
        }

        job.mark_cancelled(Utc::now())?;
        job.claimed_by = None;
        job.claimed_at = None;
        self.store.update(&job)?;
        tracing::info!(job_id = %job.id, "Job cancelled");
        Ok(job)
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.store.stats(Utc::now())
    }

    pub fn worker_metrics(&self, max_concurrent: usize) -> Result<WorkerMetrics> {
        let queue = self.queue_stats()?;
        Ok(WorkerMetrics {
            available_slots: max_concurrent.saturating_sub(queue.running),
            queue,
            max_concurrent,
        })
    }

    /// One pass over running jobs: poll backend status, harvest finished
    /// executions, apply retry policy to execution failures.
    pub async fn monitor_running(&self) -> Result<MonitorReport> {
        let mut report = MonitorReport::default();

        for job in self.store.running_jobs()? {
            let execution_id = match &job.execution_id {
                Some(id) => id.clone(),
                None => continue,
            };
            let target = match job.target_id.and_then(|id| self.router.get_target(id)) {
                Some(target) => target,
                None => {
                    report
                        .errors
                        .push((job.id, "running job has no known target".to_string()));
                    continue;
                }
            };
            let executor = match self.router.executor_for(&target) {
                Ok(executor) => executor,
                Err(e) => {
                    report.errors.push((job.id, e.to_string()));
                    continue;
                }
            };

            match executor.status(&execution_id).await {
                Ok(crate::executor::ExecStatus::Running) => {}
                Ok(crate::executor::ExecStatus::Exited) => {
                    self.harvest_completed(job, &target, executor.as_ref(), &mut report)
                        .await;
                }
                Ok(crate::executor::ExecStatus::Failed) => {
                    self.harvest_failed(job, &target, executor.as_ref(), &mut report)
                        .await;
                }
                Ok(crate::executor::ExecStatus::NotFound) => {
                    let mut job = job;
                    job.last_error = Some("execution no longer known to backend".to_string());
                    if let Err(e) = job.mark_failed(true, Utc::now()) {
                        report.errors.push((job.id, e.to_string()));
                        continue;
                    }
                    self.router.release_slot(target.id);
                    if let Err(e) = self.store.update(&job) {
                        report.errors.push((job.id, e.to_string()));
                        continue;
                    }
                    tracing::warn!(job_id = %job.id, "Execution disappeared backend-side");
                    report.missing.push(job.id);
                }
                Err(e) => report.errors.push((job.id, e.to_string())),
            }
        }

        Ok(report)
    }

    async fn harvest_completed(
        &self,
        mut job: Job,
        target: &BackendTarget,
        executor: &dyn Executor,
        report: &mut MonitorReport,
    ) {
        if let Err(e) = executor.harvest(&mut job).await {
            tracing::warn!(job_id = %job.id, error = %e, "Harvest failed");
        }
        if let Err(e) = job.mark_completed(Utc::now()) {
            report.errors.push((job.id, e.to_string()));
            return;
        }
        self.router.release_slot(target.id);
        match self.store.update(&job) {
            Ok(()) => {
                tracing::info!(job_id = %job.id, exit_code = job.exit_code, "Job completed");
                report.completed.push(job.id);
            }
            Err(e) => report.errors.push((job.id, e.to_string())),
        }
    }

    async fn harvest_failed(
        &self,
        mut job: Job,
        target: &BackendTarget,
        executor: &dyn Executor,
        report: &mut MonitorReport,
    ) {
        if let Err(e) = executor.harvest(&mut job).await {
            tracing::warn!(job_id = %job.id, error = %e, "Harvest failed");
        }
        job.last_error = Some(format!(
            "execution failed with exit code {}",
            job.exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
        ));
        if let Err(e) = job.mark_failed(true, Utc::now()) {
            report.errors.push((job.id, e.to_string()));
            return;
        }
        self.router.release_slot(target.id);
        match self.store.update(&job) {
            Ok(()) => {
                tracing::warn!(job_id = %job.id, exit_code = job.exit_code, status = %job.status, "Job execution failed");
                report.failed.push(job.id);
            }
            Err(e) => report.errors.push((job.id, e.to_string())),
        }
    }
}
