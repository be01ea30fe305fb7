use chrono::Utc;

use crate::config::{DegradationConfig, FallbackConfig};
use crate::executor::BackendKind;
use crate::scheduler::job::Job;

/// A reduced-service action taken when normal execution is not possible.
#[derive(Debug, Clone, PartialEq)]
pub enum DegradationAction {
    /// Resource requests scaled down; recorded as metadata only. Enforced
    /// limits are unchanged until a launch picks the annotations up.
    ReducedResources {
        memory_mb: Option<u64>,
        cpus: Option<f64>,
    },
    /// Execution pushed into the future.
    Delayed { delay_ms: u64 },
    /// Job redirected to a fallback backend kind.
    Redirected { backend: BackendKind },
    /// Last resort: parked on the queue for a later pass.
    QueuedForLater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    ReduceResources,
    DelayExecution,
    RedirectToFallback,
    QueueForLater,
}

/// Applies degradation strategies in priority order when resources are
/// scarce, stopping at the first one that takes effect. Every action leaves
/// an annotation in the job's metadata.
pub struct DegradationManager {
    config: DegradationConfig,
    fallback: FallbackConfig,
}

impl DegradationManager {
    pub fn new(config: DegradationConfig, fallback: FallbackConfig) -> Self {
        Self { config, fallback }
    }

    /// Strategy order for a job, chosen by its shape: high-memory jobs try
    /// resource reduction first, delayable jobs a deferral, then redirect,
    /// then queue-for-later.
    fn strategies_for(&self, job: &Job) -> Vec<Strategy> {
        let mut strategies = Vec::new();
        if job
            .workload
            .memory_mb
            .map_or(false, |mb| mb >= self.config.high_memory_mb)
        {
            strategies.push(Strategy::ReduceResources);
        }
        if job.name.contains(&self.config.delayable_name_pattern) {
            strategies.push(Strategy::DelayExecution);
        }
        strategies.push(Strategy::RedirectToFallback);
        strategies.push(Strategy::QueueForLater);
        strategies
    }

    /// Apply the first strategy that succeeds for this job.
    pub fn apply(&self, job: &mut Job) -> DegradationAction {
        for strategy in self.strategies_for(job) {
            if let Some(action) = self.try_strategy(strategy, job) {
                tracing::info!(job_id = %job.id, action = ?action, "Degradation applied");
                return action;
            }
        }
        // QueueForLater always succeeds; unreachable in practice.
        self.queue_for_later(job)
    }

    fn try_strategy(&self, strategy: Strategy, job: &mut Job) -> Option<DegradationAction> {
        match strategy {
            Strategy::ReduceResources => self.reduce_resources(job),
            Strategy::DelayExecution => self.delay_execution(job),
            Strategy::RedirectToFallback => self.redirect(job),
            Strategy::QueueForLater => Some(self.queue_for_later(job)),
        }
    }

    fn reduce_resources(&self, job: &mut Job) -> Option<DegradationAction> {
        if job.workload.memory_mb.is_none() && job.workload.cpus.is_none() {
            return None;
        }
        let factor = self.config.resource_reduction_factor;
        let memory_mb = job.workload.memory_mb.map(|mb| (mb as f64 * factor) as u64);
        let cpus = job.workload.cpus.map(|c| c * factor);

        if let Some(mb) = memory_mb {
            job.metadata
                .insert("degraded_memory_mb".to_string(), mb.to_string());
        }
        if let Some(c) = cpus {
            job.metadata.insert("degraded_cpus".to_string(), c.to_string());
        }
        job.metadata
            .insert("degradation".to_string(), "reduced_resources".to_string());
        Some(DegradationAction::ReducedResources { memory_mb, cpus })
    }

    fn delay_execution(&self, job: &mut Job) -> Option<DegradationAction> {
        let delay = chrono::Duration::milliseconds(self.config.delay_ms as i64);
        job.scheduled_for = Some(Utc::now() + delay);
        job.metadata
            .insert("degradation".to_string(), "delayed".to_string());
        Some(DegradationAction::Delayed {
            delay_ms: self.config.delay_ms,
        })
    }

    fn redirect(&self, job: &mut Job) -> Option<DegradationAction> {
        let fallback = self
            .fallback
            .chains
            .get(&job.backend)
            .and_then(|chain| chain.first())
            .copied()?;
        job.backend = fallback;
        job.metadata.insert(
            "degradation".to_string(),
            format!("redirected to {fallback}"),
        );
        Some(DegradationAction::Redirected { backend: fallback })
    }

    fn queue_for_later(&self, job: &mut Job) -> DegradationAction {
        let delay = chrono::Duration::milliseconds(self.config.delay_ms as i64);
        job.scheduled_for = Some(Utc::now() + delay);
        job.metadata
            .insert("degradation".to_string(), "queued_for_later".to_string());
        DegradationAction::QueuedForLater
    }
}
