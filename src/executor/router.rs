use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use rand::Rng;
use uuid::Uuid;

use crate::config::{CloudConfig, DockerConfig};
use crate::error::{Error, Result};
use crate::executor::{BackendKind, BackendTarget, CloudExecutor, DockerExecutor, Executor, StubExecutor};
use crate::scheduler::job::Job;

/// Closed predicate set for routing rules.
///
/// Rules are data, not code: no expression evaluation happens anywhere in
/// the routing path.
#[derive(Debug, Clone)]
pub enum RulePredicate {
    MemoryAtLeastMb(u64),
    CpuAtLeast(f64),
    RequiresGpu,
    NameContains(String),
    PriorityAtLeast(i32),
    RequesterIs(String),
    Always,
}

impl RulePredicate {
    pub fn matches(&self, job: &Job) -> bool {
        match self {
            RulePredicate::MemoryAtLeastMb(mb) => {
                job.workload.memory_mb.map_or(false, |m| m >= *mb)
            }
            RulePredicate::CpuAtLeast(cpus) => job.workload.cpus.map_or(false, |c| c >= *cpus),
            RulePredicate::RequiresGpu => job.workload.gpu,
            RulePredicate::NameContains(pattern) => job.name.contains(pattern.as_str()),
            RulePredicate::PriorityAtLeast(p) => job.priority >= *p,
            RulePredicate::RequesterIs(who) => job.requester.as_deref() == Some(who.as_str()),
            RulePredicate::Always => true,
        }
    }
}

/// One routing rule: predicate over job attributes, evaluated in priority
/// order (highest first).
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub name: String,
    pub predicate: RulePredicate,
    pub backend: BackendKind,
    pub priority: i32,
}

impl RoutingRule {
    pub fn new(
        name: impl Into<String>,
        predicate: RulePredicate,
        backend: BackendKind,
        priority: i32,
    ) -> Self {
        Self {
            name: name.into(),
            predicate,
            backend,
            priority,
        }
    }
}

/// The outcome of routing a job: which backend and why. Computing a
/// decision changes nothing, so it doubles as the dry-run preview.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub backend: BackendKind,
    pub rule: Option<String>,
    pub reason: String,
}

/// Constructs an executor instance for a target; injected so tests can
/// substitute scripted backends.
pub type ExecutorFactory =
    Box<dyn Fn(&BackendTarget) -> Result<Arc<dyn Executor>> + Send + Sync>;

/// Builds concrete backends from the closed set, using per-target endpoints.
pub fn default_executor_factory(docker: DockerConfig, cloud: CloudConfig) -> ExecutorFactory {
    Box::new(move |target| {
        Ok(match target.kind {
            BackendKind::Docker => Arc::new(DockerExecutor::new(docker.clone())),
            BackendKind::Cloud => Arc::new(CloudExecutor::new(CloudConfig {
                base_url: target.endpoint.clone(),
                ..cloud.clone()
            })?),
            BackendKind::Stub => Arc::new(StubExecutor::new()),
        })
    })
}

/// Selects a backend kind per job, a target per backend kind, and caches one
/// executor instance per `(kind, target)`.
pub struct ExecutorRouter {
    rules: Vec<RoutingRule>,
    default_backend: BackendKind,
    targets: RwLock<Vec<BackendTarget>>,
    cache: Mutex<HashMap<(BackendKind, Uuid), Arc<dyn Executor>>>,
    factory: ExecutorFactory,
}

impl ExecutorRouter {
    pub fn new(
        mut rules: Vec<RoutingRule>,
        default_backend: BackendKind,
        targets: Vec<BackendTarget>,
        factory: ExecutorFactory,
    ) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            rules,
            default_backend,
            targets: RwLock::new(targets),
            cache: Mutex::new(HashMap::new()),
            factory,
        }
    }

    /// A backend kind is usable when at least one of its targets is active
    /// with free capacity.
    pub fn backend_available(&self, kind: BackendKind) -> bool {
        self.targets
            .read()
            .expect("targets lock poisoned")
            .iter()
            .any(|t| t.kind == kind && t.is_active && t.has_capacity())
    }

    /// Pick a backend kind for the job: first matching rule whose backend is
    /// currently available, else the configured default.
    pub fn route(&self, job: &Job) -> RouteDecision {
        let mut skipped: Option<&RoutingRule> = None;
        for rule in &self.rules {
            if !rule.predicate.matches(job) {
                continue;
            }
            if self.backend_available(rule.backend) {
                return RouteDecision {
                    backend: rule.backend,
                    rule: Some(rule.name.clone()),
                    reason: format!("rule '{}' matched", rule.name),
                };
            }
            skipped.get_or_insert(rule);
        }

        let reason = match skipped {
            Some(rule) => format!(
                "rule '{}' matched but backend {} is unavailable; using default {}",
                rule.name, rule.backend, self.default_backend
            ),
            None => format!("no rule matched; using default {}", self.default_backend),
        };
        RouteDecision {
            backend: self.default_backend,
            rule: None,
            reason,
        }
    }

    /// Weighted random pick among active, capacity-available targets of the
    /// kind. Draws `r` uniformly in `[1, sum(weights)]` and walks targets
    /// accumulating weight; all-zero weights degrade to uniform selection.
    pub fn select_target(&self, kind: BackendKind) -> Result<BackendTarget> {
        let targets = self.targets.read().expect("targets lock poisoned");
        let candidates: Vec<&BackendTarget> = targets
            .iter()
            .filter(|t| t.kind == kind && t.is_active)
            .collect();
        if candidates.is_empty() {
            return Err(Error::InsufficientResources(format!(
                "no active target for backend {kind}"
            )));
        }

        let available: Vec<&BackendTarget> = candidates
            .iter()
            .copied()
            .filter(|t| t.has_capacity())
            .collect();
        if available.is_empty() {
            return Err(Error::InsufficientResources(format!(
                "all targets for backend {kind} are at capacity"
            )));
        }

        let total: u64 = available.iter().map(|t| u64::from(t.weight)).sum();
        let mut rng = rand::thread_rng();
        if total == 0 {
            let idx = rng.gen_range(0..available.len());
            return Ok(available[idx].clone());
        }

        let r = rng.gen_range(1..=total);
        let mut acc = 0u64;
        for target in &available {
            acc += u64::from(target.weight);
            if acc >= r {
                return Ok((*target).clone());
            }
        }
        // Unreachable with a correct sum; keep the walk total-safe.
        Ok(available[available.len() - 1].clone())
    }

    /// Cached executor for a target, constructing on first use.
    pub fn executor_for(&self, target: &BackendTarget) -> Result<Arc<dyn Executor>> {
        let key = (target.kind, target.id);
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        if let Some(executor) = cache.get(&key) {
            return Ok(executor.clone());
        }
        let executor = (self.factory)(target)?;
        cache.insert(key, executor.clone());
        Ok(executor)
    }

    /// Evict all cached executor instances (configuration reload).
    pub fn clear_cache(&self) {
        self.cache.lock().expect("cache lock poisoned").clear();
    }

    pub fn cached_executor_count(&self) -> usize {
        self.cache.lock().expect("cache lock poisoned").len()
    }

    /// Account one running job against the target's capacity.
    pub fn reserve_slot(&self, target_id: Uuid) -> Result<()> {
        let mut targets = self.targets.write().expect("targets lock poisoned");
        let target = targets
            .iter_mut()
            .find(|t| t.id == target_id)
            .ok_or_else(|| Error::InvalidConfiguration(format!("unknown target {target_id}")))?;
        if !target.has_capacity() {
            return Err(Error::InsufficientResources(format!(
                "target {} is at capacity ({})",
                target_id, target.max_concurrent_jobs
            )));
        }
        target.current_job_count += 1;
        Ok(())
    }

    pub fn release_slot(&self, target_id: Uuid) {
        let mut targets = self.targets.write().expect("targets lock poisoned");
        if let Some(target) = targets.iter_mut().find(|t| t.id == target_id) {
            target.current_job_count = target.current_job_count.saturating_sub(1);
        }
    }

    pub fn all_targets(&self) -> Vec<BackendTarget> {
        self.targets.read().expect("targets lock poisoned").clone()
    }

    pub fn get_target(&self, target_id: Uuid) -> Option<BackendTarget> {
        self.targets
            .read()
            .expect("targets lock poisoned")
            .iter()
            .find(|t| t.id == target_id)
            .cloned()
    }

    /// Mutate a target in place (health bookkeeping, activation flips).
    pub fn update_target(&self, target_id: Uuid, apply: impl FnOnce(&mut BackendTarget)) {
        let mut targets = self.targets.write().expect("targets lock poisoned");
        if let Some(target) = targets.iter_mut().find(|t| t.id == target_id) {
            apply(target);
        }
    }
}
