//! Execution backend contract.
//!
//! Every backend normalizes its lifecycle operations behind [`Executor`];
//! no wire format leaks past this module. Backends form a closed set
//! ([`BackendKind`]) dispatched through the router's cache.

pub mod cloud;
pub mod docker;
pub mod router;
pub mod stub;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::scheduler::job::Job;

pub use cloud::CloudExecutor;
pub use docker::DockerExecutor;
pub use router::{
    default_executor_factory, ExecutorFactory, ExecutorRouter, RouteDecision, RoutingRule,
    RulePredicate,
};
pub use stub::StubExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local container runtime driven through the docker CLI.
    Docker,
    /// Serverless container platform behind a JSON job API.
    Cloud,
    /// Scripted test double.
    Stub,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Docker => "docker",
            BackendKind::Cloud => "cloud",
            BackendKind::Stub => "stub",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(BackendKind::Docker),
            "cloud" => Ok(BackendKind::Cloud),
            "stub" => Ok(BackendKind::Stub),
            other => Err(Error::InvalidConfiguration(format!(
                "unknown backend kind: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized execution status across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Running,
    Exited,
    Failed,
    NotFound,
}

/// Captured output of an execution.
#[derive(Debug, Clone, Default)]
pub struct LogOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Feature flags a backend advertises.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub resource_limits: bool,
    pub networking: bool,
    pub secrets: bool,
    pub gpu: bool,
    pub auto_scaling: bool,
}

/// Result of a backend health probe.
#[derive(Debug, Clone)]
pub struct ExecutorHealth {
    pub healthy: bool,
    pub error: Option<String>,
    pub last_check: DateTime<Utc>,
    pub latency: Duration,
}

impl ExecutorHealth {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            error: None,
            last_check: Utc::now(),
            latency,
        }
    }

    pub fn unhealthy(error: impl Into<String>, latency: Duration) -> Self {
        Self {
            healthy: false,
            error: Some(error.into()),
            last_check: Utc::now(),
            latency,
        }
    }
}

/// A host/endpoint a backend kind can run jobs on.
///
/// Owned by configuration; the router reads it for selection, health checks
/// and capacity accounting mutate it behind the router's locks.
#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub id: Uuid,
    pub kind: BackendKind,
    pub endpoint: String,
    pub is_active: bool,
    /// Routing preference, 1-1000. Zero-weight targets fall back to
    /// uniform selection when every weight is zero.
    pub weight: u32,
    pub max_concurrent_jobs: usize,
    pub current_job_count: usize,
    pub health_check_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl BackendTarget {
    pub fn new(kind: BackendKind, endpoint: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            endpoint: endpoint.into(),
            is_active: true,
            weight: 100,
            max_concurrent_jobs: 32,
            current_job_count: 0,
            health_check_failures: 0,
            last_health_check: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.min(1000);
        self
    }

    pub fn with_capacity(mut self, max_concurrent_jobs: usize) -> Self {
        self.max_concurrent_jobs = max_concurrent_jobs;
        self
    }

    pub fn has_capacity(&self) -> bool {
        self.current_job_count < self.max_concurrent_jobs
    }
}

/// The contract every execution backend implements.
///
/// Implementations must be safe for concurrent use: the router caches one
/// instance per `(kind, target)` and hands it to every worker thread.
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start the job's workload; returns the backend-assigned execution id.
    async fn launch(&self, job: &Job) -> Result<String>;

    /// Normalized status of a previously launched execution.
    async fn status(&self, execution_id: &str) -> Result<ExecStatus>;

    /// Captured stdout/stderr of an execution.
    async fn logs(&self, execution_id: &str) -> Result<LogOutput>;

    /// Fetch exit code and output onto the job and release backend-side
    /// resources for a finished execution.
    async fn harvest(&self, job: &mut Job) -> Result<()>;

    /// Force-release backend resources for an execution.
    async fn cleanup(&self, execution_id: &str) -> Result<()>;

    fn capabilities(&self) -> Capabilities;

    /// Reject jobs this backend cannot run before launch is attempted.
    fn validate(&self, job: &Job) -> Result<()>;

    fn estimate_cost(&self, _job: &Job) -> Option<f64> {
        None
    }

    /// Probe the backend and report liveness plus observed latency.
    async fn health(&self) -> ExecutorHealth;
}
