use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::executor::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Retrying,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    /// Terminal statuses never mutate again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// Legal outgoing transitions for this status.
    ///
    /// `queued -> pending` is the dequeue path and `queued -> failed` the
    /// launch-failure path; both leave through the queue manager only.
    pub fn legal_transitions(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Pending => &[JobStatus::Queued, JobStatus::Cancelled],
            JobStatus::Queued => &[
                JobStatus::Running,
                JobStatus::Cancelled,
                JobStatus::Pending,
                JobStatus::Failed,
            ],
            JobStatus::Retrying => &[JobStatus::Queued, JobStatus::Cancelled],
            JobStatus::Running => &[
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
                JobStatus::Timeout,
            ],
            JobStatus::Failed => &[JobStatus::Retrying],
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Timeout => &[],
        }
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        self.legal_transitions().contains(&to)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Retrying => "retrying",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "retrying" => Ok(JobStatus::Retrying),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "timeout" => Ok(JobStatus::Timeout),
            other => Err(Error::Store(format!("unknown job status: {other}"))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the job actually runs: image, command and resource requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub image: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub memory_mb: Option<u64>,
    pub cpus: Option<f64>,
    #[serde(default)]
    pub gpu: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub backend: BackendKind,
    pub workload: WorkloadSpec,
    pub requester: Option<String>,
    pub execution_id: Option<String>,
    pub target_id: Option<Uuid>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub launched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Job {
    pub fn new(name: impl Into<String>, backend: BackendKind, workload: WorkloadSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: JobStatus::Pending,
            priority: 50,
            retry_count: 0,
            max_retries: 3,
            backend,
            workload,
            requester: None,
            execution_id: None,
            target_id: None,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            last_error_at: None,
            created_at: Utc::now(),
            queued_at: None,
            scheduled_for: None,
            launched_at: None,
            completed_at: None,
            exit_code: None,
            output: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The single gate for all status changes.
    pub fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: self.status,
                to,
                legal: self.status.legal_transitions().to_vec(),
            });
        }
        tracing::debug!(job_id = %self.id, from = %self.status, to = %to, "Job transition");
        self.status = to;
        Ok(())
    }

    pub fn mark_queued(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Queued)?;
        self.queued_at = Some(now);
        Ok(())
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.launched_at = Some(now);
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Cancelled)?;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Record a failed attempt. Advances to `retrying` when `should_retry`
    /// and budget remains after counting this attempt, otherwise parks the
    /// job as `failed`.
    pub fn mark_failed(&mut self, should_retry: bool, now: DateTime<Utc>) -> Result<()> {
        self.retry_count += 1;
        self.last_error_at = Some(now);
        self.transition(JobStatus::Failed)?;
        if should_retry && self.retry_count < self.max_retries {
            self.transition(JobStatus::Retrying)?;
            // The next attempt launches fresh.
            self.launched_at = None;
            self.execution_id = None;
        }
        Ok(())
    }

    /// True while the job may still be retried. A never-attempted job always
    /// has budget, so `max_retries = 0` jobs launch exactly once.
    pub fn retry_budget_remains(&self) -> bool {
        self.retry_count == 0 || self.retry_count < self.max_retries
    }

    /// Eligible for claiming: queued (or awaiting retry), due, unclaimed,
    /// never launched this attempt, with retry budget.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Queued | JobStatus::Retrying)
            && self.queued_at.is_some()
            && self.launched_at.is_none()
            && self.claimed_by.is_none()
            && self.retry_budget_remains()
            && self.scheduled_for.map_or(true, |t| t <= now)
    }
}
