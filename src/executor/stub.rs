use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::executor::{BackendKind, Capabilities, ExecStatus, Executor, ExecutorHealth, LogOutput};
use crate::scheduler::job::Job;

/// Scripted test double.
///
/// Launches succeed by default; failures are scripted per call with
/// [`StubExecutor::script_launch_failure`]. Execution statuses can be pinned
/// per execution id, and every call is recorded for assertions.
#[derive(Default)]
pub struct StubExecutor {
    scripted: Mutex<VecDeque<std::result::Result<(), String>>>,
    statuses: Mutex<HashMap<String, ExecStatus>>,
    launched: Mutex<Vec<Uuid>>,
    cleaned: Mutex<Vec<String>>,
    healthy: AtomicBool,
    counter: AtomicU64,
}

impl StubExecutor {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            ..Default::default()
        }
    }

    /// The next launch fails with `message`.
    pub fn script_launch_failure(&self, message: impl Into<String>) {
        self.scripted
            .lock()
            .unwrap()
            .push_back(Err(message.into()));
    }

    /// The next launch succeeds (only needed to interleave with failures).
    pub fn script_launch_success(&self) {
        self.scripted.lock().unwrap().push_back(Ok(()));
    }

    /// Pin the reported status for an execution id.
    pub fn set_status(&self, execution_id: impl Into<String>, status: ExecStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(execution_id.into(), status);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn launched_jobs(&self) -> Vec<Uuid> {
        self.launched.lock().unwrap().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }

    pub fn cleaned_executions(&self) -> Vec<String> {
        self.cleaned.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for StubExecutor {
    fn kind(&self) -> BackendKind {
        BackendKind::Stub
    }

    async fn launch(&self, job: &Job) -> Result<String> {
        let outcome = self
            .scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        match outcome {
            Ok(()) => {
                self.launched.lock().unwrap().push(job.id);
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("stub-{n}"))
            }
            Err(message) => Err(Error::Internal(message)),
        }
    }

    async fn status(&self, execution_id: &str) -> Result<ExecStatus> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(execution_id)
            .copied()
            .unwrap_or(ExecStatus::Exited))
    }

    async fn logs(&self, _execution_id: &str) -> Result<LogOutput> {
        Ok(LogOutput {
            stdout: "stub output\n".to_string(),
            stderr: String::new(),
        })
    }

    async fn harvest(&self, job: &mut Job) -> Result<()> {
        let execution_id = job
            .execution_id
            .clone()
            .ok_or_else(|| Error::Internal("job has no execution id".to_string()))?;
        let status = self.status(&execution_id).await?;
        job.exit_code = Some(match status {
            ExecStatus::Failed => 1,
            _ => 0,
        });
        job.output = Some("stub output\n".to_string());
        self.cleanup(&execution_id).await
    }

    async fn cleanup(&self, execution_id: &str) -> Result<()> {
        self.cleaned
            .lock()
            .unwrap()
            .push(execution_id.to_string());
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            resource_limits: true,
            networking: true,
            secrets: true,
            gpu: true,
            auto_scaling: true,
        }
    }

    fn validate(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> ExecutorHealth {
        if self.healthy.load(Ordering::SeqCst) {
            ExecutorHealth::healthy(Duration::from_millis(1))
        } else {
            ExecutorHealth::unhealthy("stub marked unhealthy", Duration::from_millis(1))
        }
    }
}
