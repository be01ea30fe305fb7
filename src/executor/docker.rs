use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::DockerConfig;
use crate::error::{Error, Result};
use crate::executor::{BackendKind, Capabilities, ExecStatus, Executor, ExecutorHealth, LogOutput};
use crate::scheduler::job::Job;

/// Runs jobs as detached containers through the local docker CLI.
///
/// Containers are sandboxed: network isolation, dropped capabilities,
/// read-only root filesystem, memory and CPU limits from the workload spec.
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    config: DockerConfig,
}

impl DockerExecutor {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    fn run_args(&self, job: &Job) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            format!("stevedore-{}", job.id),
        ];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if self.config.hardened {
            args.push("--cap-drop=ALL".to_string());
            args.push("--security-opt=no-new-privileges".to_string());
            args.push("--read-only".to_string());
        }
        if let Some(mb) = job.workload.memory_mb {
            args.push(format!("--memory={mb}m"));
        }
        if let Some(cpus) = job.workload.cpus {
            args.push(format!("--cpus={cpus}"));
        }
        for (key, value) in &job.workload.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        let image = if job.workload.image.is_empty() {
            self.config.default_image.clone()
        } else {
            job.workload.image.clone()
        };
        args.push(image);
        args.extend(job.workload.command.iter().cloned());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<std::process::Output> {
        Command::new("docker")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Connection(format!("docker CLI: {e}")))
    }

    fn launch_error(stderr: &str) -> Error {
        let msg = stderr.trim().to_string();
        let lower = msg.to_lowercase();
        if lower.contains("cannot connect") || lower.contains("connection refused") {
            Error::Connection(msg)
        } else if lower.contains("no such image") || lower.contains("not found") {
            Error::InvalidConfiguration(msg)
        } else {
            Error::Internal(msg)
        }
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn launch(&self, job: &Job) -> Result<String> {
        let args = self.run_args(job);
        tracing::info!(job_id = %job.id, image = %job.workload.image, "Launching container");

        let output = self.docker(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Self::launch_error(&stderr));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(Error::Internal("docker run returned no container id".to_string()));
        }
        Ok(container_id)
    }

    async fn status(&self, execution_id: &str) -> Result<ExecStatus> {
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Status}} {{.State.ExitCode}}".to_string(),
            execution_id.to_string(),
        ];
        let output = self.docker(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            if stderr.contains("no such object") || stderr.contains("no such container") {
                return Ok(ExecStatus::NotFound);
            }
            return Err(Error::Connection(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut parts = stdout.split_whitespace();
        let state = parts.next().unwrap_or("");
        let exit_code: i32 = parts.next().and_then(|c| c.parse().ok()).unwrap_or(0);
        Ok(match state {
            "exited" | "dead" => {
                if exit_code == 0 {
                    ExecStatus::Exited
                } else {
                    ExecStatus::Failed
                }
            }
            _ => ExecStatus::Running,
        })
    }

    async fn logs(&self, execution_id: &str) -> Result<LogOutput> {
        let args = vec!["logs".to_string(), execution_id.to_string()];
        let output = self.docker(&args).await?;
        Ok(LogOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn harvest(&self, job: &mut Job) -> Result<()> {
        let execution_id = job
            .execution_id
            .clone()
            .ok_or_else(|| Error::Internal("job has no execution id".to_string()))?;

        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.ExitCode}}".to_string(),
            execution_id.clone(),
        ];
        let output = self.docker(&args).await?;
        if output.status.success() {
            job.exit_code = String::from_utf8_lossy(&output.stdout).trim().parse().ok();
        }

        let logs = self.logs(&execution_id).await?;
        job.output = Some(if logs.stderr.is_empty() {
            logs.stdout
        } else {
            format!("{}{}", logs.stdout, logs.stderr)
        });

        self.cleanup(&execution_id).await
    }

    async fn cleanup(&self, execution_id: &str) -> Result<()> {
        let args = vec!["rm".to_string(), "-f".to_string(), execution_id.to_string()];
        let output = self.docker(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            // Already gone is fine.
            if !stderr.contains("no such container") {
                return Err(Error::Internal(stderr.trim().to_string()));
            }
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            resource_limits: true,
            networking: true,
            secrets: false,
            gpu: false,
            auto_scaling: false,
        }
    }

    fn validate(&self, job: &Job) -> Result<()> {
        if job.workload.image.is_empty() && self.config.default_image.is_empty() {
            return Err(Error::InvalidConfiguration(
                "job has no image and no default is configured".to_string(),
            ));
        }
        if job.workload.gpu {
            return Err(Error::InsufficientResources(
                "docker backend has no GPU support".to_string(),
            ));
        }
        Ok(())
    }

    async fn health(&self) -> ExecutorHealth {
        let start = Instant::now();
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ];
        match self.docker(&args).await {
            Ok(output) if output.status.success() => ExecutorHealth::healthy(start.elapsed()),
            Ok(output) => ExecutorHealth::unhealthy(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
                start.elapsed(),
            ),
            Err(e) => ExecutorHealth::unhealthy(e.to_string(), start.elapsed()),
        }
    }
}
