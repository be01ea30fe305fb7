use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::CloudConfig;
use crate::error::{Error, Result};
use crate::executor::{BackendKind, Capabilities, ExecStatus, Executor, ExecutorHealth, LogOutput};
use crate::scheduler::job::Job;

/// Serverless container platform backend.
///
/// Talks to the platform's job API over JSON; the wire shape stays inside
/// this module. One instance per target endpoint, shared across workers.
pub struct CloudExecutor {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct CreateExecutionRequest<'a> {
    name: &'a str,
    image: &'a str,
    command: &'a [String],
    env: &'a std::collections::HashMap<String, String>,
    memory_mb: Option<u64>,
    cpus: Option<f64>,
    gpu: bool,
}

#[derive(Deserialize)]
struct CreateExecutionResponse {
    id: String,
}

#[derive(Deserialize)]
struct ExecutionStateResponse {
    state: String,
    #[serde(default)]
    exit_code: Option<i32>,
}

#[derive(Deserialize)]
struct ExecutionLogsResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

impl CloudExecutor {
    pub fn new(config: CloudConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| Error::InvalidConfiguration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn map_send_error(err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_connect() {
            Error::Connection(err.to_string())
        } else {
            Error::Internal(err.to_string())
        }
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 | 403 => Error::AuthFailed(body),
            429 | 503 => Error::InsufficientResources(format!("{status}: {body}")),
            _ => Error::Internal(format!("{status}: {body}")),
        })
    }
}

#[async_trait]
impl Executor for CloudExecutor {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    async fn launch(&self, job: &Job) -> Result<String> {
        let body = CreateExecutionRequest {
            name: &job.name,
            image: &job.workload.image,
            command: &job.workload.command,
            env: &job.workload.env,
            memory_mb: job.workload.memory_mb,
            cpus: job.workload.cpus,
            gpu: job.workload.gpu,
        };
        tracing::info!(job_id = %job.id, image = %job.workload.image, "Submitting execution");

        let response = self
            .request(reqwest::Method::POST, "/v1/executions")
            .json(&body)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let created: CreateExecutionResponse = Self::check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Internal(format!("malformed create response: {e}")))?;
        Ok(created.id)
    }

    async fn status(&self, execution_id: &str) -> Result<ExecStatus> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/executions/{execution_id}"))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if response.status().as_u16() == 404 {
            return Ok(ExecStatus::NotFound);
        }
        let state: ExecutionStateResponse = Self::check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Internal(format!("malformed state response: {e}")))?;
        Ok(match state.state.as_str() {
            "succeeded" => ExecStatus::Exited,
            "failed" | "cancelled" => ExecStatus::Failed,
            _ => ExecStatus::Running,
        })
    }

    async fn logs(&self, execution_id: &str) -> Result<LogOutput> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/executions/{execution_id}/logs"),
            )
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let logs: ExecutionLogsResponse = Self::check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Internal(format!("malformed logs response: {e}")))?;
        Ok(LogOutput {
            stdout: logs.stdout,
            stderr: logs.stderr,
        })
    }

    async fn harvest(&self, job: &mut Job) -> Result<()> {
        let execution_id = job
            .execution_id
            .clone()
            .ok_or_else(|| Error::Internal("job has no execution id".to_string()))?;

        let response = self
            .request(reqwest::Method::GET, &format!("/v1/executions/{execution_id}"))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if let Ok(ok) = Self::check_response(response).await {
            if let Ok(state) = ok.json::<ExecutionStateResponse>().await {
                job.exit_code = state.exit_code;
            }
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
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/v1/executions/{execution_id}"),
            )
            .send()
            .await
            .map_err(Self::map_send_error)?;
        // Already gone is fine.
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check_response(response).await.map(|_| ())
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

    fn validate(&self, job: &Job) -> Result<()> {
        if job.workload.image.is_empty() {
            return Err(Error::InvalidConfiguration(
                "cloud backend requires an explicit image".to_string(),
            ));
        }
        Ok(())
    }

    fn estimate_cost(&self, job: &Job) -> Option<f64> {
        // Rough per-minute pricing by requested resources.
        let memory_gb = job.workload.memory_mb.unwrap_or(512) as f64 / 1024.0;
        let cpus = job.workload.cpus.unwrap_or(0.5);
        Some(memory_gb * 0.002 + cpus * 0.01)
    }

    async fn health(&self) -> ExecutorHealth {
        let start = Instant::now();
        let result = self
            .request(reqwest::Method::GET, "/healthz")
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                ExecutorHealth::healthy(start.elapsed())
            }
            Ok(response) => ExecutorHealth::unhealthy(
                format!("health endpoint returned {}", response.status()),
                start.elapsed(),
            ),
            Err(e) => ExecutorHealth::unhealthy(e.to_string(), start.elapsed()),
        }
    }
}
