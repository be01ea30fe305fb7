use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stevedore::config::{
    CircuitBreakerConfig, CloudConfig, DockerConfig, HealthCheckConfig, QueueConfig, WorkerConfig,
};
use stevedore::executor::router::default_executor_factory;
use stevedore::executor::{BackendKind, BackendTarget, ExecutorRouter, RoutingRule, RulePredicate};
use stevedore::reliability::{CircuitBreaker, HealthChecker};
use stevedore::scheduler::{JobStore, QueueManager};
use stevedore::shutdown::{install_shutdown_handler, ShutdownCoordinator};
use stevedore::worker::Worker;

/// Run a job-scheduling worker against a shared store.
#[derive(Parser, Debug)]
#[command(name = "stevedore", version)]
struct Args {
    /// Path to the shared job store.
    #[arg(long, default_value = "stevedore.db")]
    db: PathBuf,

    /// Worker identifier; must be unique per process.
    #[arg(long, default_value = "worker-1")]
    worker_id: String,

    /// Cap on simultaneously running jobs.
    #[arg(long, default_value_t = 10)]
    max_concurrent: usize,

    /// Queue poll interval in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    poll_interval_ms: u64,

    /// Ceiling on draining in-flight jobs at shutdown, in milliseconds.
    #[arg(long, default_value_t = 60_000)]
    shutdown_timeout_ms: u64,

    /// Default image for jobs that do not name one.
    #[arg(long, default_value = "alpine:latest")]
    docker_image: String,

    /// Optional serverless platform endpoint; adds a cloud target.
    #[arg(long)]
    cloud_url: Option<String>,

    /// Bearer token for the cloud endpoint.
    #[arg(long)]
    cloud_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let store = Arc::new(JobStore::open(&args.db)?);

    let mut targets = vec![BackendTarget::new(BackendKind::Docker, "local")];
    if let Some(url) = &args.cloud_url {
        targets.push(BackendTarget::new(BackendKind::Cloud, url.clone()));
    }

    let rules = vec![
        RoutingRule::new("gpu-to-cloud", RulePredicate::RequiresGpu, BackendKind::Cloud, 100),
        RoutingRule::new(
            "high-memory-to-cloud",
            RulePredicate::MemoryAtLeastMb(8_192),
            BackendKind::Cloud,
            50,
        ),
    ];

    let docker = DockerConfig {
        default_image: args.docker_image.clone(),
        ..DockerConfig::default()
    };
    let cloud = CloudConfig {
        api_token: args.cloud_token.clone(),
        ..CloudConfig::default()
    };
    let router = Arc::new(ExecutorRouter::new(
        rules,
        BackendKind::Docker,
        targets,
        default_executor_factory(docker, cloud),
    ));

    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let queue = Arc::new(
        QueueManager::new(
            store,
            router.clone(),
            QueueConfig::default(),
            args.worker_id.clone(),
        )
        .with_circuit_breaker(breaker),
    );

    let worker_config = WorkerConfig {
        max_concurrent: args.max_concurrent,
        poll_interval_ms: args.poll_interval_ms,
        shutdown_timeout_ms: args.shutdown_timeout_ms,
        ..WorkerConfig::default()
    };

    let token = install_shutdown_handler();
    let shutdown = ShutdownCoordinator::new(
        token,
        Duration::from_millis(args.shutdown_timeout_ms),
    );

    let health = Arc::new(HealthChecker::new(HealthCheckConfig::default(), router));
    let health_token = shutdown.token();
    tokio::spawn(async move { health.run(health_token).await });

    let worker = Worker::new(queue, worker_config);
    worker.run(&shutdown).await;

    tracing::info!("Worker exited");
    Ok(())
}
