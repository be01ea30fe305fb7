
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stevedore::config::{CircuitBreakerConfig, QueueConfig};
use stevedore::error::Error;
use stevedore::executor::ExecStatus;
use stevedore::reliability::{CircuitBreaker, CircuitState};
use stevedore::scheduler::{JobStatus, LaunchOutcome, QueueManager};
use tokio_util::sync::CancellationToken;

use test_harness::{stub_job, stub_queue};

#[tokio::test]
async fn enqueue_sets_queue_fields() {
    let fixture = stub_queue();
    let job = stub_job("enqueue");
    fixture.queue.insert_job(&job).unwrap();

    let queued = fixture.queue.enqueue(job.id, None, Some(70)).unwrap();
    assert_eq!(queued.status, JobStatus::Queued);
    assert_eq!(queued.priority, 70);
    assert!(queued.queued_at.is_some());
}

#[tokio::test]
async fn enqueue_twice_fails() {
    let fixture = stub_queue();
    let job = stub_job("twice");
    fixture.queue.insert_job(&job).unwrap();
    fixture.queue.enqueue(job.id, None, None).unwrap();

    assert!(matches!(
        fixture.queue.enqueue(job.id, None, None),
        Err(Error::JobAlreadyQueued(_))
    ));
}

#[tokio::test]
async fn enqueue_terminal_job_fails() {
    let fixture = stub_queue();
    let mut job = stub_job("cancelled");
    job.mark_cancelled(Utc::now()).unwrap();
    fixture.queue.insert_job(&job).unwrap();

    assert!(matches!(
        fixture.queue.enqueue(job.id, None, None),
        Err(Error::InvalidStateTransition { .. })
    ));
}

#[tokio::test]
async fn dequeue_reverts_and_second_call_fails() {
    let fixture = stub_queue();
    let job = stub_job("dequeue");
    fixture.queue.insert_job(&job).unwrap();
    fixture.queue.enqueue(job.id, None, None).unwrap();

    let dequeued = fixture.queue.dequeue(job.id).unwrap();
    assert_eq!(dequeued.status, JobStatus::Pending);
    assert!(dequeued.queued_at.is_none());
    assert!(dequeued.scheduled_for.is_none());
    assert_eq!(dequeued.retry_count, 0);

    // The second dequeue is the failure, not a state change.
    assert!(matches!(
        fixture.queue.dequeue(job.id),
        Err(Error::JobNotQueued(_))
    ));

    // And the dequeued job is gone from the ready view.
    let ready = fixture.queue.ready_jobs(None, &[]).unwrap();
    assert!(ready.iter().all(|j| j.id != job.id));
}

#[tokio::test]
async fn ready_jobs_order_priority_then_fifo() {
    let fixture = stub_queue();

    let a = stub_job("a").with_priority(50);
    let b = stub_job("b").with_priority(80);
    fixture.queue.insert_job(&a).unwrap();
    fixture.queue.insert_job(&b).unwrap();
    fixture.queue.enqueue(a.id, None, None).unwrap();
    fixture.queue.enqueue(b.id, None, None).unwrap();

    let ready = fixture.queue.ready_jobs(None, &[]).unwrap();
    assert_eq!(ready.len(), 2);
    assert_eq!(ready[0].id, b.id, "higher priority first");
    assert_eq!(ready[1].id, a.id);

    // Equal priorities tie-break on enqueue time.
    let fixture = stub_queue();
    let now = Utc::now();
    let mut first = stub_job("first");
    first.mark_queued(now).unwrap();
    let mut second = stub_job("second");
    second.mark_queued(now + chrono::Duration::milliseconds(5)).unwrap();
    fixture.queue.insert_job(&second).unwrap();
    fixture.queue.insert_job(&first).unwrap();

    let ready = fixture.queue.ready_jobs(None, &[]).unwrap();
    assert_eq!(ready[0].id, first.id);
    assert_eq!(ready[1].id, second.id);
}

#[tokio::test]
async fn ready_jobs_respect_schedule_budget_and_exclusions() {
    let fixture = stub_queue();
    let now = Utc::now();

    let future = stub_job("future");
    fixture.queue.insert_job(&future).unwrap();
    fixture
        .queue
        .enqueue(future.id, Some(now + chrono::Duration::seconds(120)), None)
        .unwrap();

    let mut exhausted = stub_job("exhausted").with_max_retries(2);
    exhausted.mark_queued(now).unwrap();
    exhausted.retry_count = 2;
    fixture.queue.insert_job(&exhausted).unwrap();

    let ready_now = stub_job("ready");
    fixture.queue.insert_job(&ready_now).unwrap();
    fixture.queue.enqueue(ready_now.id, None, None).unwrap();

    let ready = fixture.queue.ready_jobs(None, &[]).unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, ready_now.id);

    let excluded = fixture.queue.ready_jobs(None, &[ready_now.id]).unwrap();
    assert!(excluded.is_empty());
}

#[tokio::test]
async fn acquire_and_launch_runs_the_job() {
    let fixture = stub_queue();
    let job = stub_job("launch");
    fixture.queue.insert_job(&job).unwrap();
    fixture.queue.enqueue(job.id, None, None).unwrap();

    let claimed = fixture.queue.acquire_next().await.unwrap().expect("a ready job");
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.claimed_by.as_deref(), Some("test-worker"));

    // A claimed job is invisible to the ready view and further claims.
    assert!(fixture.queue.ready_jobs(None, &[]).unwrap().is_empty());
    assert!(fixture.queue.acquire_next().await.unwrap().is_none());

    let launched = fixture.queue.launch(&claimed).await.unwrap();
    assert_eq!(launched.status, JobStatus::Running);
    assert!(launched.execution_id.is_some());
    assert!(launched.launched_at.is_some());
    assert!(launched.claimed_by.is_none());
    assert_eq!(fixture.stub.launch_count(), 1);

    // Capacity accounting followed the launch.
    assert_eq!(fixture.router.all_targets()[0].current_job_count, 1);
}

#[tokio::test]
async fn transient_failures_reschedule_then_exhaust_budget() {
    let fixture = stub_queue();
    let job = stub_job("transient").with_max_retries(2);
    fixture.queue.insert_job(&job).unwrap();
    fixture.queue.enqueue(job.id, None, None).unwrap();

    // First attempt: connection refused is transient, first retry immediate.
    fixture.stub.script_launch_failure("connection refused");
    let claimed = fixture.queue.acquire_next().await.unwrap().unwrap();
    let before = Utc::now();
    let outcome = fixture.queue.launch_with_retry(&claimed).await.unwrap();
    let rescheduled = match outcome {
        LaunchOutcome::Rescheduled(job) => job,
        other => panic!("expected Rescheduled, got {other:?}"),
    };
    assert_eq!(rescheduled.status, JobStatus::Retrying);
    assert_eq!(rescheduled.retry_count, 1);
    assert!(rescheduled.last_error.as_deref().unwrap().contains("connection refused"));
    assert!(rescheduled.last_error_at.is_some());
    let scheduled_for = rescheduled.scheduled_for.expect("retry scheduled");
    assert!(scheduled_for - before < chrono::Duration::seconds(2), "first retry is immediate");

    // Second attempt: budget exhausted, parked as failed.
    fixture.stub.script_launch_failure("timeout");
    let claimed = fixture.queue.acquire_next().await.unwrap().expect("retrying job is ready");
    let outcome = fixture.queue.launch_with_retry(&claimed).await.unwrap();
    let failed = match outcome {
        LaunchOutcome::Failed(job) => job,
        other => panic!("expected Failed, got {other:?}"),
    };
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 2);
    assert!(failed.queued_at.is_none(), "failed jobs leave the polling set");
}

#[tokio::test]
async fn permanent_failure_parks_immediately() {
    let fixture = stub_queue();
    let job = stub_job("permanent").with_max_retries(3);
    fixture.queue.insert_job(&job).unwrap();
    fixture.queue.enqueue(job.id, None, None).unwrap();

    fixture.stub.script_launch_failure("image not found: ghcr.io/acme/app");
    let claimed = fixture.queue.acquire_next().await.unwrap().unwrap();
    let outcome = fixture.queue.launch_with_retry(&claimed).await.unwrap();
    let failed = match outcome {
        LaunchOutcome::Failed(job) => job,
        other => panic!("expected Failed, got {other:?}"),
    };
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 1, "permanent errors fail regardless of budget");
}

#[tokio::test]
async fn zero_retry_budget_fails_on_first_failure() {
    let fixture = stub_queue();
    let job = stub_job("one-shot").with_max_retries(0);
    fixture.queue.insert_job(&job).unwrap();
    fixture.queue.enqueue(job.id, None, None).unwrap();

    fixture.stub.script_launch_failure("connection refused");
    let claimed = fixture.queue.acquire_next().await.unwrap().expect("one-shot jobs launch once");
    let outcome = fixture.queue.launch_with_retry(&claimed).await.unwrap();
    assert!(matches!(outcome, LaunchOutcome::Failed(_)));
}

#[tokio::test]
async fn plain_launch_leaves_status_decision_to_caller() {
    let fixture = stub_queue();
    let job = stub_job("no-policy");
    fixture.queue.insert_job(&job).unwrap();
    fixture.queue.enqueue(job.id, None, None).unwrap();

    fixture.stub.script_launch_failure("connection refused");
    let claimed = fixture.queue.acquire_next().await.unwrap().unwrap();
    assert!(fixture.queue.launch(&claimed).await.is_err());

    let after = fixture.store.get(job.id).unwrap();
    assert_eq!(after.status, JobStatus::Queued, "no transition without a policy");
    assert_eq!(after.retry_count, 1, "the attempt still counts");
    assert!(after.claimed_by.is_none(), "claim released");
}

#[tokio::test]
async fn batch_fills_only_free_slots() {
    let fixture = stub_queue();

    // One job already running.
    let mut running = stub_job("running");
    let now = Utc::now();
    running.mark_queued(now).unwrap();
    running.mark_running(now).unwrap();
    running.execution_id = Some("stub-pre".to_string());
    fixture.queue.insert_job(&running).unwrap();

    for i in 0..5 {
        let job = stub_job(&format!("ready-{i}"));
        fixture.queue.insert_job(&job).unwrap();
        fixture.queue.enqueue(job.id, None, None).unwrap();
    }

    let cancel = CancellationToken::new();
    let outcome = fixture
        .queue
        .launch_next_batch(3, Duration::from_secs(5), &cancel)
        .await
        .unwrap();
    assert_eq!(outcome.launched.len(), 2, "3 slots minus 1 running");
    assert!(outcome.errors.is_empty());
    assert_eq!(fixture.queue.ready_jobs(None, &[]).unwrap().len(), 3);
}

#[tokio::test]
async fn batch_reports_per_job_errors_without_raising() {
    let fixture = stub_queue();
    for i in 0..3 {
        let job = stub_job(&format!("job-{i}"));
        fixture.queue.insert_job(&job).unwrap();
        fixture.queue.enqueue(job.id, None, None).unwrap();
    }
    // Middle launch fails permanently.
    fixture.stub.script_launch_success();
    fixture.stub.script_launch_failure("permission denied");
    fixture.stub.script_launch_success();

    let cancel = CancellationToken::new();
    let outcome = fixture
        .queue
        .launch_next_batch(10, Duration::from_secs(5), &cancel)
        .await
        .unwrap();
    assert_eq!(outcome.launched.len(), 2);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors[0].1.contains("permission denied"));
}

#[tokio::test]
async fn batch_stops_on_cancellation() {
    let fixture = stub_queue();
    for i in 0..3 {
        let job = stub_job(&format!("job-{i}"));
        fixture.queue.insert_job(&job).unwrap();
        fixture.queue.enqueue(job.id, None, None).unwrap();
    }

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = fixture
        .queue
        .launch_next_batch(10, Duration::from_secs(5), &cancel)
        .await
        .unwrap();
    assert!(outcome.launched.is_empty());
}

#[tokio::test]
async fn retry_failed_job_requeues_manually() {
    let fixture = stub_queue();
    let job = stub_job("manual").with_max_retries(0);
    fixture.queue.insert_job(&job).unwrap();
    fixture.queue.enqueue(job.id, None, None).unwrap();

    fixture.stub.script_launch_failure("connection refused");
    let claimed = fixture.queue.acquire_next().await.unwrap().unwrap();
    fixture.queue.launch_with_retry(&claimed).await.unwrap();
    assert_eq!(fixture.store.get(job.id).unwrap().status, JobStatus::Failed);

    let requeued = fixture.queue.retry_failed_job(job.id, true).unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.retry_count, 0);
    assert!(requeued.last_error.is_none());
    assert!(requeued.scheduled_for.is_none());
    assert!(requeued.queued_at.is_some());

    // And it launches fine now.
    let claimed = fixture.queue.acquire_next().await.unwrap().expect("requeued job is ready");
    assert!(matches!(
        fixture.queue.launch_with_retry(&claimed).await.unwrap(),
        LaunchOutcome::Launched(_)
    ));
}

#[tokio::test]
async fn retry_failed_job_rejects_queued_jobs_without_mutation() {
    let fixture = stub_queue();
    let job = stub_job("queued");
    fixture.queue.insert_job(&job).unwrap();
    fixture.queue.enqueue(job.id, None, None).unwrap();

    assert!(fixture.queue.retry_failed_job(job.id, true).is_err());
    let after = fixture.store.get(job.id).unwrap();
    assert_eq!(after.status, JobStatus::Queued);
    assert_eq!(after.retry_count, 0);
    assert!(after.queued_at.is_some());
}

#[tokio::test]
async fn cancel_running_job_cleans_up_backend() {
    let fixture = stub_queue();
    let job = stub_job("cancel-running");
    fixture.queue.insert_job(&job).unwrap();
    fixture.queue.enqueue(job.id, None, None).unwrap();

    let claimed = fixture.queue.acquire_next().await.unwrap().unwrap();
    let launched = fixture.queue.launch(&claimed).await.unwrap();
    let execution_id = launched.execution_id.clone().unwrap();

    let cancelled = fixture.queue.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    assert!(fixture.stub.cleaned_executions().contains(&execution_id));
    assert_eq!(fixture.router.all_targets()[0].current_job_count, 0);

    // Terminal: cancelling again fails.
    assert!(fixture.queue.cancel(job.id).await.is_err());
}

#[tokio::test]
async fn monitor_harvests_completions_and_failures() {
    let fixture = stub_queue();

    let done = stub_job("done");
    fixture.queue.insert_job(&done).unwrap();
    fixture.queue.enqueue(done.id, None, None).unwrap();
    let claimed = fixture.queue.acquire_next().await.unwrap().unwrap();
    let launched = fixture.queue.launch(&claimed).await.unwrap();
    fixture
        .stub
        .set_status(launched.execution_id.clone().unwrap(), ExecStatus::Exited);

    let crashed = stub_job("crashed").with_max_retries(3);
    fixture.queue.insert_job(&crashed).unwrap();
    fixture.queue.enqueue(crashed.id, None, None).unwrap();
    let claimed = fixture.queue.acquire_next().await.unwrap().unwrap();
    let launched = fixture.queue.launch(&claimed).await.unwrap();
    fixture
        .stub
        .set_status(launched.execution_id.clone().unwrap(), ExecStatus::Failed);

    let report = fixture.queue.monitor_running().await.unwrap();
    assert_eq!(report.completed, vec![done.id]);
    assert_eq!(report.failed, vec![crashed.id]);

    let done_job = fixture.store.get(done.id).unwrap();
    assert_eq!(done_job.status, JobStatus::Completed);
    assert_eq!(done_job.exit_code, Some(0));
    assert!(done_job.completed_at.is_some());

    // Execution failure with budget left goes back through retry.
    let crashed_job = fixture.store.get(crashed.id).unwrap();
    assert_eq!(crashed_job.status, JobStatus::Retrying);
    assert_eq!(crashed_job.retry_count, 1);
    assert!(crashed_job.last_error.as_deref().unwrap().contains("exit code"));

    // Both target slots released.
    assert_eq!(fixture.router.all_targets()[0].current_job_count, 0);
}

#[tokio::test]
async fn monitor_reports_vanished_executions() {
    let fixture = stub_queue();
    let job = stub_job("vanished");
    fixture.queue.insert_job(&job).unwrap();
    fixture.queue.enqueue(job.id, None, None).unwrap();
    let claimed = fixture.queue.acquire_next().await.unwrap().unwrap();
    let launched = fixture.queue.launch(&claimed).await.unwrap();
    fixture
        .stub
        .set_status(launched.execution_id.clone().unwrap(), ExecStatus::NotFound);

    let report = fixture.queue.monitor_running().await.unwrap();
    assert_eq!(report.missing, vec![job.id]);
    let after = fixture.store.get(job.id).unwrap();
    assert_eq!(after.status, JobStatus::Retrying);
}

#[tokio::test]
async fn open_circuit_fails_launches_without_reaching_the_backend() {
    let fixture = stub_queue();
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 2,
        recovery_timeout_ms: 60_000,
    }));
    let queue = QueueManager::new(
        fixture.store.clone(),
        fixture.router.clone(),
        QueueConfig::default(),
        "breaker-worker",
    )
    .with_circuit_breaker(breaker.clone());

    // Generous budgets so repeated failures keep rescheduling (a worker may
    // claim the same FIFO-first job every round).
    for i in 0..3 {
        let job = stub_job(&format!("job-{i}"))
            .with_priority(90)
            .with_max_retries(5);
        queue.insert_job(&job).unwrap();
        queue.enqueue(job.id, None, None).unwrap();
    }
    fixture.stub.script_launch_failure("connection refused");
    fixture.stub.script_launch_failure("connection refused");

    for _ in 0..2 {
        let claimed = queue.acquire_next().await.unwrap().unwrap();
        let outcome = queue.launch_with_retry(&claimed).await.unwrap();
        assert!(matches!(outcome, LaunchOutcome::Rescheduled(_)));
    }
    assert_eq!(breaker.state("stub"), CircuitState::Open);

    // Third launch is rejected by the breaker; the backend is never asked.
    let claimed = queue.acquire_next().await.unwrap().unwrap();
    let outcome = queue.launch_with_retry(&claimed).await.unwrap();
    match outcome {
        LaunchOutcome::Rescheduled(job) => {
            assert!(job.last_error.as_deref().unwrap().contains("Circuit open"));
        }
        other => panic!("expected Rescheduled, got {other:?}"),
    }
    assert_eq!(fixture.stub.launch_count(), 0, "no launch ever reached the backend");
}

#[tokio::test]
async fn stats_reflect_queue_shape() {
    let fixture = stub_queue();
    let now = Utc::now();

    let ready = stub_job("ready");
    fixture.queue.insert_job(&ready).unwrap();
    fixture.queue.enqueue(ready.id, None, None).unwrap();

    let future = stub_job("future");
    fixture.queue.insert_job(&future).unwrap();
    fixture
        .queue
        .enqueue(future.id, Some(now + chrono::Duration::seconds(300)), None)
        .unwrap();

    let mut running = stub_job("running");
    running.mark_queued(now).unwrap();
    running.mark_running(now).unwrap();
    fixture.queue.insert_job(&running).unwrap();

    let mut failed = stub_job("failed");
    failed.mark_queued(now).unwrap();
    failed.mark_running(now).unwrap();
    failed.mark_failed(false, now).unwrap();
    fixture.queue.insert_job(&failed).unwrap();

    let stats = fixture.queue.queue_stats().unwrap();
    assert_eq!(stats.depth, 2);
    assert_eq!(stats.ready_now, 1);
    assert_eq!(stats.scheduled_future, 1);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.failed, 1);

    let metrics = fixture.queue.worker_metrics(10).unwrap();
    assert_eq!(metrics.max_concurrent, 10);
    assert_eq!(metrics.available_slots, 9);
}
