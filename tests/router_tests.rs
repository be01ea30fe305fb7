
use std::collections::HashMap;
use std::sync::Arc;

use stevedore::error::Error;
use stevedore::executor::{
    BackendKind, BackendTarget, Executor, ExecutorRouter, RoutingRule, RulePredicate, StubExecutor,
};

use test_harness::stub_job;

fn stub_factory() -> Box<dyn Fn(&BackendTarget) -> stevedore::Result<Arc<dyn Executor>> + Send + Sync>
{
    Box::new(|_| Ok(Arc::new(StubExecutor::new()) as Arc<dyn Executor>))
}

fn router_with(rules: Vec<RoutingRule>, targets: Vec<BackendTarget>) -> ExecutorRouter {
    ExecutorRouter::new(rules, BackendKind::Docker, targets, stub_factory())
}

#[test]
fn first_matching_rule_wins_in_priority_order() {
    let router = router_with(
        vec![
            RoutingRule::new("gpu", RulePredicate::RequiresGpu, BackendKind::Cloud, 100),
            RoutingRule::new(
                "high-memory",
                RulePredicate::MemoryAtLeastMb(8_192),
                BackendKind::Cloud,
                50,
            ),
            RoutingRule::new("everything", RulePredicate::Always, BackendKind::Docker, 0),
        ],
        vec![
            BackendTarget::new(BackendKind::Docker, "local"),
            BackendTarget::new(BackendKind::Cloud, "https://jobs.example.com"),
        ],
    );

    let mut job = stub_job("big");
    job.workload.memory_mb = Some(16_384);
    let decision = router.route(&job);
    assert_eq!(decision.backend, BackendKind::Cloud);
    assert_eq!(decision.rule.as_deref(), Some("high-memory"));
    assert!(decision.reason.contains("high-memory"));

    let small = stub_job("small");
    let decision = router.route(&small);
    assert_eq!(decision.backend, BackendKind::Docker);
    assert_eq!(decision.rule.as_deref(), Some("everything"));
}

#[test]
fn predicates_match_job_attributes() {
    let mut job = stub_job("nightly-batch-report");
    job.workload.memory_mb = Some(4_096);
    job.workload.cpus = Some(2.0);
    job.workload.gpu = true;
    job.priority = 85;
    job.requester = Some("ci-bot".to_string());

    assert!(RulePredicate::MemoryAtLeastMb(4_096).matches(&job));
    assert!(!RulePredicate::MemoryAtLeastMb(8_192).matches(&job));
    assert!(RulePredicate::CpuAtLeast(1.5).matches(&job));
    assert!(RulePredicate::RequiresGpu.matches(&job));
    assert!(RulePredicate::NameContains("batch".to_string()).matches(&job));
    assert!(!RulePredicate::NameContains("adhoc".to_string()).matches(&job));
    assert!(RulePredicate::PriorityAtLeast(80).matches(&job));
    assert!(RulePredicate::RequesterIs("ci-bot".to_string()).matches(&job));
    assert!(!RulePredicate::RequesterIs("human".to_string()).matches(&job));
    assert!(RulePredicate::Always.matches(&job));

    // Absent attributes never match thresholds.
    let bare = stub_job("bare");
    assert!(!RulePredicate::MemoryAtLeastMb(1).matches(&bare));
    assert!(!RulePredicate::CpuAtLeast(0.1).matches(&bare));
    assert!(!RulePredicate::RequesterIs("anyone".to_string()).matches(&bare));
}

#[test]
fn unavailable_backend_falls_back_to_default_with_reason() {
    let mut cloud_target = BackendTarget::new(BackendKind::Cloud, "https://jobs.example.com");
    cloud_target.is_active = false;

    let router = router_with(
        vec![RoutingRule::new(
            "gpu",
            RulePredicate::RequiresGpu,
            BackendKind::Cloud,
            100,
        )],
        vec![BackendTarget::new(BackendKind::Docker, "local"), cloud_target],
    );

    let mut job = stub_job("gpu-job");
    job.workload.gpu = true;
    let decision = router.route(&job);
    assert_eq!(decision.backend, BackendKind::Docker);
    assert!(decision.rule.is_none());
    assert!(decision.reason.contains("gpu"));
    assert!(decision.reason.contains("unavailable"));
}

#[test]
fn no_matching_rule_uses_default() {
    let router = router_with(
        vec![RoutingRule::new(
            "gpu",
            RulePredicate::RequiresGpu,
            BackendKind::Cloud,
            100,
        )],
        vec![BackendTarget::new(BackendKind::Docker, "local")],
    );
    let decision = router.route(&stub_job("plain"));
    assert_eq!(decision.backend, BackendKind::Docker);
    assert!(decision.reason.contains("no rule matched"));
}

#[test]
fn select_target_requires_an_active_target_with_capacity() {
    let router = router_with(vec![], vec![]);
    assert!(matches!(
        router.select_target(BackendKind::Docker),
        Err(Error::InsufficientResources(_))
    ));

    let mut inactive = BackendTarget::new(BackendKind::Docker, "a");
    inactive.is_active = false;
    let router = router_with(vec![], vec![inactive]);
    assert!(matches!(
        router.select_target(BackendKind::Docker),
        Err(Error::InsufficientResources(_))
    ));

    let mut full = BackendTarget::new(BackendKind::Docker, "b").with_capacity(1);
    full.current_job_count = 1;
    let router = router_with(vec![], vec![full]);
    assert!(matches!(
        router.select_target(BackendKind::Docker),
        Err(Error::InsufficientResources(_))
    ));
}

#[test]
fn weighted_selection_prefers_heavier_targets() {
    let heavy = BackendTarget::new(BackendKind::Docker, "heavy").with_weight(1000);
    let light = BackendTarget::new(BackendKind::Docker, "light").with_weight(1);
    let heavy_id = heavy.id;
    let router = router_with(vec![], vec![heavy, light]);

    let mut heavy_picks = 0;
    for _ in 0..300 {
        if router.select_target(BackendKind::Docker).unwrap().id == heavy_id {
            heavy_picks += 1;
        }
    }
    // ~99.9% expected; anything under 250/300 would be a broken walk.
    assert!(heavy_picks > 250, "heavy target picked only {heavy_picks}/300");
}

#[test]
fn all_zero_weights_degrade_to_uniform() {
    let a = BackendTarget::new(BackendKind::Docker, "a").with_weight(0);
    let b = BackendTarget::new(BackendKind::Docker, "b").with_weight(0);
    let a_id = a.id;
    let b_id = b.id;
    let router = router_with(vec![], vec![a, b]);

    let mut picks: HashMap<uuid::Uuid, usize> = HashMap::new();
    for _ in 0..200 {
        let picked = router.select_target(BackendKind::Docker).unwrap();
        *picks.entry(picked.id).or_default() += 1;
    }
    assert!(picks.get(&a_id).copied().unwrap_or(0) > 0);
    assert!(picks.get(&b_id).copied().unwrap_or(0) > 0);
}

#[test]
fn single_candidate_is_always_selected() {
    let only = BackendTarget::new(BackendKind::Docker, "only").with_weight(7);
    let only_id = only.id;
    let router = router_with(vec![], vec![only]);
    for _ in 0..20 {
        assert_eq!(router.select_target(BackendKind::Docker).unwrap().id, only_id);
    }
}

#[test]
fn executor_cache_returns_the_same_instance_until_cleared() {
    let target = BackendTarget::new(BackendKind::Stub, "stub://x");
    let router = router_with(vec![], vec![target.clone()]);

    let first = router.executor_for(&target).unwrap();
    let second = router.executor_for(&target).unwrap();
    assert!(Arc::ptr_eq(&first, &second), "cache must reuse instances");
    assert_eq!(router.cached_executor_count(), 1);

    router.clear_cache();
    assert_eq!(router.cached_executor_count(), 0);
    let third = router.executor_for(&target).unwrap();
    assert!(!Arc::ptr_eq(&first, &third), "cleared cache rebuilds");
}

#[test]
fn capacity_accounting_reserve_and_release() {
    let target = BackendTarget::new(BackendKind::Docker, "local").with_capacity(2);
    let id = target.id;
    let router = router_with(vec![], vec![target]);

    router.reserve_slot(id).unwrap();
    router.reserve_slot(id).unwrap();
    assert!(matches!(
        router.reserve_slot(id),
        Err(Error::InsufficientResources(_))
    ));
    assert!(matches!(
        router.select_target(BackendKind::Docker),
        Err(Error::InsufficientResources(_))
    ));

    router.release_slot(id);
    assert!(router.reserve_slot(id).is_ok());

    // Release never underflows.
    router.release_slot(id);
    router.release_slot(id);
    router.release_slot(id);
    assert_eq!(router.get_target(id).unwrap().current_job_count, 0);
}
