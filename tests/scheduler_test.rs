//! Scheduler-level scenarios: concurrency caps, deadlines, attempt
//! budgets, cancellation, and event ordering.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ai3::events::RunEvent;
use ai3::graph::{Feature, TaskGraph, TaskKind, TaskNode};
use ai3::providers::{ProviderSet, StubProvider};
use ai3::registry::{ModelDescriptor, Registry};
use ai3::router::Router;
use ai3::scheduler::{
    Scheduler, SchedulerConfig, SchedulerOutcome, TaskResult, EVENT_CHANNEL_CAPACITY,
};
use ai3::telemetry::Telemetry;
use ai3::verifier::Verifier;
use common::flat_descriptor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn config(global_max: usize, per_provider_max: usize) -> SchedulerConfig {
    SchedulerConfig {
        global_max,
        per_provider_max,
        task_timeout: Duration::from_secs(10),
        verify_enabled: true,
        repair_limit: 1,
    }
}

fn scheduler_with(
    models: Vec<ModelDescriptor>,
    stubs: &[Arc<StubProvider>],
    config: SchedulerConfig,
) -> (Scheduler, Arc<Registry>) {
    let registry = Arc::new(Registry::new(models, Arc::new(Telemetry::new())));
    let mut providers = ProviderSet::new();
    for stub in stubs {
        providers.insert(stub.clone());
    }
    let scheduler = Scheduler::new(
        Arc::new(Router::new(registry.clone())),
        providers,
        Arc::new(Verifier::heuristic()),
        registry.clone(),
        config,
    );
    (scheduler, registry)
}

async fn run_graph(
    scheduler: &Scheduler,
    graph: TaskGraph,
    cancel: CancellationToken,
) -> (SchedulerOutcome, Vec<RunEvent>) {
    let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    let outcome = scheduler.run(graph, tx, cancel).await;
    let events = collector.await.unwrap();
    (outcome, events)
}

fn node(id: &str, prompt: &str) -> TaskNode {
    TaskNode::new(id, TaskKind::General, prompt)
}

fn all_done(outcome: &SchedulerOutcome) -> bool {
    outcome
        .results
        .values()
        .all(|r| matches!(r, TaskResult::Done { .. }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_global_concurrency_cap() {
    // S3: five independent nodes, global_max = 2.
    let stub = Arc::new(StubProvider::new("stub").with_delay(Duration::from_millis(50)));
    let (scheduler, _) = scheduler_with(
        vec![flat_descriptor("m", "stub", 0.9)],
        &[stub.clone()],
        config(2, 5),
    );

    let graph = TaskGraph::new((1..=5).map(|i| node(&format!("t{i}"), "go")).collect());
    let (outcome, _) = run_graph(&scheduler, graph, CancellationToken::new()).await;

    assert!(all_done(&outcome));
    assert_eq!(outcome.tasks_executed, 5);
    assert!(stub.max_concurrent() <= 2, "saw {}", stub.max_concurrent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_provider_cap_serializes() {
    // S4: three nodes on one provider with per_provider_max = 1 run
    // serially despite free global slots.
    let stub = Arc::new(StubProvider::new("stub").with_delay(Duration::from_millis(50)));
    let (scheduler, _) = scheduler_with(
        vec![flat_descriptor("m", "stub", 0.9)],
        &[stub.clone()],
        config(5, 1),
    );

    let graph = TaskGraph::new((1..=3).map(|i| node(&format!("t{i}"), "go")).collect());
    let (outcome, _) = run_graph(&scheduler, graph, CancellationToken::new()).await;

    assert!(all_done(&outcome));
    assert_eq!(stub.max_concurrent(), 1);
}

#[tokio::test]
async fn test_dependency_ordering() {
    // No task starts before its predecessors are done.
    let stub = Arc::new(StubProvider::new("stub"));
    stub.push_reply("m", "first-out");
    stub.push_reply("m", "second-out");
    let (scheduler, _) = scheduler_with(
        vec![flat_descriptor("m", "stub", 0.9)],
        &[stub.clone()],
        config(5, 5),
    );

    let mut t2 = node("t2", "second");
    t2.inputs = vec!["t1".into()];
    let graph = TaskGraph::new(vec![node("t1", "first"), t2]);
    let (outcome, events) = run_graph(&scheduler, graph, CancellationToken::new()).await;

    assert!(all_done(&outcome));
    let t1_verified = events
        .iter()
        .position(|e| matches!(e, RunEvent::TaskVerified { task_id, .. } if task_id == "t1"))
        .unwrap();
    let t2_start = events
        .iter()
        .position(|e| matches!(e, RunEvent::TaskStart { task_id } if task_id == "t2"))
        .unwrap();
    assert!(t1_verified < t2_start);

    // The dependent attempt consumed the upstream artifact.
    assert!(stub.prompts()[1].contains("Context from t1:\nfirst-out"));
}

#[tokio::test]
async fn test_attempt_deadline_counts_as_timeout() {
    let stub = Arc::new(StubProvider::new("stub").with_delay(Duration::from_millis(200)));
    let (scheduler, registry) = scheduler_with(
        vec![flat_descriptor("m", "stub", 0.9)],
        &[stub.clone()],
        SchedulerConfig {
            global_max: 2,
            per_provider_max: 2,
            task_timeout: Duration::from_millis(50),
            verify_enabled: true,
            repair_limit: 1,
        },
    );

    let graph = TaskGraph::new(vec![node("t1", "slow")]);
    let (outcome, events) = run_graph(&scheduler, graph, CancellationToken::new()).await;

    match outcome.results.get("t1").unwrap() {
        TaskResult::Failed { reason } => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(events
        .iter()
        .any(|e| matches!(e, RunEvent::TaskFailed { .. })));
    // The timeout was recorded as a failed outcome for the model.
    assert_eq!(registry.telemetry().snapshot("m").unwrap().errors, 1);
}

#[tokio::test]
async fn test_attempt_budget_bounds_retries() {
    // One candidate, repair budget 1: at most two executions, then failed.
    let stub = Arc::new(StubProvider::new("stub").with_default_reply("wrong"));
    let (scheduler, _) = scheduler_with(
        vec![flat_descriptor("m", "stub", 0.9)],
        &[stub.clone()],
        config(2, 2),
    );

    let mut t1 = node("t1", "exact");
    t1.criteria = vec!["must contain the word ZZZZ".into()];
    let graph = TaskGraph::new(vec![t1]);
    let (outcome, events) = run_graph(&scheduler, graph, CancellationToken::new()).await;

    assert!(matches!(
        outcome.results.get("t1").unwrap(),
        TaskResult::Failed { .. }
    ));
    // cumulative_attempts <= len(candidates) + initial_repair_budget.
    assert_eq!(stub.call_count(), 2);
    let repairs = events
        .iter()
        .filter(|e| matches!(e, RunEvent::TaskRepaired { .. }))
        .count();
    assert_eq!(repairs, 1);
}

#[tokio::test]
async fn test_repair_runs_inside_parent_slot() {
    // A repair cycle under global_max = 1 must not deadlock.
    let stub = Arc::new(StubProvider::new("stub"));
    stub.push_reply("m", "bar");
    stub.push_reply("m", "bar FOO");
    let (scheduler, _) = scheduler_with(
        vec![flat_descriptor("m", "stub", 0.9)],
        &[stub.clone()],
        config(1, 1),
    );

    let mut t1 = node("t1", "say foo");
    t1.criteria = vec!["must contain the word FOO".into()];
    let graph = TaskGraph::new(vec![t1]);
    let (outcome, _) = tokio::time::timeout(
        Duration::from_secs(5),
        run_graph(&scheduler, graph, CancellationToken::new()),
    )
    .await
    .expect("repair must not deadlock under a tight global cap");

    assert!(all_done(&outcome));
    assert_eq!(outcome.tasks_repaired, 1);
    // The directive node is recorded in the final graph.
    assert!(outcome.graph.get("t1.repair1").is_some());
}

#[tokio::test]
async fn test_cancellation_fails_remaining_tasks() {
    let stub = Arc::new(StubProvider::new("stub").with_delay(Duration::from_millis(500)));
    let (scheduler, _) = scheduler_with(
        vec![flat_descriptor("m", "stub", 0.9)],
        &[stub.clone()],
        config(5, 5),
    );

    let graph = TaskGraph::new(vec![node("t1", "slow"), node("t2", "slow")]);
    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };
    let (outcome, events) = run_graph(&scheduler, graph, cancel).await;
    canceller.await.unwrap();

    assert!(outcome.cancelled);
    for result in outcome.results.values() {
        assert!(matches!(
            result,
            TaskResult::Failed { reason } if reason == "Cancelled"
        ));
    }
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, RunEvent::TaskFailed { .. }))
            .count(),
        2
    );
}

#[tokio::test]
async fn test_unroutable_task_fails_and_cascades() {
    // No model supports vision; the task and its dependent both fail.
    let stub = Arc::new(StubProvider::new("stub"));
    let (scheduler, _) = scheduler_with(
        vec![flat_descriptor("m", "stub", 0.9)],
        &[stub.clone()],
        config(5, 5),
    );

    let mut t1 = node("t1", "look at this");
    t1.features = [Feature::Vision].into_iter().collect();
    let mut t2 = node("t2", "then this");
    t2.inputs = vec!["t1".into()];
    let graph = TaskGraph::new(vec![t1, t2]);
    let (outcome, events) = run_graph(&scheduler, graph, CancellationToken::new()).await;

    assert!(matches!(
        outcome.results.get("t1").unwrap(),
        TaskResult::Failed { .. }
    ));
    assert!(matches!(
        outcome.results.get("t2").unwrap(),
        TaskResult::Failed { reason } if reason.contains("upstream")
    ));
    assert_eq!(outcome.tasks_executed, 0);
    assert_eq!(stub.call_count(), 0);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, RunEvent::TaskFailed { .. }))
            .count(),
        2
    );
}

#[tokio::test]
async fn test_verifier_error_consumes_repair_then_falls_back() {
    // An LLM-rubric verifier whose judge model errors: the verdict fails
    // with VerifierError, one repair attempt is spent, then fallback.
    let stub = Arc::new(StubProvider::new("stub").with_default_reply("output"));
    let judge = Arc::new(StubProvider::new("judge-provider"));
    let registry = Arc::new(Registry::new(
        vec![flat_descriptor("m", "stub", 0.9)],
        Arc::new(Telemetry::new()),
    ));
    let mut providers = ProviderSet::new();
    providers.insert(stub.clone());
    providers.insert(judge.clone());
    // Judge model always errors.
    judge.push_failure(
        "judge",
        ai3::error::ProviderError::Permanent("judge down".into()),
    );
    judge.push_failure(
        "judge",
        ai3::error::ProviderError::Permanent("judge down".into()),
    );
    let scheduler = Scheduler::new(
        Arc::new(Router::new(registry.clone())),
        providers,
        Arc::new(Verifier::with_llm_rubric(judge.clone(), "judge")),
        registry,
        config(2, 2),
    );

    let mut t1 = node("t1", "anything");
    t1.criteria = vec!["output is valid".into()];
    let graph = TaskGraph::new(vec![t1]);
    let (outcome, events) = run_graph(&scheduler, graph, CancellationToken::new()).await;

    match outcome.results.get("t1").unwrap() {
        TaskResult::Failed { reason } => assert!(reason.contains("VerifierError"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
    // Execution attempts: initial + one repair.
    assert_eq!(stub.call_count(), 2);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, RunEvent::TaskRepaired { .. }))
            .count(),
        1
    );
}
