//! Interpreter scenarios: forks, joins, conditions, wait states, boundaries,
//! and transactional rollback of failed commands.

mod common;

use common::*;
use procflow_core::{
    BoundaryTimer, Condition, DeploymentBuilder, EngineError, EngineEvent, ExecutionQuery,
    JobExecutorConfig, JobQuery, JobType, ProcessBuilder, ProcessEngine, TestClock, Value,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;

async fn deploy(engine: &ProcessEngine, model: &procflow_core::DefinitionModel) {
    engine
        .deploy(
            DeploymentBuilder::new("test")
                .add_model(format!("{}.flow.json", model.key), model)
                .unwrap(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn linear_process_runs_to_completion() {
    let listener = CollectingListener::new();
    let engine = ProcessEngine::builder()
        .add_listener(listener.clone())
        .build();
    let model = ProcessBuilder::new("linear")
        .start("start")
        .task("work")
        .end("done")
        .flow("start", "work")
        .flow("work", "done")
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let instance = engine
        .start_process_instance_by_key("linear", no_vars())
        .await
        .unwrap();

    // Instance ran to the end synchronously; the tree is gone.
    let remaining = engine
        .count_executions(&ExecutionQuery::new().process_instance_id(instance))
        .await
        .unwrap();
    assert_eq!(remaining, 0);
    assert_eq!(listener.process_completed_count(), 1);

    // Sequence flows in true traversal order, completion last.
    let flows: Vec<(String, String)> = listener
        .events()
        .iter()
        .filter_map(|e| match e {
            EngineEvent::SequenceFlowTaken { source, target, .. } => {
                Some((source.id.clone(), target.id.clone()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        flows,
        vec![
            ("start".to_string(), "work".to_string()),
            ("work".to_string(), "done".to_string()),
        ]
    );
    assert!(matches!(
        listener.events().last(),
        Some(EngineEvent::ProcessCompleted { .. })
    ));
}

#[tokio::test]
async fn fork_join_balances_tokens() {
    let listener = CollectingListener::new();
    let engine = ProcessEngine::builder()
        .add_listener(listener.clone())
        .build();
    let model = ProcessBuilder::new("forkjoin")
        .start("start")
        .parallel_gateway("fork")
        .receive_task("r1")
        .receive_task("r2")
        .parallel_gateway("join")
        .end("done")
        .flow("start", "fork")
        .flow("fork", "r1")
        .flow("fork", "r2")
        .flow("r1", "join")
        .flow("r2", "join")
        .flow("join", "done")
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let instance = engine
        .start_process_instance_by_key("forkjoin", no_vars())
        .await
        .unwrap();

    // One deactivated parent plus exactly two concurrent children.
    let by_instance = ExecutionQuery::new().process_instance_id(instance);
    assert_eq!(engine.count_executions(&by_instance).await.unwrap(), 3);
    assert_eq!(
        engine
            .count_executions(&by_instance.clone().only_active())
            .await
            .unwrap(),
        2
    );

    let r1 = engine
        .find_unique_execution(&ExecutionQuery::new().node_id("r1").only_active())
        .await
        .unwrap()
        .unwrap();
    engine.signal(r1.id).await.unwrap();

    // First arrival parks at the join; nothing released yet.
    assert_eq!(engine.count_executions(&by_instance).await.unwrap(), 3);
    assert_eq!(listener.process_completed_count(), 0);

    let r2 = engine
        .find_unique_execution(&ExecutionQuery::new().node_id("r2").only_active())
        .await
        .unwrap()
        .unwrap();
    engine.signal(r2.id).await.unwrap();

    // Join released: siblings collapsed into the parent, instance completed.
    assert_eq!(engine.count_executions(&by_instance).await.unwrap(), 0);
    assert_eq!(listener.process_completed_count(), 1);
    let join_completions = listener.count(|e| {
        matches!(e, EngineEvent::ActivityCompleted { node, .. } if node.id == "join")
    });
    assert_eq!(join_completions, 1);
}

#[tokio::test]
async fn conditions_filter_fork_tokens() {
    let engine = ProcessEngine::builder().build();
    let model = ProcessBuilder::new("cond")
        .start("start")
        .task("decide")
        .receive_task("r1")
        .receive_task("r2")
        .receive_task("r3")
        .flow("start", "decide")
        .flow_if("decide", "r1", Condition::is_true("approved"))
        .flow_if("decide", "r2", Condition::is_true("fast_track"))
        .flow("decide", "r3")
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let instance = engine
        .start_process_instance_by_key("cond", vars(&[("approved", Value::Bool(true))]))
        .await
        .unwrap();

    // Tokens only for the true condition and the unconditioned flow; the
    // false condition never produces one.
    let at = |node: &str| {
        ExecutionQuery::new()
            .process_instance_id(instance)
            .node_id(node)
            .only_active()
    };
    assert_eq!(engine.count_executions(&at("r1")).await.unwrap(), 1);
    assert_eq!(engine.count_executions(&at("r2")).await.unwrap(), 0);
    assert_eq!(engine.count_executions(&at("r3")).await.unwrap(), 1);
    assert_eq!(
        engine
            .count_executions(&ExecutionQuery::new().process_instance_id(instance))
            .await
            .unwrap(),
        3
    );
}

#[tokio::test]
async fn parallel_gateway_ignores_conditions() {
    let engine = ProcessEngine::builder().build();
    let model = ProcessBuilder::new("ignore")
        .start("start")
        .parallel_gateway("fan")
        .receive_task("r1")
        .receive_task("r2")
        .receive_task("r3")
        .flow("start", "fan")
        .flow_if("fan", "r1", Condition::is_true("approved"))
        .flow_if("fan", "r2", Condition::is_true("missing"))
        .flow("fan", "r3")
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let instance = engine
        .start_process_instance_by_key("ignore", no_vars())
        .await
        .unwrap();

    // Every outgoing flow is taken regardless of its condition.
    for node in ["r1", "r2", "r3"] {
        let count = engine
            .count_executions(
                &ExecutionQuery::new()
                    .process_instance_id(instance)
                    .node_id(node)
                    .only_active(),
            )
            .await
            .unwrap();
        assert_eq!(count, 1, "expected a token at {node}");
    }
}

#[tokio::test]
async fn zero_outgoing_node_ends_the_instance() {
    let listener = CollectingListener::new();
    let engine = ProcessEngine::builder()
        .add_listener(listener.clone())
        .build();
    let model = ProcessBuilder::new("dead-end")
        .start("start")
        .task("work")
        .flow("start", "work")
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let instance = engine
        .start_process_instance_by_key("dead-end", no_vars())
        .await
        .unwrap();
    assert_eq!(
        engine
            .count_executions(&ExecutionQuery::new().process_instance_id(instance))
            .await
            .unwrap(),
        0
    );
    assert_eq!(listener.process_completed_count(), 1);
}

#[tokio::test]
async fn exclusive_gateway_takes_first_match() {
    let engine = ProcessEngine::builder().build();
    let model = ProcessBuilder::new("route")
        .start("start")
        .exclusive_gateway("route")
        .receive_task("high")
        .receive_task("low")
        .flow("start", "route")
        .flow_if("route", "high", Condition::is_true("priority"))
        .flow("route", "low")
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let urgent = engine
        .start_process_instance_by_key("route", vars(&[("priority", Value::Bool(true))]))
        .await
        .unwrap();
    let routine = engine
        .start_process_instance_by_key("route", no_vars())
        .await
        .unwrap();

    let at = |instance, node: &str| {
        ExecutionQuery::new()
            .process_instance_id(instance)
            .node_id(node)
    };
    assert_eq!(engine.count_executions(&at(urgent, "high")).await.unwrap(), 1);
    assert_eq!(engine.count_executions(&at(urgent, "low")).await.unwrap(), 0);
    assert_eq!(engine.count_executions(&at(routine, "low")).await.unwrap(), 1);
}

#[tokio::test]
async fn exclusive_gateway_with_no_match_fails_the_command() {
    let engine = ProcessEngine::builder().build();
    let model = ProcessBuilder::new("stuck")
        .start("start")
        .exclusive_gateway("route")
        .receive_task("high")
        .flow("start", "route")
        .flow_if("route", "high", Condition::is_true("priority"))
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let err = engine
        .start_process_instance_by_key("stuck", no_vars())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoTransition { node } if node == "route"));

    // The whole unit of work rolled back: no half-started instance.
    assert_eq!(
        engine.count_executions(&ExecutionQuery::new()).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn async_continuation_parks_and_resumes() {
    let listener = CollectingListener::new();
    let counting = Arc::new(CountingDelegate::default());
    let engine = ProcessEngine::builder()
        .add_listener(listener.clone())
        .add_delegate("record", counting.clone())
        .build();
    let model = ProcessBuilder::new("async")
        .start("start")
        .service_task("work", "record")
        .end("done")
        .flow("start", "work")
        .flow("work", "done")
        .async_before("work")
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let instance = engine
        .start_process_instance_by_key("async", no_vars())
        .await
        .unwrap();

    // Parked before the behavior ran; a message job carries the continuation.
    assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    let job = engine
        .find_unique_job(&JobQuery::new().process_instance_id(instance))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.job_type, JobType::Message);
    assert!(job.is_executable(engine.clock().now()));

    engine.execute_job(job.id).await.unwrap();
    assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    assert_eq!(listener.process_completed_count(), 1);
    assert_eq!(engine.count_jobs(&JobQuery::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn timer_catch_is_clock_gated() {
    let clock = Arc::new(TestClock::new(chrono::Utc::now()));
    let listener = CollectingListener::new();
    let engine = ProcessEngine::builder()
        .with_clock(clock.clone())
        .add_listener(listener.clone())
        .build();
    let model = ProcessBuilder::new("timed")
        .start("start")
        .timer_catch("wait", 3_600_000)
        .end("done")
        .flow("start", "wait")
        .flow("wait", "done")
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    engine
        .start_process_instance_by_key("timed", no_vars())
        .await
        .unwrap();

    let executable = JobQuery::new().executable().job_type(JobType::Timer);
    assert_eq!(engine.count_jobs(&executable).await.unwrap(), 0);
    assert_eq!(
        engine
            .count_jobs(&JobQuery::new().job_type(JobType::Timer))
            .await
            .unwrap(),
        1
    );

    clock.advance(chrono::Duration::hours(1) + chrono::Duration::seconds(1));
    let job = engine.find_unique_job(&executable).await.unwrap().unwrap();
    engine.execute_job(job.id).await.unwrap();

    assert_eq!(listener.process_completed_count(), 1);
    assert_eq!(listener.timer_fired_count(), 1);
    assert_eq!(engine.count_jobs(&JobQuery::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn job_executor_loop_drives_async_work() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let listener = CollectingListener::new();
    let counting = Arc::new(CountingDelegate::default());
    let engine = ProcessEngine::builder()
        .add_listener(listener.clone())
        .add_delegate("record", counting.clone())
        .executor_config(JobExecutorConfig {
            poll_interval: StdDuration::from_millis(10),
            idle_poll_interval: StdDuration::from_millis(50),
            ..Default::default()
        })
        .build();
    let model = ProcessBuilder::new("bg")
        .start("start")
        .service_task("work", "record")
        .end("done")
        .flow("start", "work")
        .flow("work", "done")
        .async_before("work")
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    engine.start_job_executor();
    engine
        .start_process_instance_by_key("bg", no_vars())
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    while listener.process_completed_count() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    engine.stop_job_executor().await;

    assert_eq!(listener.process_completed_count(), 1);
    assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn business_error_routes_to_declared_boundary() {
    let listener = CollectingListener::new();
    let engine = ProcessEngine::builder()
        .add_listener(listener.clone())
        .add_delegate(
            "credit-check",
            Arc::new(BusinessFailingDelegate {
                code: "CREDIT".to_string(),
            }),
        )
        .build();
    let model = ProcessBuilder::new("boundary")
        .start("start")
        .service_task("check", "credit-check")
        .receive_task("manual")
        .end("done")
        .flow("start", "check")
        .flow("check", "done")
        .error_boundary("check", Some("CREDIT"), "manual")
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let instance = engine
        .start_process_instance_by_key("boundary", no_vars())
        .await
        .unwrap();

    let at_manual = engine
        .count_executions(
            &ExecutionQuery::new()
                .process_instance_id(instance)
                .node_id("manual")
                .only_active(),
        )
        .await
        .unwrap();
    assert_eq!(at_manual, 1);
    assert_eq!(
        listener.count(|e| matches!(e, EngineEvent::ErrorRouted { error_code, .. }
            if error_code.as_deref() == Some("CREDIT"))),
        1
    );
}

#[tokio::test]
async fn unhandled_failure_rolls_back_the_start() {
    let engine = ProcessEngine::builder()
        .add_delegate("explode", FailingDelegate::new("boom"))
        .build();
    let model = ProcessBuilder::new("fragile")
        .start("start")
        .service_task("check", "explode")
        .end("done")
        .flow("start", "check")
        .flow("check", "done")
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let err = engine
        .start_process_instance_by_key("fragile", no_vars())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Handler(_)));

    // Nothing persisted: no executions, no jobs.
    assert_eq!(
        engine.count_executions(&ExecutionQuery::new()).await.unwrap(),
        0
    );
    assert_eq!(engine.count_jobs(&JobQuery::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn deleting_an_instance_cancels_its_jobs() {
    let listener = CollectingListener::new();
    let engine = ProcessEngine::builder()
        .add_listener(listener.clone())
        .build();
    let model = ProcessBuilder::new("timed")
        .start("start")
        .timer_catch("wait", 3_600_000)
        .end("done")
        .flow("start", "wait")
        .flow("wait", "done")
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let instance = engine
        .start_process_instance_by_key("timed", no_vars())
        .await
        .unwrap();
    assert_eq!(engine.count_jobs(&JobQuery::new()).await.unwrap(), 1);

    engine
        .delete_process_instance(instance, "operator cleanup")
        .await
        .unwrap();

    // No orphaned timers survive the tree.
    assert_eq!(engine.count_jobs(&JobQuery::new()).await.unwrap(), 0);
    assert_eq!(
        engine
            .count_executions(&ExecutionQuery::new().process_instance_id(instance))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        listener.count(|e| matches!(e, EngineEvent::ProcessCancelled { reason, .. }
            if reason == "operator cleanup")),
        1
    );

    let err = engine
        .delete_process_instance(instance, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn interrupting_boundary_timer_moves_the_token() {
    let clock = Arc::new(TestClock::new(chrono::Utc::now()));
    let engine = ProcessEngine::builder().with_clock(clock.clone()).build();
    let model = ProcessBuilder::new("escalate")
        .start("start")
        .receive_task("wait")
        .receive_task("escalated")
        .end("done")
        .flow("start", "wait")
        .flow("wait", "done")
        .boundary_timer("wait", BoundaryTimer::interrupting("esc", 1_800_000, "escalated"))
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let instance = engine
        .start_process_instance_by_key("escalate", no_vars())
        .await
        .unwrap();
    let boundary_jobs = JobQuery::new().job_type(JobType::Boundary);
    assert_eq!(engine.count_jobs(&boundary_jobs).await.unwrap(), 1);

    clock.advance(chrono::Duration::minutes(31));
    let job = engine
        .find_unique_job(&boundary_jobs.clone().executable())
        .await
        .unwrap()
        .unwrap();
    engine.execute_job(job.id).await.unwrap();

    let at = |node: &str| {
        ExecutionQuery::new()
            .process_instance_id(instance)
            .node_id(node)
    };
    assert_eq!(engine.count_executions(&at("wait")).await.unwrap(), 0);
    assert_eq!(engine.count_executions(&at("escalated")).await.unwrap(), 1);
    assert_eq!(engine.count_jobs(&JobQuery::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn leaving_an_activity_cancels_its_boundary_timers() {
    let listener = CollectingListener::new();
    let engine = ProcessEngine::builder()
        .add_listener(listener.clone())
        .build();
    let model = ProcessBuilder::new("escalate")
        .start("start")
        .receive_task("wait")
        .receive_task("escalated")
        .end("done")
        .flow("start", "wait")
        .flow("wait", "done")
        .boundary_timer("wait", BoundaryTimer::interrupting("esc", 1_800_000, "escalated"))
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let instance = engine
        .start_process_instance_by_key("escalate", no_vars())
        .await
        .unwrap();
    let waiting = engine
        .find_unique_execution(
            &ExecutionQuery::new()
                .process_instance_id(instance)
                .node_id("wait"),
        )
        .await
        .unwrap()
        .unwrap();

    engine.signal(waiting.id).await.unwrap();

    assert_eq!(engine.count_jobs(&JobQuery::new()).await.unwrap(), 0);
    assert_eq!(listener.process_completed_count(), 1);
}

#[tokio::test]
async fn suspension_parks_jobs_out_of_the_executable_queue() {
    let clock = Arc::new(TestClock::new(chrono::Utc::now()));
    let engine = ProcessEngine::builder().with_clock(clock.clone()).build();
    let model = ProcessBuilder::new("timed")
        .start("start")
        .timer_catch("wait", 3_600_000)
        .end("done")
        .flow("start", "wait")
        .flow("wait", "done")
        .build()
        .unwrap();
    deploy(&engine, &model).await;

    let instance = engine
        .start_process_instance_by_key("timed", no_vars())
        .await
        .unwrap();
    clock.advance(chrono::Duration::hours(2));

    let executable = JobQuery::new().executable();
    assert_eq!(engine.count_jobs(&executable).await.unwrap(), 1);

    engine.suspend_process_instance(instance).await.unwrap();
    assert_eq!(engine.count_jobs(&executable).await.unwrap(), 0);

    engine.activate_process_instance(instance).await.unwrap();
    assert_eq!(engine.count_jobs(&executable).await.unwrap(), 1);
}
