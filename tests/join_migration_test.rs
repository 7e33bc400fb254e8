use procflow::dsl::builder::ProcessBuilder;
use procflow::runtime::engine::ProcessEngine;
use procflow::runtime::events::{LifecycleEvent, RecordingSink};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn fork_process(branches: &[&str]) -> procflow::dsl::Process {
    let mut builder = ProcessBuilder::new("forked").start("start").parallel_gateway("fork");
    for branch in branches {
        builder = builder.task(branch);
    }
    builder = builder
        .parallel_gateway("join")
        .task("taskAfter")
        .end("end")
        .connect("start", "fork")
        .connect("join", "taskAfter")
        .connect("taskAfter", "end");
    for branch in branches {
        builder = builder.connect("fork", branch).connect(branch, "join");
    }
    builder.build()
}

#[tokio::test]
async fn test_migrated_arrival_completes_parallel_join() {
    // Scenario B: one branch parked naturally, the other arrives by
    // migration; the join fires once and advances to taskAfter.
    let sink = Arc::new(RecordingSink::new());
    let engine = ProcessEngine::new().with_sink(sink.clone());
    engine.register_process(fork_process(&["task1", "task2"])).expect("register failed");

    let instance = engine.start_process("forked", HashMap::new()).await.expect("start failed");
    engine.complete_activity(instance, "task1").await.unwrap();

    let snap = engine.snapshot(instance).await.unwrap();
    let parked = snap
        .executions
        .iter()
        .filter(|e| e.activity.as_deref() == Some("join") && !e.active)
        .count();
    assert_eq!(parked, 1);
    sink.take();

    engine
        .change_state(instance)
        .move_activity_to("task2", "join")
        .change_state()
        .await
        .expect("change state failed");

    let events = sink.take();
    let shape: Vec<String> = events
        .iter()
        .map(|e| match e {
            LifecycleEvent::ActivityCancelled { activity, .. } => format!("cancel:{}", activity),
            LifecycleEvent::ActivityStarted { activity, .. } => format!("start:{}", activity),
            other => format!("{:?}", other),
        })
        .collect();
    assert_eq!(shape, vec!["cancel:task2".to_string(), "start:taskAfter".to_string()]);

    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(snap.active_activities(), vec!["taskAfter".to_string()]);
    assert_eq!(snap.executions.len(), 2, "single resulting execution under the process scope");
}

#[tokio::test]
async fn test_join_counter_with_partial_migration() {
    // For a fork with N=3 branches, migrating K=2 branches into the join
    // parks exactly 2 inactive executions and fires nothing; the third
    // arrival fires exactly one continuation.
    let engine = ProcessEngine::new();
    engine.register_process(fork_process(&["t1", "t2", "t3"])).expect("register failed");
    let instance = engine.start_process("forked", HashMap::new()).await.expect("start failed");

    engine
        .change_state(instance)
        .move_activity_to("t1", "join")
        .change_state()
        .await
        .expect("first move failed");
    let snap = engine.snapshot(instance).await.unwrap();
    let parked = snap
        .executions
        .iter()
        .filter(|e| e.activity.as_deref() == Some("join") && !e.active)
        .count();
    assert_eq!(parked, 1);
    assert!(!snap.active_activities().contains(&"taskAfter".to_string()));

    engine
        .change_state(instance)
        .move_activity_to("t2", "join")
        .change_state()
        .await
        .expect("second move failed");
    let snap = engine.snapshot(instance).await.unwrap();
    let parked = snap
        .executions
        .iter()
        .filter(|e| e.activity.as_deref() == Some("join") && !e.active)
        .count();
    assert_eq!(parked, 2, "two parked, zero continuations fired");
    assert_eq!(snap.active_activities(), vec!["t3".to_string()]);

    engine.complete_activity(instance, "t3").await.unwrap();
    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(snap.active_activities(), vec!["taskAfter".to_string()]);
    assert_eq!(
        snap.executions.iter().filter(|e| e.activity.as_deref() == Some("join")).count(),
        0,
        "all parked executions consumed by the single firing"
    );
}

#[tokio::test]
async fn test_migrating_both_branches_into_join() {
    let engine = ProcessEngine::new();
    engine.register_process(fork_process(&["task1", "task2"])).expect("register failed");
    let instance = engine.start_process("forked", HashMap::new()).await.expect("start failed");

    engine
        .change_state(instance)
        .move_activity_to("task1", "join")
        .move_activity_to("task2", "join")
        .change_state()
        .await
        .expect("change state failed");

    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(snap.active_activities(), vec!["taskAfter".to_string()]);
}

#[tokio::test]
async fn test_inclusive_join_ignores_foreign_arrival() {
    // A token that never belonged to the inclusive fork parks at the join
    // but does not count toward its expected arrivals.
    let engine = ProcessEngine::new();
    engine
        .register_process(
            ProcessBuilder::new("mixed")
                .start("start")
                .parallel_gateway("pg")
                .inclusive_gateway("split")
                .task("sideTask")
                .task("big")
                .task("huge")
                .inclusive_gateway("merge")
                .task("after")
                .end("end")
                .connect("start", "pg")
                .connect("pg", "split")
                .connect("pg", "sideTask")
                .connect_if("split", "big", "x > 3")
                .connect_if("split", "huge", "x > 100")
                .connect("big", "merge")
                .connect("huge", "merge")
                .connect("merge", "after")
                .connect("after", "end")
                .build(),
        )
        .expect("register failed");

    let instance = engine
        .start_process("mixed", HashMap::from([("x".to_string(), json!(5))]))
        .await
        .expect("start failed");
    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(snap.active_activities(), vec!["big".to_string(), "sideTask".to_string()]);

    engine
        .change_state(instance)
        .move_activity_to("sideTask", "merge")
        .change_state()
        .await
        .expect("change state failed");
    let snap = engine.snapshot(instance).await.unwrap();
    assert!(
        !snap.active_activities().contains(&"after".to_string()),
        "the foreign arrival must not complete the inclusive join"
    );

    // The branch that was actually activated still completes the join.
    engine.complete_activity(instance, "big").await.unwrap();
    let snap = engine.snapshot(instance).await.unwrap();
    assert!(snap.active_activities().contains(&"after".to_string()));
}
