use procflow::dsl::builder::ProcessBuilder;
use procflow::dsl::{Activity, ActivityType, Edge};
use procflow::migration::MigrationError;
use procflow::runtime::engine::ProcessEngine;
use procflow::runtime::events::{LifecycleEvent, RecordingSink};
use std::collections::HashMap;
use std::sync::Arc;

fn simple_mi_process(sequential: bool, cardinality: u32) -> procflow::dsl::Process {
    ProcessBuilder::new("mi-proc")
        .start("start")
        .multi_instance("mi", sequential, cardinality, None, Activity::user_task("item"))
        .task("other")
        .task("after")
        .end("end")
        .connect("start", "mi")
        .connect("mi", "after")
        .connect("other", "end")
        .connect("after", "end")
        .build()
}

#[tokio::test]
async fn test_mi_root_move_cancels_all_iterations() {
    let sink = Arc::new(RecordingSink::new());
    let engine = ProcessEngine::new().with_sink(sink.clone());
    engine.register_process(simple_mi_process(false, 3)).expect("register failed");

    let instance = engine.start_process("mi-proc", HashMap::new()).await.expect("start failed");
    assert_eq!(engine.tasks(instance).await.unwrap().len(), 3);
    sink.take();

    engine
        .change_state(instance)
        .move_activity_to("mi", "other")
        .change_state()
        .await
        .expect("change state failed");

    let events = sink.take();
    let cancelled_items =
        events
            .iter()
            .filter(|e| {
                matches!(e, LifecycleEvent::ActivityCancelled { activity, .. } if activity == "item")
            })
            .count();
    assert_eq!(cancelled_items, 3, "every iteration cancelled");
    assert!(events.iter().any(
        |e| matches!(e, LifecycleEvent::ActivityCancelled { activity, .. } if activity == "mi")
    ));

    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(snap.executions.len(), 2, "process scope plus exactly one execution");
    assert_eq!(snap.active_activities(), vec!["other".to_string()]);
    assert!(snap.executions.iter().all(|e| !e.is_mi_root), "no residual loop bookkeeping");
}

#[tokio::test]
async fn test_iteration_cannot_leave_its_boundary() {
    let engine = ProcessEngine::new();
    engine.register_process(simple_mi_process(false, 2)).expect("register failed");
    let instance = engine.start_process("mi-proc", HashMap::new()).await.expect("start failed");

    let err = engine
        .change_state(instance)
        .move_activity_to("item", "other")
        .change_state()
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Structural(_)));
    assert!(err.to_string().contains("cannot leave multi-instance 'mi'"), "{}", err);
    assert_eq!(engine.tasks(instance).await.unwrap().len(), 2, "loop untouched");
}

fn nested_body() -> Activity {
    Activity {
        id: "iterBody".to_string(),
        kind: ActivityType::SubProcess {
            activities: vec![
                Activity { id: "bs".to_string(), kind: ActivityType::Start },
                Activity::user_task("taskA"),
                Activity::user_task("taskB"),
                Activity { id: "be".to_string(), kind: ActivityType::End },
            ],
            edges: vec![
                Edge { source: "bs".to_string(), target: "taskA".to_string(), condition: None },
                Edge { source: "taskA".to_string(), target: "taskB".to_string(), condition: None },
                Edge { source: "taskB".to_string(), target: "be".to_string(), condition: None },
            ],
        },
    }
}

#[tokio::test]
async fn test_intra_boundary_move_preserves_loop_counters() {
    let engine = ProcessEngine::new();
    engine
        .register_process(
            ProcessBuilder::new("nested-mi")
                .start("start")
                .multi_instance("mi", false, 2, None, nested_body())
                .task("after")
                .end("end")
                .connect("start", "mi")
                .connect("mi", "after")
                .connect("after", "end")
                .build(),
        )
        .expect("register failed");

    let instance = engine.start_process("nested-mi", HashMap::new()).await.expect("start failed");
    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(snap.active_activities(), vec!["taskA".to_string(), "taskA".to_string()]);

    // Both iterations jump ahead inside their own boundary; each keeps its
    // own iteration scope.
    engine
        .change_state(instance)
        .move_activity_to("taskA", "taskB")
        .change_state()
        .await
        .expect("change state failed");

    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(snap.active_activities(), vec!["taskB".to_string(), "taskB".to_string()]);
    let iteration_scopes = snap
        .executions
        .iter()
        .filter(|e| e.is_scope && e.activity.as_deref() == Some("iterBody"))
        .count();
    assert_eq!(iteration_scopes, 2, "iterations were not collapsed");

    // The preserved counters let the loop complete exactly like an
    // unmigrated one: the last iteration's completion finishes the loop.
    engine.complete_activity(instance, "taskB").await.unwrap();
    assert!(
        !engine.snapshot(instance).await.unwrap().active_activities().contains(&"after".to_string())
    );
    engine.complete_activity(instance, "taskB").await.unwrap();
    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(snap.active_activities(), vec!["after".to_string()]);
    assert!(snap.executions.iter().all(|e| !e.is_mi_root), "loop torn down after completion");
}

#[tokio::test]
async fn test_sequential_mi_migrated_iteration_completion() {
    let engine = ProcessEngine::new();
    engine.register_process(simple_mi_process(true, 2)).expect("register failed");
    let instance = engine.start_process("mi-proc", HashMap::new()).await.expect("start failed");

    // Move the live iteration onto itself's successor path is not
    // possible in a single-activity body, so complete the loop normally
    // after a no-op intra-boundary move of the iteration execution.
    let tasks = engine.tasks(instance).await.unwrap();
    assert_eq!(tasks.len(), 1);
    engine
        .change_state(instance)
        .move_execution_to(tasks[0].execution_id, "item")
        .change_state()
        .await
        .expect("change state failed");

    // First iteration completes, the second spawns with intact counters.
    engine.complete_activity(instance, "item").await.unwrap();
    assert_eq!(engine.tasks(instance).await.unwrap().len(), 1);

    engine.complete_activity(instance, "item").await.unwrap();
    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(snap.active_activities(), vec!["after".to_string()]);
}
