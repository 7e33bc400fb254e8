use procflow::dsl::builder::ProcessBuilder;
use procflow::dsl::EventDefinition;
use procflow::migration::MigrationError;
use procflow::runtime::engine::ProcessEngine;
use procflow::runtime::events::{LifecycleEvent, RecordingSink};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn two_task_process() -> procflow::dsl::Process {
    ProcessBuilder::new("two-tasks")
        .start("start")
        .task("firstTask")
        .task("secondTask")
        .end("end")
        .connect("start", "firstTask")
        .connect("firstTask", "secondTask")
        .connect("secondTask", "end")
        .build()
}

#[tokio::test]
async fn test_move_back_to_completed_task() {
    // Scenario A: after completing firstTask, moving secondTask back must
    // leave exactly one task at firstTask and emit exactly
    // ACTIVITY_CANCELLED(secondTask) then ACTIVITY_STARTED(firstTask).
    let sink = Arc::new(RecordingSink::new());
    let engine = ProcessEngine::new().with_sink(sink.clone());
    engine.register_process(two_task_process()).expect("register failed");

    let instance = engine.start_process("two-tasks", HashMap::new()).await.expect("start failed");
    engine.complete_activity(instance, "firstTask").await.unwrap();
    sink.take();

    engine
        .change_state(instance)
        .move_activity_to("secondTask", "firstTask")
        .change_state()
        .await
        .expect("change state failed");

    let events = sink.take();
    assert_eq!(events.len(), 2, "exactly two events, got {:?}", events);
    assert!(
        matches!(&events[0], LifecycleEvent::ActivityCancelled { activity, .. } if activity == "secondTask")
    );
    assert!(
        matches!(&events[1], LifecycleEvent::ActivityStarted { activity, .. } if activity == "firstTask")
    );

    let tasks = engine.tasks(instance).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].activity_id, "firstTask");
}

#[tokio::test]
async fn test_inverse_round_trip_restores_structure() {
    let engine = ProcessEngine::new();
    engine
        .register_process(
            ProcessBuilder::new("round-trip")
                .start("start")
                .task("outerTask")
                .boundary_event("guard", "outerTask", EventDefinition::signal("halt"), true)
                .sub_process("sp", |b| {
                    b.start("s").task("innerTask").end("e").connect("s", "innerTask").connect("innerTask", "e")
                })
                .end("end")
                .connect("start", "outerTask")
                .connect("outerTask", "sp")
                .connect("sp", "end")
                .connect("guard", "end")
                .build(),
        )
        .expect("register failed");

    let instance = engine.start_process("round-trip", HashMap::new()).await.expect("start failed");
    let before = engine.snapshot(instance).await.unwrap();
    assert_eq!(before.subscription_keys(), vec![("guard".to_string(), "halt".to_string())]);

    engine
        .change_state(instance)
        .move_activity_to("outerTask", "innerTask")
        .change_state()
        .await
        .expect("first move failed");
    let moved = engine.snapshot(instance).await.unwrap();
    assert_eq!(moved.active_activities(), vec!["innerTask".to_string()]);
    assert!(moved.subscription_keys().is_empty(), "boundary subscription went with its host");

    engine
        .change_state(instance)
        .move_activity_to("innerTask", "outerTask")
        .change_state()
        .await
        .expect("second move failed");
    let after = engine.snapshot(instance).await.unwrap();

    assert_eq!(after.structure(), before.structure());
    assert_eq!(after.subscription_keys(), before.subscription_keys());
    assert_eq!(after.job_keys(), before.job_keys());
}

#[tokio::test]
async fn test_fan_out_fan_in_closure() {
    let engine = ProcessEngine::new();
    engine
        .register_process(
            ProcessBuilder::new("fan")
                .start("start")
                .task("a")
                .task("x")
                .task("y")
                .end("end")
                .connect("start", "a")
                .connect("a", "end")
                .connect("x", "end")
                .connect("y", "end")
                .build(),
        )
        .expect("register failed");

    let instance = engine.start_process("fan", HashMap::new()).await.expect("start failed");

    engine
        .change_state(instance)
        .move_activity_to_all("a", &["x", "y"])
        .change_state()
        .await
        .expect("fan-out failed");
    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(snap.active_activities(), vec!["x".to_string(), "y".to_string()]);

    engine
        .change_state(instance)
        .move_activities_to(&["x", "y"], "a")
        .change_state()
        .await
        .expect("fan-in failed");
    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(snap.active_activities(), vec!["a".to_string()]);
    assert_eq!(snap.executions.len(), 2, "process scope plus exactly one execution at a");
}

#[tokio::test]
async fn test_variable_only_request() {
    let sink = Arc::new(RecordingSink::new());
    let engine = ProcessEngine::new().with_sink(sink.clone());
    engine.register_process(two_task_process()).expect("register failed");

    let instance = engine.start_process("two-tasks", HashMap::new()).await.expect("start failed");
    sink.take();

    engine
        .change_state(instance)
        .process_variable("approved", true)
        .process_variable("limit", 250)
        .change_state()
        .await
        .expect("change state failed");

    assert_eq!(engine.get_variable(instance, "approved").await.unwrap(), Some(json!(true)));
    assert_eq!(engine.get_variable(instance, "limit").await.unwrap(), Some(json!(250)));
    let events = sink.take();
    let names: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            LifecycleEvent::VariableCreated { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["approved".to_string(), "limit".to_string()], "insertion order");
}

#[tokio::test]
async fn test_event_ordering_contract() {
    // Globals first, then the cancel phase, then per created scope its
    // variables immediately followed by its start, then the leaf.
    let sink = Arc::new(RecordingSink::new());
    let engine = ProcessEngine::new().with_sink(sink.clone());
    engine
        .register_process(
            ProcessBuilder::new("ordered")
                .start("start")
                .task("a")
                .sub_process("sp", |b| {
                    b.start("s").task("inner").end("e").connect("s", "inner").connect("inner", "e")
                })
                .end("end")
                .connect("start", "a")
                .connect("a", "sp")
                .connect("sp", "end")
                .build(),
        )
        .expect("register failed");

    let instance = engine.start_process("ordered", HashMap::new()).await.expect("start failed");
    sink.take();

    engine
        .change_state(instance)
        .move_activity_to("a", "inner")
        .process_variable("pv", 1)
        .local_variable("sp", "lv", 2)
        .change_state()
        .await
        .expect("change state failed");

    let events = sink.take();
    let shape: Vec<String> = events
        .iter()
        .map(|e| match e {
            LifecycleEvent::VariableCreated { name, .. } => format!("var:{}", name),
            LifecycleEvent::ActivityCancelled { activity, .. } => format!("cancel:{}", activity),
            LifecycleEvent::ActivityStarted { activity, .. } => format!("start:{}", activity),
            other => format!("{:?}", other),
        })
        .collect();
    assert_eq!(
        shape,
        vec![
            "var:pv".to_string(),
            "cancel:a".to_string(),
            "var:lv".to_string(),
            "start:sp".to_string(),
            "start:inner".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_unknown_target_is_structural_error() {
    let engine = ProcessEngine::new();
    engine.register_process(two_task_process()).expect("register failed");
    let instance = engine.start_process("two-tasks", HashMap::new()).await.expect("start failed");

    let err = engine
        .change_state(instance)
        .move_activity_to("firstTask", "nowhere")
        .change_state()
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Structural(_)));
    assert!(err.to_string().contains("not found in definition version 1"), "{}", err);

    // Nothing moved.
    let tasks = engine.tasks(instance).await.unwrap();
    assert_eq!(tasks[0].activity_id, "firstTask");
}

#[tokio::test]
async fn test_unoccupied_source_is_structural_error() {
    let engine = ProcessEngine::new();
    engine.register_process(two_task_process()).expect("register failed");
    let instance = engine.start_process("two-tasks", HashMap::new()).await.expect("start failed");

    let err = engine
        .change_state(instance)
        .move_activity_to("secondTask", "firstTask")
        .change_state()
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Structural(_)));
    assert!(err.to_string().contains("Active execution for activity 'secondTask' not found"), "{}", err);
}

#[tokio::test]
async fn test_failed_request_leaves_tree_untouched() {
    let engine = ProcessEngine::new();
    engine.register_process(two_task_process()).expect("register failed");
    let instance = engine.start_process("two-tasks", HashMap::new()).await.expect("start failed");
    let before = engine.snapshot(instance).await.unwrap();

    // Second operation of the same request is invalid; the first must not
    // have been applied either.
    let err = engine
        .change_state(instance)
        .move_activity_to("firstTask", "secondTask")
        .move_activity_to("firstTask", "nowhere")
        .change_state()
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Structural(_)));

    let after = engine.snapshot(instance).await.unwrap();
    assert_eq!(after.structure(), before.structure());
}

#[tokio::test]
async fn test_move_into_sub_process_creates_scope() {
    let engine = ProcessEngine::new();
    engine
        .register_process(
            ProcessBuilder::new("into-scope")
                .start("start")
                .task("a")
                .sub_process("sp", |b| {
                    b.start("s")
                        .task("in1")
                        .task("in2")
                        .end("e")
                        .connect("s", "in1")
                        .connect("in1", "in2")
                        .connect("in2", "e")
                })
                .end("end")
                .connect("start", "a")
                .connect("a", "sp")
                .connect("sp", "end")
                .build(),
        )
        .expect("register failed");

    let instance = engine.start_process("into-scope", HashMap::new()).await.expect("start failed");

    engine
        .change_state(instance)
        .move_activity_to("a", "in2")
        .change_state()
        .await
        .expect("change state failed");

    let snap = engine.snapshot(instance).await.unwrap();
    assert!(snap.executions.iter().any(|e| e.is_scope && e.activity.as_deref() == Some("sp")));
    assert_eq!(snap.active_activities(), vec!["in2".to_string()]);

    // Completing the moved task drives the rest of the scope normally.
    engine.complete_activity(instance, "in2").await.unwrap();
    assert!(!engine.instance_exists(instance));
}

#[tokio::test]
async fn test_move_out_of_sub_process_tears_scope_down() {
    let engine = ProcessEngine::new();
    engine
        .register_process(
            ProcessBuilder::new("out-of-scope")
                .start("start")
                .sub_process("sp", |b| {
                    b.start("s").task("inner").end("e").connect("s", "inner").connect("inner", "e")
                })
                .task("outer")
                .end("end")
                .connect("start", "sp")
                .connect("sp", "outer")
                .connect("outer", "end")
                .build(),
        )
        .expect("register failed");

    let instance = engine.start_process("out-of-scope", HashMap::new()).await.expect("start failed");

    engine
        .change_state(instance)
        .move_activity_to("inner", "outer")
        .change_state()
        .await
        .expect("change state failed");

    let snap = engine.snapshot(instance).await.unwrap();
    assert!(snap.executions.iter().all(|e| e.activity.as_deref() != Some("sp")), "empty scope removed");
    assert_eq!(snap.active_activities(), vec!["outer".to_string()]);
}
