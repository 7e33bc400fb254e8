use procflow::dsl::EventDefinition;
use procflow::dsl::builder::ProcessBuilder;
use procflow::runtime::engine::ProcessEngine;
use procflow::runtime::events::{LifecycleEvent, RecordingSink};
use std::collections::HashMap;
use std::sync::Arc;

fn signal_esp_process(interrupting: bool) -> procflow::dsl::Process {
    ProcessBuilder::new("esp-proc")
        .start("start")
        .task("processTask")
        .task("otherTask")
        .event_sub_process("eventSub", EventDefinition::signal("go"), interrupting, |b| {
            b.start("es").task("eventTask").end("ee").connect("es", "eventTask").connect("eventTask", "ee")
        })
        .end("end")
        .connect("start", "processTask")
        .connect("processTask", "end")
        .connect("otherTask", "end")
        .build()
}

#[tokio::test]
async fn test_sole_sibling_move_into_event_sub_process_drops_subscription() {
    // Scenario C: the event sub-process is non-interrupting, yet moving
    // the only sibling execution into it leaves zero subscriptions; there
    // is no context left to run alongside.
    let engine = ProcessEngine::new();
    engine.register_process(signal_esp_process(false)).expect("register failed");

    let instance = engine.start_process("esp-proc", HashMap::new()).await.expect("start failed");
    assert_eq!(
        engine.snapshot(instance).await.unwrap().subscription_keys(),
        vec![("eventSub".to_string(), "go".to_string())]
    );

    engine
        .change_state(instance)
        .move_activity_to("processTask", "eventTask")
        .change_state()
        .await
        .expect("change state failed");

    let snap = engine.snapshot(instance).await.unwrap();
    assert!(snap.subscription_keys().is_empty(), "subscription removed despite non-interrupting flag");
    assert_eq!(snap.active_activities(), vec!["eventTask".to_string()]);
    assert!(engine.subscriptions(instance).await.unwrap().is_empty(), "store projection agrees");
}

#[tokio::test]
async fn test_same_scope_move_keeps_subscription() {
    let engine = ProcessEngine::new();
    engine.register_process(signal_esp_process(false)).expect("register failed");

    let instance = engine.start_process("esp-proc", HashMap::new()).await.expect("start failed");

    engine
        .change_state(instance)
        .move_activity_to("processTask", "otherTask")
        .change_state()
        .await
        .expect("change state failed");

    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(
        snap.subscription_keys(),
        vec![("eventSub".to_string(), "go".to_string())],
        "an active sibling remains in the scope, the subscription stays"
    );
    assert_eq!(snap.active_activities(), vec!["otherTask".to_string()]);
}

#[tokio::test]
async fn test_interrupting_flag_does_not_matter_for_sole_sibling() {
    let engine = ProcessEngine::new();
    engine.register_process(signal_esp_process(true)).expect("register failed");

    let instance = engine.start_process("esp-proc", HashMap::new()).await.expect("start failed");

    engine
        .change_state(instance)
        .move_activity_to("processTask", "eventTask")
        .change_state()
        .await
        .expect("change state failed");

    assert!(engine.snapshot(instance).await.unwrap().subscription_keys().is_empty());
}

#[tokio::test]
async fn test_fired_non_interrupting_instance_survives_unrelated_move() {
    let engine = ProcessEngine::new();
    engine.register_process(signal_esp_process(false)).expect("register failed");

    let instance = engine.start_process("esp-proc", HashMap::new()).await.expect("start failed");
    engine.send_signal(instance, "go").await.unwrap();

    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(snap.active_activities(), vec!["eventTask".to_string(), "processTask".to_string()]);

    // An unrelated move elsewhere in the scope touches neither the fired
    // instance nor the still-armed subscription.
    engine
        .change_state(instance)
        .move_activity_to("processTask", "otherTask")
        .change_state()
        .await
        .expect("change state failed");

    let snap = engine.snapshot(instance).await.unwrap();
    assert_eq!(snap.active_activities(), vec!["eventTask".to_string(), "otherTask".to_string()]);
    assert_eq!(snap.subscription_keys(), vec![("eventSub".to_string(), "go".to_string())]);
}

#[tokio::test]
async fn test_timer_event_sub_process_job_pruned_with_job_canceled() {
    let sink = Arc::new(RecordingSink::new());
    let engine = ProcessEngine::new().with_sink(sink.clone());
    engine
        .register_process(
            ProcessBuilder::new("timer-esp")
                .start("start")
                .task("processTask")
                .event_sub_process("lateSub", EventDefinition::timer(60_000), false, |b| {
                    b.start("ls").task("lateTask").end("le").connect("ls", "lateTask").connect("lateTask", "le")
                })
                .end("end")
                .connect("start", "processTask")
                .connect("processTask", "end")
                .build(),
        )
        .expect("register failed");

    let instance = engine.start_process("timer-esp", HashMap::new()).await.expect("start failed");
    assert_eq!(engine.jobs(instance).await.unwrap().len(), 1);
    sink.take();

    engine
        .change_state(instance)
        .move_activity_to("processTask", "lateTask")
        .change_state()
        .await
        .expect("change state failed");

    assert!(engine.jobs(instance).await.unwrap().is_empty());
    let snap = engine.snapshot(instance).await.unwrap();
    assert!(snap.job_keys().is_empty());

    let events = sink.take();
    assert!(
        events.iter().any(
            |e| matches!(e, LifecycleEvent::JobCanceled { activity, .. } if activity == "lateSub")
        ),
        "{:?}",
        events
    );
}

#[tokio::test]
async fn test_boundary_subscription_moves_with_its_host() {
    let engine = ProcessEngine::new();
    engine
        .register_process(
            ProcessBuilder::new("boundary-proc")
                .start("start")
                .task("guarded")
                .boundary_event("alert", "guarded", EventDefinition::signal("stop"), false)
                .task("elsewhere")
                .end("end")
                .connect("start", "guarded")
                .connect("guarded", "end")
                .connect("alert", "end")
                .connect("elsewhere", "end")
                .build(),
        )
        .expect("register failed");

    let instance = engine.start_process("boundary-proc", HashMap::new()).await.expect("start failed");
    assert_eq!(engine.subscriptions(instance).await.unwrap().len(), 1);

    engine
        .change_state(instance)
        .move_activity_to("guarded", "elsewhere")
        .change_state()
        .await
        .expect("change state failed");

    assert!(
        engine.subscriptions(instance).await.unwrap().is_empty(),
        "boundary subscription owned by the moved execution is gone"
    );

    // Moving back re-arms it, reproducing what the interpreter would have
    // created.
    engine
        .change_state(instance)
        .move_activity_to("elsewhere", "guarded")
        .change_state()
        .await
        .expect("move back failed");
    assert_eq!(engine.subscriptions(instance).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_scope_start_then_timer_scheduled_ordering() {
    let sink = Arc::new(RecordingSink::new());
    let engine = ProcessEngine::new().with_sink(sink.clone());
    engine
        .register_process(
            ProcessBuilder::new("scoped-timer")
                .start("start")
                .task("a")
                .sub_process("sp", |b| {
                    b.start("s").task("inner").end("e").connect("s", "inner").connect("inner", "e")
                })
                .boundary_event("spTimer", "sp", EventDefinition::timer(30_000), true)
                .task("recovery")
                .end("end")
                .connect("start", "a")
                .connect("a", "sp")
                .connect("sp", "end")
                .connect("spTimer", "recovery")
                .connect("recovery", "end")
                .build(),
        )
        .expect("register failed");

    let instance = engine.start_process("scoped-timer", HashMap::new()).await.expect("start failed");
    sink.take();

    engine
        .change_state(instance)
        .move_activity_to("a", "inner")
        .change_state()
        .await
        .expect("change state failed");

    let events = sink.take();
    let shape: Vec<String> = events
        .iter()
        .map(|e| match e {
            LifecycleEvent::ActivityCancelled { activity, .. } => format!("cancel:{}", activity),
            LifecycleEvent::ActivityStarted { activity, .. } => format!("start:{}", activity),
            LifecycleEvent::TimerScheduled { activity, .. } => format!("timer:{}", activity),
            other => format!("{:?}", other),
        })
        .collect();
    assert_eq!(
        shape,
        vec![
            "cancel:a".to_string(),
            "start:sp".to_string(),
            "timer:spTimer".to_string(),
            "start:inner".to_string(),
        ],
        "TIMER_SCHEDULED follows the start of the scope that owns it"
    );
}
