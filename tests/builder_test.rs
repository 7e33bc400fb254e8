use procflow::dsl::builder::ProcessBuilder;
use procflow::dsl::{Activity, EventDefinition};
use procflow::graph::Compiler;

#[test]
fn test_compile_linear_process() {
    let process = ProcessBuilder::new("linear")
        .start("start")
        .task("work")
        .end("end")
        .connect("start", "work")
        .connect("work", "end")
        .build();

    let graph = Compiler::new().compile(process, 1).expect("Compilation failed");

    assert_eq!(graph.start, "start");
    assert_eq!(graph.version, 1);
    let work = graph.activity("work").expect("work activity");
    assert_eq!(work.outgoing.len(), 1);
    assert_eq!(work.outgoing[0].target, "end");
    assert!(work.parent.is_none());
    assert_eq!(graph.activity("end").unwrap().incoming, vec!["work".to_string()]);
}

#[test]
fn test_duplicate_activity_id_rejected() {
    let process = ProcessBuilder::new("dup")
        .start("start")
        .task("work")
        .task("work")
        .end("end")
        .connect("start", "work")
        .build();

    let err = Compiler::new().compile(process, 1).unwrap_err();
    assert!(err.to_string().contains("Duplicate activity id"), "{}", err);
}

#[test]
fn test_missing_start_rejected() {
    let process = ProcessBuilder::new("no-start").task("work").end("end").connect("work", "end").build();

    let err = Compiler::new().compile(process, 1).unwrap_err();
    assert!(err.to_string().contains("Start activity not found"), "{}", err);
}

#[test]
fn test_cross_scope_edge_rejected() {
    let process = ProcessBuilder::new("cross")
        .start("start")
        .sub_process("sp", |b| {
            b.start("s").task("inner").end("e").connect("s", "inner").connect("inner", "e")
        })
        .end("end")
        .connect("start", "inner")
        .connect("sp", "end")
        .build();

    let err = Compiler::new().compile(process, 1).unwrap_err();
    assert!(err.to_string().contains("crosses a scope boundary"), "{}", err);
}

#[test]
fn test_scope_containment() {
    let process = ProcessBuilder::new("scopes")
        .start("start")
        .task("outer")
        .sub_process("sp", |b| {
            b.start("s")
                .sub_process("nested", |b| b.start("ns").task("deep").end("ne").connect("ns", "deep").connect("deep", "ne"))
                .end("e")
                .connect("s", "nested")
                .connect("nested", "e")
        })
        .end("end")
        .connect("start", "outer")
        .connect("outer", "sp")
        .connect("sp", "end")
        .build();

    let graph = Compiler::new().compile(process, 1).expect("Compilation failed");

    assert_eq!(graph.scope_chain("deep"), vec!["sp".to_string(), "nested".to_string()]);
    assert_eq!(graph.scope_chain("outer"), Vec::<String>::new());
    assert_eq!(graph.common_scope("deep", "outer"), None);
    assert_eq!(graph.common_scope("deep", "nested"), Some("sp".to_string()));
    assert!(graph.encloses("sp", "deep"));
    assert!(!graph.encloses("nested", "outer"));
}

#[test]
fn test_fork_join_pairing() {
    let process = ProcessBuilder::new("parallel")
        .start("start")
        .parallel_gateway("fork")
        .task("t1")
        .task("t2")
        .parallel_gateway("join")
        .task("after")
        .end("end")
        .connect("start", "fork")
        .connect("fork", "t1")
        .connect("fork", "t2")
        .connect("t1", "join")
        .connect("t2", "join")
        .connect("join", "after")
        .connect("after", "end")
        .build();

    let graph = Compiler::new().compile(process, 1).expect("Compilation failed");

    let join = graph.activity("join").expect("join");
    assert!(join.is_synchronizing_gateway());
    assert_eq!(join.fork_pair(), Some("fork"));
    let fork = graph.activity("fork").expect("fork");
    assert!(!fork.is_synchronizing_gateway());
}

#[test]
fn test_multi_instance_body() {
    let process = ProcessBuilder::new("mi-proc")
        .start("start")
        .multi_instance("mi", true, 3, Some("nrOfCompletedInstances >= 2"), Activity::user_task("item"))
        .end("end")
        .connect("start", "mi")
        .connect("mi", "end")
        .build();

    let graph = Compiler::new().compile(process, 1).expect("Compilation failed");

    assert_eq!(graph.mi_boundary("item"), Some("mi".to_string()));
    assert_eq!(graph.activity("mi").unwrap().start_activity.as_deref(), Some("item"));
    assert!(graph.activity("mi").unwrap().is_scope());
}

#[test]
fn test_boundary_event_host_validation() {
    let process = ProcessBuilder::new("bad-boundary")
        .start("start")
        .task("work")
        .boundary_event("b", "missing", EventDefinition::signal("sig"), true)
        .end("end")
        .connect("start", "work")
        .connect("work", "end")
        .build();

    let err = Compiler::new().compile(process, 1).unwrap_err();
    assert!(err.to_string().contains("unknown activity"), "{}", err);
}

#[test]
fn test_event_sub_process_attachment() {
    let process = ProcessBuilder::new("esp-proc")
        .start("start")
        .task("work")
        .event_sub_process("esp", EventDefinition::signal("alarm"), false, |b| {
            b.start("es").task("handle").end("ee").connect("es", "handle").connect("handle", "ee")
        })
        .end("end")
        .connect("start", "work")
        .connect("work", "end")
        .build();

    let graph = Compiler::new().compile(process, 1).expect("Compilation failed");

    assert_eq!(graph.root_attached, vec!["esp".to_string()]);
    assert_eq!(graph.activity("esp").unwrap().start_activity.as_deref(), Some("es"));
    assert_eq!(graph.scope_chain("handle"), vec!["esp".to_string()]);
}
