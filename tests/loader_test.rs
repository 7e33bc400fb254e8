use procflow::graph::Compiler;
use procflow::graph::loader::load_process_from_yaml;
use std::io::Write;

#[test]
fn test_load_process_from_yaml() {
    let yaml = r#"
id: yaml-proc
name: Yaml Process
activities:
  - id: start
    type: Start
  - id: work
    type: Task
  - id: end
    type: End
edges:
  - source: start
    target: work
  - source: work
    target: end
"#;
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(yaml.as_bytes()).expect("write yaml");

    let process = load_process_from_yaml(&file.path().to_string_lossy()).expect("load failed");
    assert_eq!(process.id, "yaml-proc");
    assert_eq!(process.name, "Yaml Process");
    assert_eq!(process.activities.len(), 3);

    let graph = Compiler::new().compile(process, 1).expect("Compilation failed");
    assert_eq!(graph.start, "start");
    assert!(graph.activity("work").is_some());
}

#[test]
fn test_load_with_variables_and_conditions() {
    let yaml = r#"
id: cond-proc
name: Conditional Process
variables:
  x: 5
activities:
  - id: start
    type: Start
  - id: split
    type: InclusiveGateway
  - id: big
    type: Task
  - id: small
    type: Task
  - id: end
    type: End
edges:
  - source: start
    target: split
  - source: split
    target: big
    condition: "x > 3"
  - source: split
    target: small
    condition: "x <= 3"
  - source: big
    target: end
  - source: small
    target: end
"#;
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(yaml.as_bytes()).expect("write yaml");

    let process = load_process_from_yaml(&file.path().to_string_lossy()).expect("load failed");
    assert_eq!(process.variables.get("x"), Some(&serde_json::json!(5)));
    let graph = Compiler::new().compile(process, 1).expect("Compilation failed");
    let split = graph.activity("split").expect("split");
    assert_eq!(split.outgoing.len(), 2);
    assert_eq!(split.outgoing[0].condition.as_deref(), Some("x > 3"));
}

#[test]
fn test_load_missing_file() {
    let err = load_process_from_yaml("/definitely/not/here.yaml").unwrap_err();
    assert!(err.to_string().contains("Failed to read YAML file"), "{}", err);
}
