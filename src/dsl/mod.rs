pub mod builder;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Authoring-level process definition, before compilation into a
/// [`crate::graph::ProcessGraph`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Process {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// A node of the authoring graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub id: String,
    #[serde(flatten)]
    pub kind: ActivityType,
}

/// Activity types available in the DSL.
///
/// Scoped variants (`SubProcess`, `EventSubProcess`, `MultiInstance`) carry
/// their own nested fragment; the compiler flattens everything into one
/// arena with parent pointers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ActivityType {
    Start,
    End,
    Task {
        /// Registered handler name. `None` marks a wait-state (user) task.
        #[serde(default)]
        handler: Option<String>,
        #[serde(default)]
        params: HashMap<String, Value>,
        /// Process variable receiving the handler result.
        #[serde(default)]
        output: Option<String>,
    },
    ParallelGateway,
    InclusiveGateway,
    SubProcess {
        activities: Vec<Activity>,
        #[serde(default)]
        edges: Vec<Edge>,
    },
    /// Looped wrapper spawning iteration executions over `body`.
    MultiInstance {
        sequential: bool,
        cardinality: u32,
        #[serde(default)]
        completion_condition: Option<String>,
        body: Box<Activity>,
    },
    CallActivity {
        called_element: String,
        #[serde(default)]
        version: Option<u32>,
    },
    /// Scope triggered by its start event rather than by sequence flow.
    EventSubProcess {
        event: EventDefinition,
        interrupting: bool,
        activities: Vec<Activity>,
        #[serde(default)]
        edges: Vec<Edge>,
    },
    BoundaryEvent {
        attached_to: String,
        event: EventDefinition,
        interrupting: bool,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    Signal,
    Message,
    Timer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventDefinition {
    pub kind: EventKind,
    /// Signal/message name. Unused for timers.
    #[serde(default)]
    pub name: Option<String>,
    /// Timer duration. Unused for signals/messages.
    #[serde(default)]
    pub due_ms: Option<u64>,
}

impl EventDefinition {
    pub fn signal(name: &str) -> Self {
        Self { kind: EventKind::Signal, name: Some(name.to_string()), due_ms: None }
    }

    pub fn message(name: &str) -> Self {
        Self { kind: EventKind::Message, name: Some(name.to_string()), due_ms: None }
    }

    pub fn timer(due_ms: u64) -> Self {
        Self { kind: EventKind::Timer, name: None, due_ms: Some(due_ms) }
    }
}

/// Sequence flow between two activities of the same scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<String>,
}

impl Activity {
    /// Wait-state task with no handler.
    pub fn user_task(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: ActivityType::Task { handler: None, params: HashMap::new(), output: None },
        }
    }
}
