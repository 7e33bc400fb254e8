use crate::dsl::{Activity, ActivityType, Edge, EventDefinition, Process};
use serde_json::Value;
use std::collections::HashMap;

/// Chainable authoring API for [`Process`] definitions.
///
/// Nested scopes are built with closures receiving a fresh builder for the
/// inner fragment; only the fragment's activities and edges are kept.
pub struct ProcessBuilder {
    id: String,
    name: String,
    variables: HashMap<String, Value>,
    pub activities: Vec<Activity>, // Made public for manual manipulation in tests if needed
    edges: Vec<Edge>,
}

impl ProcessBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            variables: HashMap::new(),
            activities: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn var(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }

    pub fn start(mut self, id: &str) -> Self {
        self.activities.push(Activity { id: id.to_string(), kind: ActivityType::Start });
        self
    }

    pub fn end(mut self, id: &str) -> Self {
        self.activities.push(Activity { id: id.to_string(), kind: ActivityType::End });
        self
    }

    /// Wait-state task: the token stays until `complete_task` is called.
    pub fn task(mut self, id: &str) -> Self {
        self.activities.push(Activity::user_task(id));
        self
    }

    /// Automatic task executed by a registered handler.
    pub fn service(self, id: &str, handler: &str) -> ServiceBuilder {
        ServiceBuilder {
            process_builder: self,
            id: id.to_string(),
            handler: handler.to_string(),
            params: HashMap::new(),
            output: None,
        }
    }

    pub fn parallel_gateway(mut self, id: &str) -> Self {
        self.activities.push(Activity { id: id.to_string(), kind: ActivityType::ParallelGateway });
        self
    }

    pub fn inclusive_gateway(mut self, id: &str) -> Self {
        self.activities.push(Activity { id: id.to_string(), kind: ActivityType::InclusiveGateway });
        self
    }

    pub fn sub_process(mut self, id: &str, f: impl FnOnce(ProcessBuilder) -> ProcessBuilder) -> Self {
        let inner = f(ProcessBuilder::new(id));
        self.activities.push(Activity {
            id: id.to_string(),
            kind: ActivityType::SubProcess { activities: inner.activities, edges: inner.edges },
        });
        self
    }

    pub fn event_sub_process(
        mut self,
        id: &str,
        event: EventDefinition,
        interrupting: bool,
        f: impl FnOnce(ProcessBuilder) -> ProcessBuilder,
    ) -> Self {
        let inner = f(ProcessBuilder::new(id));
        self.activities.push(Activity {
            id: id.to_string(),
            kind: ActivityType::EventSubProcess {
                event,
                interrupting,
                activities: inner.activities,
                edges: inner.edges,
            },
        });
        self
    }

    pub fn multi_instance(
        mut self,
        id: &str,
        sequential: bool,
        cardinality: u32,
        completion_condition: Option<&str>,
        body: Activity,
    ) -> Self {
        self.activities.push(Activity {
            id: id.to_string(),
            kind: ActivityType::MultiInstance {
                sequential,
                cardinality,
                completion_condition: completion_condition.map(|c| c.to_string()),
                body: Box::new(body),
            },
        });
        self
    }

    pub fn call_activity(mut self, id: &str, called_element: &str, version: Option<u32>) -> Self {
        self.activities.push(Activity {
            id: id.to_string(),
            kind: ActivityType::CallActivity { called_element: called_element.to_string(), version },
        });
        self
    }

    pub fn boundary_event(
        mut self,
        id: &str,
        attached_to: &str,
        event: EventDefinition,
        interrupting: bool,
    ) -> Self {
        self.activities.push(Activity {
            id: id.to_string(),
            kind: ActivityType::BoundaryEvent { attached_to: attached_to.to_string(), event, interrupting },
        });
        self
    }

    pub fn connect(mut self, source: &str, target: &str) -> Self {
        self.edges.push(Edge { source: source.to_string(), target: target.to_string(), condition: None });
        self
    }

    /// Conditional sequence flow, evaluated by inclusive gateways.
    pub fn connect_if(mut self, source: &str, target: &str, condition: &str) -> Self {
        self.edges.push(Edge {
            source: source.to_string(),
            target: target.to_string(),
            condition: Some(condition.to_string()),
        });
        self
    }

    pub fn build(self) -> Process {
        Process {
            id: self.id,
            name: self.name,
            variables: self.variables,
            activities: self.activities,
            edges: self.edges,
        }
    }
}

pub struct ServiceBuilder {
    process_builder: ProcessBuilder,
    id: String,
    handler: String,
    params: HashMap<String, Value>,
    output: Option<String>,
}

impl ServiceBuilder {
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn output(mut self, var: &str) -> Self {
        self.output = Some(var.to_string());
        self
    }

    pub fn build(mut self) -> ProcessBuilder {
        self.process_builder.activities.push(Activity {
            id: self.id,
            kind: ActivityType::Task {
                handler: Some(self.handler),
                params: self.params,
                output: self.output,
            },
        });
        self.process_builder
    }
}
