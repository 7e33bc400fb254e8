pub mod compile;
pub mod loader;

pub use compile::Compiler;

use crate::dsl::{EventDefinition, EventKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Compiled, versioned process definition: a flat activity arena with
/// flow-scope parent pointers, produced by [`Compiler`]. This is the
/// activity-graph collaborator consumed by the interpreter and by the
/// migration planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessGraph {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub initial_variables: HashMap<String, Value>,
    /// Start event of the process scope.
    pub start: String,
    /// Event sub-processes attached directly to the process scope.
    pub root_attached: Vec<String>,
    activities: HashMap<String, ActivityNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityNode {
    pub id: String,
    pub kind: ActivityKind,
    /// Enclosing flow-scope activity; `None` means the process scope itself.
    pub parent: Option<String>,
    pub incoming: Vec<String>,
    pub outgoing: Vec<Flow>,
    /// Boundary events and event sub-processes hosted by this activity.
    pub attached: Vec<String>,
    /// For scopes: the activity their inner flow begins at.
    pub start_activity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub target: String,
    pub condition: Option<String>,
}

/// Closed set of executable node kinds. Interpreter and mutator match on
/// this exhaustively; adding a variant is a compile error at every site
/// that must handle it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActivityKind {
    Start,
    End,
    Task {
        handler: Option<String>,
        params: HashMap<String, Value>,
        output: Option<String>,
    },
    ParallelGateway {
        /// Paired fork gateway, resolved at compile time for joins.
        fork_id: Option<String>,
    },
    InclusiveGateway {
        fork_id: Option<String>,
    },
    SubProcess,
    MultiInstance {
        sequential: bool,
        cardinality: u32,
        completion_condition: Option<String>,
        body: String,
    },
    CallActivity {
        called_element: String,
        version: Option<u32>,
    },
    EventSubProcess {
        event: EventDefinition,
        interrupting: bool,
    },
    BoundaryEvent {
        event: EventDefinition,
        interrupting: bool,
        attached_to: String,
    },
}

impl ActivityNode {
    /// A scope owns a variable namespace and the lifetime of its event
    /// subscriptions and timers.
    pub fn is_scope(&self) -> bool {
        matches!(
            self.kind,
            ActivityKind::SubProcess
                | ActivityKind::MultiInstance { .. }
                | ActivityKind::EventSubProcess { .. }
        )
    }

    /// Gateway that waits for multiple incoming branches.
    pub fn is_synchronizing_gateway(&self) -> bool {
        matches!(
            self.kind,
            ActivityKind::ParallelGateway { .. } | ActivityKind::InclusiveGateway { .. }
        ) && self.incoming.len() > 1
    }

    pub fn fork_pair(&self) -> Option<&str> {
        match &self.kind {
            ActivityKind::ParallelGateway { fork_id } | ActivityKind::InclusiveGateway { fork_id } => {
                fork_id.as_deref()
            }
            _ => None,
        }
    }

    pub fn event(&self) -> Option<(&EventDefinition, bool)> {
        match &self.kind {
            ActivityKind::EventSubProcess { event, interrupting }
            | ActivityKind::BoundaryEvent { event, interrupting, .. } => Some((event, *interrupting)),
            _ => None,
        }
    }

    pub fn is_timer_event(&self) -> bool {
        self.event().map(|(e, _)| e.kind == EventKind::Timer).unwrap_or(false)
    }
}

impl ProcessGraph {
    pub fn activity(&self, id: &str) -> Option<&ActivityNode> {
        self.activities.get(id)
    }

    pub fn activities(&self) -> impl Iterator<Item = &ActivityNode> {
        self.activities.values()
    }

    /// Enclosing scope activities of `id`, outermost first. Does not
    /// include `id` itself.
    pub fn scope_chain(&self, id: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut cur = self.activities.get(id).and_then(|n| n.parent.clone());
        while let Some(p) = cur {
            cur = self.activities.get(&p).and_then(|n| n.parent.clone());
            chain.push(p);
        }
        chain.reverse();
        chain
    }

    /// Nearest common ancestor scope of two activities; `None` is the
    /// process scope.
    pub fn common_scope(&self, a: &str, b: &str) -> Option<String> {
        let ca = self.scope_chain(a);
        let cb = self.scope_chain(b);
        ca.iter().zip(cb.iter()).take_while(|(x, y)| x == y).last().map(|(x, _)| x.clone())
    }

    /// Nearest strictly-enclosing multi-instance wrapper.
    pub fn mi_boundary(&self, id: &str) -> Option<String> {
        let mut cur = self.activities.get(id).and_then(|n| n.parent.clone());
        while let Some(p) = cur {
            if matches!(self.activities.get(&p).map(|n| &n.kind), Some(ActivityKind::MultiInstance { .. })) {
                return Some(p);
            }
            cur = self.activities.get(&p).and_then(|n| n.parent.clone());
        }
        None
    }

    /// Whether `ancestor` strictly encloses `id`.
    pub fn encloses(&self, ancestor: &str, id: &str) -> bool {
        self.scope_chain(id).iter().any(|s| s == ancestor)
    }

    pub(crate) fn insert_activity(&mut self, node: ActivityNode) {
        self.activities.insert(node.id.clone(), node);
    }
}
