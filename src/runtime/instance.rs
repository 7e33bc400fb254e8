use crate::runtime::storage::{EventSubscription, TimerJob};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// One live token position in the execution tree.
///
/// An inactive-but-present execution is a parked, partially-synchronized
/// branch (waiting at a join or on a called instance), not a completed one.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: ExecutionId,
    pub parent: Option<ExecutionId>,
    pub children: Vec<ExecutionId>,
    pub activity: Option<String>,
    pub active: bool,
    pub is_scope: bool,
    pub is_mi_root: bool,
    /// Local variable namespace. Only meaningful on scope executions; the
    /// root execution holds the process variables.
    pub variables: HashMap<String, Value>,
    /// Fork gateway this token descends from, if any. Tracks branch
    /// lineage across jumps and migrations for join accounting.
    pub fork_origin: Option<String>,
}

/// Branch accounting recorded per scope when a gateway forks.
#[derive(Debug, Clone, Default)]
pub struct ForkInstance {
    pub expected: u32,
    pub completed: u32,
    /// Lineage the forking token itself carried, restored on the join
    /// continuation so nested forks keep counting.
    pub outer_origin: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CallActivityLink {
    pub parent_instance: Uuid,
    pub parent_execution: ExecutionId,
}

/// Root aggregate: the execution tree plus everything whose lifetime is
/// bound to it (subscriptions, timer jobs, fork counters, call-activity
/// links). It is `Clone` so an operation can work on a copy and swap it in
/// only on success.
#[derive(Debug, Clone)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub definition_id: String,
    pub definition_version: u32,
    pub root: ExecutionId,
    executions: HashMap<ExecutionId, Execution>,
    /// Keyed by (owning scope execution, fork gateway activity).
    pub forks: HashMap<(ExecutionId, String), ForkInstance>,
    pub subscriptions: Vec<EventSubscription>,
    pub jobs: Vec<TimerJob>,
    pub parent_link: Option<CallActivityLink>,
    /// Call-activity execution -> child process instance.
    pub child_instances: HashMap<ExecutionId, Uuid>,
    pub completed: bool,
}

impl ProcessInstance {
    pub fn new(definition_id: &str, definition_version: u32, parent_link: Option<CallActivityLink>) -> Self {
        let root_id = Uuid::new_v4();
        let root = Execution {
            id: root_id,
            parent: None,
            children: Vec::new(),
            activity: None,
            active: true,
            is_scope: true,
            is_mi_root: false,
            variables: HashMap::new(),
            fork_origin: None,
        };
        let mut executions = HashMap::new();
        executions.insert(root_id, root);
        Self {
            id: Uuid::new_v4(),
            definition_id: definition_id.to_string(),
            definition_version,
            root: root_id,
            executions,
            forks: HashMap::new(),
            subscriptions: Vec::new(),
            jobs: Vec::new(),
            parent_link,
            child_instances: HashMap::new(),
            completed: false,
        }
    }

    pub fn get(&self, id: ExecutionId) -> Option<&Execution> {
        self.executions.get(&id)
    }

    pub fn get_mut(&mut self, id: ExecutionId) -> Option<&mut Execution> {
        self.executions.get_mut(&id)
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.executions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn create_execution(
        &mut self,
        parent: ExecutionId,
        activity: Option<String>,
        is_scope: bool,
        active: bool,
        fork_origin: Option<String>,
    ) -> ExecutionId {
        let id = Uuid::new_v4();
        let execution = Execution {
            id,
            parent: Some(parent),
            children: Vec::new(),
            activity,
            active,
            is_scope,
            is_mi_root: false,
            variables: HashMap::new(),
            fork_origin,
        };
        self.executions.insert(id, execution);
        if let Some(p) = self.executions.get_mut(&parent) {
            p.children.push(id);
        }
        id
    }

    /// Removes a single execution, detaching it from its parent. The
    /// caller is responsible for its descendants.
    pub fn detach_remove(&mut self, id: ExecutionId) -> Option<Execution> {
        let execution = self.executions.remove(&id)?;
        if let Some(parent) = execution.parent
            && let Some(p) = self.executions.get_mut(&parent)
        {
            p.children.retain(|c| *c != id);
        }
        Some(execution)
    }

    /// Pre-order walk of the whole tree. Child order is creation order, so
    /// iteration is deterministic.
    pub fn dfs(&self) -> Vec<ExecutionId> {
        let mut out = Vec::with_capacity(self.executions.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let Some(execution) = self.executions.get(&id) else { continue };
            out.push(id);
            for child in execution.children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Subtree of `id` (inclusive), pre-order.
    pub fn subtree(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            let Some(execution) = self.executions.get(&cur) else { continue };
            out.push(cur);
            for child in execution.children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Subtree of `id` (inclusive) with every child before its parent;
    /// the order cancellation must proceed in.
    pub fn subtree_innermost_first(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut out = self.subtree(id);
        out.reverse();
        out
    }

    pub fn ancestors(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut out = Vec::new();
        let mut cur = self.executions.get(&id).and_then(|e| e.parent);
        while let Some(p) = cur {
            out.push(p);
            cur = self.executions.get(&p).and_then(|e| e.parent);
        }
        out
    }

    /// All executions currently positioned at `activity`, in tree order.
    pub fn executions_at(&self, activity: &str) -> Vec<ExecutionId> {
        self.dfs()
            .into_iter()
            .filter(|id| {
                self.executions
                    .get(id)
                    .map(|e| e.activity.as_deref() == Some(activity))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Nearest enclosing scope execution (the execution itself if it is a
    /// scope).
    pub fn scope_of(&self, id: ExecutionId) -> ExecutionId {
        let mut cur = id;
        loop {
            let Some(execution) = self.executions.get(&cur) else { return self.root };
            if execution.is_scope {
                return cur;
            }
            match execution.parent {
                Some(p) => cur = p,
                None => return self.root,
            }
        }
    }

    /// Direct child scope execution positioned at `activity`, if any.
    pub fn find_child_scope(&self, under: ExecutionId, activity: &str) -> Option<ExecutionId> {
        let parent = self.executions.get(&under)?;
        parent.children.iter().copied().find(|c| {
            self.executions
                .get(c)
                .map(|e| e.is_scope && e.activity.as_deref() == Some(activity))
                .unwrap_or(false)
        })
    }

    /// Variables visible at `id`: root scope first, inner scopes override.
    pub fn merged_variables(&self, id: ExecutionId) -> HashMap<String, Value> {
        let mut chain = self.ancestors(id);
        chain.reverse();
        chain.push(id);
        let mut vars = HashMap::new();
        for exec_id in chain {
            if let Some(execution) = self.executions.get(&exec_id) {
                for (k, v) in &execution.variables {
                    vars.insert(k.clone(), v.clone());
                }
            }
        }
        vars
    }

    pub fn root_variables(&self) -> &HashMap<String, Value> {
        &self.executions[&self.root].variables
    }

    pub fn all(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }
}
