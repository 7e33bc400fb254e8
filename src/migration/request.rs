use crate::migration::MigrationError;
use crate::runtime::engine::ProcessEngine;
use crate::runtime::instance::ExecutionId;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum MoveSources {
    /// Every execution currently positioned at these activities.
    Activities(Vec<String>),
    /// Specific executions by id.
    Executions(Vec<ExecutionId>),
}

/// One entry of a change-state request: cancel the sources, instantiate
/// the targets. Fan-out (one source, many targets) and fan-in (many
/// sources, one target) are single entries evaluated atomically.
#[derive(Debug, Clone)]
pub struct MoveOperation {
    pub sources: MoveSources,
    pub targets: Vec<String>,
}

/// Control transfer between a call activity's two instances.
#[derive(Debug, Clone)]
pub enum CrossMove {
    /// Child instance activity -> activity of the calling instance.
    ToParent { from: String, to: String },
    /// Parent activity -> activity inside a freshly started called
    /// instance, optionally pinned to a definition version.
    ToSubProcess { from: String, to: String, called_element: String, version: Option<u32> },
}

#[derive(Debug, Clone)]
pub enum ScopeRef {
    Activity(String),
    Execution(ExecutionId),
}

/// Accumulates move operations and deferred variable assignments against
/// one process instance. A pure, cancellable value until `change_state()`
/// commits everything all-or-nothing.
pub struct ChangeStateRequest<'a> {
    engine: &'a ProcessEngine,
    pub(crate) instance_id: Uuid,
    pub(crate) moves: Vec<MoveOperation>,
    pub(crate) cross: Vec<CrossMove>,
    pub(crate) process_variables: Vec<(String, Value)>,
    pub(crate) local_variables: Vec<(ScopeRef, String, Value)>,
}

impl<'a> ChangeStateRequest<'a> {
    pub(crate) fn new(engine: &'a ProcessEngine, instance_id: Uuid) -> Self {
        Self {
            engine,
            instance_id,
            moves: Vec::new(),
            cross: Vec::new(),
            process_variables: Vec::new(),
            local_variables: Vec::new(),
        }
    }

    /// Moves every execution at `from` to `to`, one for one.
    pub fn move_activity_to(mut self, from: &str, to: &str) -> Self {
        self.moves.push(MoveOperation {
            sources: MoveSources::Activities(vec![from.to_string()]),
            targets: vec![to.to_string()],
        });
        self
    }

    pub fn move_execution_to(mut self, execution: ExecutionId, to: &str) -> Self {
        self.moves.push(MoveOperation {
            sources: MoveSources::Executions(vec![execution]),
            targets: vec![to.to_string()],
        });
        self
    }

    /// Fan-out: one source execution, one new execution per target.
    pub fn move_activity_to_all(mut self, from: &str, targets: &[&str]) -> Self {
        self.moves.push(MoveOperation {
            sources: MoveSources::Activities(vec![from.to_string()]),
            targets: targets.iter().map(|t| t.to_string()).collect(),
        });
        self
    }

    /// Fan-in: all sources collapse into a single execution at `to`.
    pub fn move_activities_to(mut self, froms: &[&str], to: &str) -> Self {
        self.moves.push(MoveOperation {
            sources: MoveSources::Activities(froms.iter().map(|f| f.to_string()).collect()),
            targets: vec![to.to_string()],
        });
        self
    }

    pub fn move_execution_to_all(mut self, execution: ExecutionId, targets: &[&str]) -> Self {
        self.moves.push(MoveOperation {
            sources: MoveSources::Executions(vec![execution]),
            targets: targets.iter().map(|t| t.to_string()).collect(),
        });
        self
    }

    pub fn move_executions_to(mut self, executions: &[ExecutionId], to: &str) -> Self {
        self.moves.push(MoveOperation {
            sources: MoveSources::Executions(executions.to_vec()),
            targets: vec![to.to_string()],
        });
        self
    }

    /// Moves an activity of this (called) instance to an activity of the
    /// calling instance.
    pub fn move_to_parent_instance(mut self, from: &str, to: &str) -> Self {
        self.cross.push(CrossMove::ToParent { from: from.to_string(), to: to.to_string() });
        self
    }

    /// Moves an activity of this instance into a freshly started called
    /// instance of `called_element`, optionally pinned to a version.
    pub fn move_to_subprocess_instance(
        mut self,
        from: &str,
        to: &str,
        called_element: &str,
        version: Option<u32>,
    ) -> Self {
        self.cross.push(CrossMove::ToSubProcess {
            from: from.to_string(),
            to: to.to_string(),
            called_element: called_element.to_string(),
            version,
        });
        self
    }

    /// Deferred process-variable write, applied before the cancel phase.
    pub fn process_variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.process_variables.push((name.to_string(), value.into()));
        self
    }

    /// Deferred scope-local write, applied when its owning scope is
    /// created (or directly if it already exists).
    pub fn local_variable(mut self, scope_activity: &str, name: &str, value: impl Into<Value>) -> Self {
        self.local_variables.push((
            ScopeRef::Activity(scope_activity.to_string()),
            name.to_string(),
            value.into(),
        ));
        self
    }

    pub fn local_variable_for_execution(
        mut self,
        execution: ExecutionId,
        name: &str,
        value: impl Into<Value>,
    ) -> Self {
        self.local_variables.push((ScopeRef::Execution(execution), name.to_string(), value.into()));
        self
    }

    /// Commits the accumulated operations atomically. Either the whole
    /// request applies or the instance is left exactly as it was.
    pub async fn change_state(self) -> Result<(), MigrationError> {
        let engine = self.engine;
        engine.apply_change_state(self).await
    }
}
