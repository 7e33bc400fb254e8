use crate::actions::{TaskContext, TaskHandler, resolve_params};
use crate::dsl::{EventKind, Process};
use crate::graph::{ActivityKind, Compiler, ProcessGraph};
use crate::migration::planner::MigrationPlanner;
use crate::migration::mutator::TreeMutator;
use crate::migration::request::{ChangeStateRequest, CrossMove};
use crate::migration::MigrationError;
use crate::runtime::events::{EventSink, LifecycleEvent, StoreOp, TracingSink, TxnLog};
use crate::runtime::instance::{CallActivityLink, ExecutionId, ProcessInstance};
use crate::runtime::storage::{
    EventSubscription, InMemoryJobStore, InMemorySubscriptionStore, InMemoryVariableStore, JobStore,
    SubscriptionStore, TimerJob, VariableStore,
};
use crate::runtime::{expr, lifecycle, sync};
use anyhow::{Result, anyhow};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// A wait-state task an external worker can complete.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub execution_id: ExecutionId,
    pub activity_id: String,
}

#[derive(Debug, Clone)]
pub struct ExecutionView {
    pub id: ExecutionId,
    pub activity: Option<String>,
    pub parent_activity: Option<String>,
    pub active: bool,
    pub is_scope: bool,
    pub is_mi_root: bool,
}

/// Read-only structural projection of one instance, for inspection and for
/// structural-equality assertions in tests.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub executions: Vec<ExecutionView>,
    pub subscriptions: Vec<EventSubscription>,
    pub jobs: Vec<TimerJob>,
}

impl InstanceSnapshot {
    /// Sorted structural key: two instances with equal keys have the same
    /// tree shape regardless of generated ids.
    pub fn structure(&self) -> Vec<(Option<String>, Option<String>, bool, bool, bool)> {
        let mut out: Vec<_> = self
            .executions
            .iter()
            .map(|e| (e.parent_activity.clone(), e.activity.clone(), e.active, e.is_scope, e.is_mi_root))
            .collect();
        out.sort();
        out
    }

    pub fn subscription_keys(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> =
            self.subscriptions.iter().map(|s| (s.activity_id.clone(), s.event_name.clone())).collect();
        out.sort();
        out
    }

    pub fn job_keys(&self) -> Vec<String> {
        let mut out: Vec<_> = self.jobs.iter().map(|j| j.activity_id.clone()).collect();
        out.sort();
        out
    }

    /// Activities of active leaf executions, sorted.
    pub fn active_activities(&self) -> Vec<String> {
        let mut out: Vec<_> = self
            .executions
            .iter()
            .filter(|e| e.active && !e.is_scope)
            .filter_map(|e| e.activity.clone())
            .collect();
        out.sort();
        out
    }
}

pub(crate) enum StartAt {
    Default,
    Activity(String),
}

/// Cross-instance work produced while an instance op held its own lock;
/// executed afterwards so each step acquires exactly one lock at a time.
pub(crate) enum FollowUp {
    StartChild {
        graph: Arc<ProcessGraph>,
        vars: HashMap<String, Value>,
        link: CallActivityLink,
        start_at: StartAt,
        child_id: Uuid,
    },
    ResumeParent {
        parent: Uuid,
        parent_execution: ExecutionId,
        outputs: HashMap<String, Value>,
    },
    TerminateInstance {
        instance: Uuid,
    },
}

/// Process engine: versioned definition registry, live instances, handler
/// registry, stores and event sink. Execution per instance is synchronous
/// under that instance's lock; different instances run in parallel.
pub struct ProcessEngine {
    definitions: DashMap<String, Vec<Arc<ProcessGraph>>>,
    instances: DashMap<Uuid, Arc<Mutex<ProcessInstance>>>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    subscriptions: Arc<dyn SubscriptionStore>,
    jobs: Arc<dyn JobStore>,
    variables: Arc<dyn VariableStore>,
    sink: Arc<dyn EventSink>,
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self {
            definitions: DashMap::new(),
            instances: DashMap::new(),
            handlers: HashMap::new(),
            subscriptions: Arc::new(InMemorySubscriptionStore::new()),
            jobs: Arc::new(InMemoryJobStore::new()),
            variables: Arc::new(InMemoryVariableStore::new()),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_variable_store(mut self, store: Arc<dyn VariableStore>) -> Self {
        self.variables = store;
        self
    }

    pub fn with_subscription_store(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.subscriptions = store;
        self
    }

    pub fn with_job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.jobs = store;
        self
    }

    pub fn register_handler(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Compiles and registers a definition; each registration under the
    /// same process id gets the next version number.
    pub fn register_process(&self, process: Process) -> Result<u32> {
        let mut versions = self.definitions.entry(process.id.clone()).or_default();
        let version = versions.len() as u32 + 1;
        let graph = Compiler::new().compile(process, version)?;
        versions.push(Arc::new(graph));
        Ok(version)
    }

    /// Looks up a definition version; `None` resolves to the latest.
    pub fn definition(&self, id: &str, version: Option<u32>) -> Option<Arc<ProcessGraph>> {
        let versions = self.definitions.get(id)?;
        match version {
            Some(v) => versions.iter().find(|g| g.version == v).cloned(),
            None => versions.last().cloned(),
        }
    }

    pub(crate) fn graph_for(&self, instance: &ProcessInstance) -> Result<Arc<ProcessGraph>> {
        self.definition(&instance.definition_id, Some(instance.definition_version))
            .ok_or_else(|| anyhow!("Process definition not found: {}", instance.definition_id))
    }

    pub async fn start_process(&self, definition_id: &str, vars: HashMap<String, Value>) -> Result<Uuid> {
        let graph = self
            .definition(definition_id, None)
            .ok_or_else(|| anyhow!("Process definition not found: {}", definition_id))?;
        let (id, followups) = self.launch_instance(graph, vars, None, StartAt::Default, None).await?;
        self.drain_followups(followups).await?;
        Ok(id)
    }

    pub(crate) async fn launch_instance(
        &self,
        graph: Arc<ProcessGraph>,
        vars: HashMap<String, Value>,
        link: Option<CallActivityLink>,
        start_at: StartAt,
        preassigned: Option<Uuid>,
    ) -> Result<(Uuid, Vec<FollowUp>)> {
        let mut instance = ProcessInstance::new(&graph.id, graph.version, link);
        if let Some(id) = preassigned {
            instance.id = id;
        }
        let instance_id = instance.id;
        let mut txn = TxnLog::default();
        txn.emit(LifecycleEvent::ProcessStarted { instance: instance_id, definition: graph.id.clone() });

        let mut initial = graph.initial_variables.clone();
        initial.extend(vars);
        let root = instance.root;
        for (name, value) in initial {
            instance.get_mut(root).expect("root execution").variables.insert(name.clone(), value.clone());
            txn.op(StoreOp::SetGlobal { instance: instance_id, name: name.clone(), value });
            txn.emit(LifecycleEvent::VariableCreated { instance: instance_id, scope: root, name });
        }
        lifecycle::create_attached_events(&graph, &mut instance, &mut txn, root, &graph.root_attached)?;

        let mut queue = VecDeque::new();
        match start_at {
            StartAt::Default => {
                let token = instance.create_execution(root, Some(graph.start.clone()), false, true, None);
                queue.push_back(token);
            }
            StartAt::Activity(activity) => {
                let chain = graph.scope_chain(&activity);
                let under =
                    lifecycle::build_scope_chain(&graph, &mut instance, &mut txn, root, &chain, &|_| vec![])?;
                let leaf = instance.create_execution(under, Some(activity), false, true, None);
                queue.push_back(leaf);
            }
        }

        let followups = self.advance(&graph, &mut instance, &mut txn, &mut queue).await?;
        if !instance.completed {
            self.instances.insert(instance_id, Arc::new(Mutex::new(instance)));
        }
        self.flush(txn).await?;
        Ok((instance_id, followups))
    }

    /// Worklist interpreter: pops token positions and executes the node
    /// kind exhaustively until every token is parked at a wait state.
    pub(crate) async fn advance(
        &self,
        graph: &ProcessGraph,
        instance: &mut ProcessInstance,
        txn: &mut TxnLog,
        queue: &mut VecDeque<ExecutionId>,
    ) -> Result<Vec<FollowUp>> {
        let mut followups = Vec::new();
        while let Some(exec_id) = queue.pop_front() {
            if instance.completed {
                break;
            }
            let Some(execution) = instance.get(exec_id) else { continue };
            let Some(activity) = execution.activity.clone() else { continue };
            let fork_origin = execution.fork_origin.clone();
            let parent = execution.parent.unwrap_or(instance.root);
            let node = graph
                .activity(&activity)
                .ok_or_else(|| anyhow!("Activity not found: {}", activity))?
                .clone();

            match &node.kind {
                ActivityKind::Start => {
                    self.leave(graph, instance, txn, exec_id, queue, &mut followups)?;
                }
                ActivityKind::End => {
                    self.complete_branch(graph, instance, txn, exec_id, queue, &mut followups)?;
                }
                ActivityKind::Task { handler: None, .. } => {
                    instance.get_mut(exec_id).expect("execution present").active = true;
                    txn.emit(LifecycleEvent::ActivityStarted {
                        instance: instance.id,
                        execution: exec_id,
                        activity: activity.clone(),
                    });
                    lifecycle::create_attached_events(graph, instance, txn, exec_id, &node.attached)?;
                }
                ActivityKind::Task { handler: Some(name), params, output } => {
                    txn.emit(LifecycleEvent::ActivityStarted {
                        instance: instance.id,
                        execution: exec_id,
                        activity: activity.clone(),
                    });
                    let handler = self
                        .handlers
                        .get(name)
                        .ok_or_else(|| anyhow!("Task handler not found: {}", name))?
                        .clone();
                    let vars = instance.merged_variables(exec_id);
                    let resolved = resolve_params(params, &vars);
                    let instance_id = instance.id;
                    let root = instance.root;
                    let result = {
                        let root_vars = &mut instance.get_mut(root).expect("root execution").variables;
                        let mut ctx = TaskContext::new(instance_id, root, root_vars, txn);
                        handler.execute(resolved, &mut ctx).await?
                    };
                    if let Some(out) = output {
                        self.set_process_variable(instance, txn, out, result);
                    }
                    txn.emit(LifecycleEvent::ActivityCompleted {
                        instance: instance_id,
                        execution: exec_id,
                        activity: activity.clone(),
                    });
                    self.leave(graph, instance, txn, exec_id, queue, &mut followups)?;
                }
                ActivityKind::ParallelGateway { .. } | ActivityKind::InclusiveGateway { .. } => {
                    self.handle_gateway(graph, instance, txn, exec_id, &node, queue)?;
                }
                ActivityKind::SubProcess => {
                    lifecycle::remove_owned_events(instance, txn, exec_id, false);
                    instance.detach_remove(exec_id);
                    let scope =
                        lifecycle::enter_scope(graph, instance, txn, parent, &activity, &[], fork_origin)?;
                    let start = node
                        .start_activity
                        .clone()
                        .ok_or_else(|| anyhow!("Scope {} has no start activity", activity))?;
                    let token = instance.create_execution(scope, Some(start), false, true, None);
                    queue.push_back(token);
                }
                ActivityKind::MultiInstance { sequential, cardinality, .. } => {
                    lifecycle::remove_owned_events(instance, txn, exec_id, false);
                    instance.detach_remove(exec_id);
                    let scope =
                        lifecycle::enter_scope(graph, instance, txn, parent, &activity, &[], fork_origin)?;
                    let body = node
                        .start_activity
                        .clone()
                        .ok_or_else(|| anyhow!("Multi-instance {} has no body", activity))?;
                    let spawn = if *sequential { 1 } else { *cardinality };
                    for _ in 0..spawn {
                        sync::mi_register_spawn(instance, scope);
                        let iteration = instance.create_execution(scope, Some(body.clone()), false, true, None);
                        queue.push_back(iteration);
                    }
                }
                ActivityKind::CallActivity { called_element, version } => {
                    let child_graph = self.definition(called_element, *version).ok_or_else(|| {
                        anyhow!("Process definition not found: {} (version {:?})", called_element, version)
                    })?;
                    instance.get_mut(exec_id).expect("execution present").active = false;
                    txn.emit(LifecycleEvent::ActivityStarted {
                        instance: instance.id,
                        execution: exec_id,
                        activity: activity.clone(),
                    });
                    let child_id = Uuid::new_v4();
                    instance.child_instances.insert(exec_id, child_id);
                    followups.push(FollowUp::StartChild {
                        graph: child_graph,
                        vars: instance.root_variables().clone(),
                        link: CallActivityLink { parent_instance: instance.id, parent_execution: exec_id },
                        start_at: StartAt::Default,
                        child_id,
                    });
                }
                ActivityKind::EventSubProcess { .. } => {
                    return Err(anyhow!("Event sub-process {} cannot be reached by sequence flow", activity));
                }
                ActivityKind::BoundaryEvent { .. } => {
                    // A fired boundary event just flows onward.
                    self.leave(graph, instance, txn, exec_id, queue, &mut followups)?;
                }
            }
        }
        Ok(followups)
    }

    /// Takes the (single) outgoing flow of the current activity, or
    /// completes the branch when there is none.
    fn leave(
        &self,
        graph: &ProcessGraph,
        instance: &mut ProcessInstance,
        txn: &mut TxnLog,
        exec_id: ExecutionId,
        queue: &mut VecDeque<ExecutionId>,
        followups: &mut Vec<FollowUp>,
    ) -> Result<()> {
        let activity = instance
            .get(exec_id)
            .and_then(|e| e.activity.clone())
            .ok_or_else(|| anyhow!("Execution {} has no activity", exec_id))?;
        let node = graph
            .activity(&activity)
            .ok_or_else(|| anyhow!("Activity not found: {}", activity))?;
        match node.outgoing.as_slice() {
            [] => self.complete_branch(graph, instance, txn, exec_id, queue, followups),
            [flow] => {
                let target = flow.target.clone();
                lifecycle::remove_owned_events(instance, txn, exec_id, false);
                let execution = instance.get_mut(exec_id).expect("execution present");
                execution.activity = Some(target);
                execution.active = true;
                queue.push_back(exec_id);
                Ok(())
            }
            _ => Err(anyhow!("Only gateways may fork; {} has multiple outgoing flows", activity)),
        }
    }

    fn handle_gateway(
        &self,
        graph: &ProcessGraph,
        instance: &mut ProcessInstance,
        txn: &mut TxnLog,
        exec_id: ExecutionId,
        node: &crate::graph::ActivityNode,
        queue: &mut VecDeque<ExecutionId>,
    ) -> Result<()> {
        let activity = node.id.clone();
        let scope = instance.get(exec_id).and_then(|e| e.parent).unwrap_or(instance.root);
        let mut current = exec_id;

        if node.is_synchronizing_gateway() {
            instance.get_mut(current).expect("execution present").active = false;
            match sync::evaluate_join(graph, instance, scope, &activity)? {
                sync::JoinOutcome::Wait => return Ok(()),
                sync::JoinOutcome::Fire { consumed, origin } => {
                    for parked in consumed {
                        lifecycle::remove_owned_events(instance, txn, parked, false);
                        instance.detach_remove(parked);
                    }
                    current = instance.create_execution(scope, Some(activity.clone()), false, true, origin);
                }
            }
        }

        let vars = instance.merged_variables(current);
        let activated: Vec<_> = match &node.kind {
            ActivityKind::InclusiveGateway { .. } => node
                .outgoing
                .iter()
                .filter(|f| f.condition.as_deref().map(|c| expr::eval_bool(c, &vars)).unwrap_or(true))
                .cloned()
                .collect(),
            _ => node.outgoing.clone(),
        };
        if activated.is_empty() {
            return Err(anyhow!("No outgoing sequence flow activated at gateway {}", activity));
        }
        if node.outgoing.len() <= 1 {
            let execution = instance.get_mut(current).expect("execution present");
            execution.activity = Some(activated[0].target.clone());
            execution.active = true;
            queue.push_back(current);
        } else {
            // Branch count is recorded at fork time, even when conditions
            // activate a single branch; the matching join synchronizes on
            // this count, not on the static flow count.
            let outer = instance.get(current).and_then(|e| e.fork_origin.clone());
            sync::register_fork(instance, scope, &activity, activated.len() as u32, outer);
            for flow in &activated {
                let branch =
                    instance.create_execution(scope, Some(flow.target.clone()), false, true, Some(activity.clone()));
                queue.push_back(branch);
            }
            instance.detach_remove(current);
        }
        Ok(())
    }

    /// A unit of work finished: remove it and unwind — fork accounting,
    /// multi-instance bookkeeping, scope completion, ultimately instance
    /// completion.
    fn complete_branch(
        &self,
        graph: &ProcessGraph,
        instance: &mut ProcessInstance,
        txn: &mut TxnLog,
        start: ExecutionId,
        queue: &mut VecDeque<ExecutionId>,
        followups: &mut Vec<FollowUp>,
    ) -> Result<()> {
        let mut unit = start;
        loop {
            let (parent_opt, origin) = {
                let execution =
                    instance.get(unit).ok_or_else(|| anyhow!("Execution {} not found", unit))?;
                (execution.parent, execution.fork_origin.clone())
            };

            let Some(parent) = parent_opt else {
                // Process scope drained.
                let outputs = instance.root_variables().clone();
                lifecycle::remove_owned_events(instance, txn, unit, false);
                instance.detach_remove(unit);
                instance.completed = true;
                txn.emit(LifecycleEvent::ProcessCompleted { instance: instance.id });
                if let Some(link) = instance.parent_link.clone() {
                    followups.push(FollowUp::ResumeParent {
                        parent: link.parent_instance,
                        parent_execution: link.parent_execution,
                        outputs,
                    });
                }
                return Ok(());
            };

            lifecycle::remove_owned_events(instance, txn, unit, false);
            instance.forks.retain(|(scope, _), _| *scope != unit);
            if let Some(child) = instance.child_instances.remove(&unit) {
                followups.push(FollowUp::TerminateInstance { instance: child });
            }
            instance.detach_remove(unit);

            if let Some(fork_id) = origin
                && let Some((join_activity, sync::JoinOutcome::Fire { consumed, origin })) =
                    sync::branch_completed(graph, instance, parent, &fork_id)?
            {
                for parked in consumed {
                    lifecycle::remove_owned_events(instance, txn, parked, false);
                    instance.detach_remove(parked);
                }
                let continuation =
                    instance.create_execution(parent, Some(join_activity), false, true, origin);
                queue.push_back(continuation);
            }

            let is_mi_root = match instance.get(parent) {
                Some(parent_execution) => parent_execution.is_mi_root,
                None => return Ok(()),
            };
            if is_mi_root {
                // Every iteration completion runs the loop accounting,
                // whether or not siblings are still running.
                match sync::mi_iteration_completed(graph, instance, parent)? {
                    sync::MiOutcome::SpawnNext(body) => {
                        sync::mi_register_spawn(instance, parent);
                        let iteration = instance.create_execution(parent, Some(body), false, true, None);
                        queue.push_back(iteration);
                        return Ok(());
                    }
                    sync::MiOutcome::Wait => return Ok(()),
                    sync::MiOutcome::Completed => {
                        // A satisfied completion condition cancels the
                        // iterations that are still running.
                        for child in instance.get(parent).map(|p| p.children.clone()).unwrap_or_default() {
                            let cancelled = lifecycle::cancel_execution_tree(instance, txn, child);
                            followups.extend(
                                cancelled
                                    .orphaned_children
                                    .into_iter()
                                    .map(|c| FollowUp::TerminateInstance { instance: c }),
                            );
                        }
                        let activity = instance
                            .get(parent)
                            .and_then(|e| e.activity.clone())
                            .unwrap_or_default();
                        txn.emit(LifecycleEvent::ActivityCompleted {
                            instance: instance.id,
                            execution: parent,
                            activity,
                        });
                        if self.leave_completed_scope(graph, instance, txn, parent, queue)? {
                            return Ok(());
                        }
                        unit = parent;
                        continue;
                    }
                }
            }

            let children_left = match instance.get(parent) {
                Some(parent_execution) => parent_execution.children.len(),
                None => return Ok(()),
            };
            if children_left > 0 {
                return Ok(());
            }

            if parent == instance.root {
                unit = parent;
            } else {
                let activity = instance
                    .get(parent)
                    .and_then(|e| e.activity.clone())
                    .ok_or_else(|| anyhow!("Scope execution {} has no activity", parent))?;
                let node = graph
                    .activity(&activity)
                    .ok_or_else(|| anyhow!("Activity not found: {}", activity))?;
                match node.kind {
                    ActivityKind::EventSubProcess { .. } => {
                        unit = parent;
                    }
                    _ => {
                        txn.emit(LifecycleEvent::ActivityCompleted {
                            instance: instance.id,
                            execution: parent,
                            activity,
                        });
                        if self.leave_completed_scope(graph, instance, txn, parent, queue)? {
                            return Ok(());
                        }
                        unit = parent;
                    }
                }
            }
        }
    }

    /// A scope activity finished. If it has an outgoing flow, the token
    /// continues in the enclosing scope and `true` is returned; otherwise
    /// the caller keeps unwinding.
    fn leave_completed_scope(
        &self,
        graph: &ProcessGraph,
        instance: &mut ProcessInstance,
        txn: &mut TxnLog,
        scope: ExecutionId,
        queue: &mut VecDeque<ExecutionId>,
    ) -> Result<bool> {
        let (activity, parent, origin) = {
            let execution = instance.get(scope).ok_or_else(|| anyhow!("Execution {} not found", scope))?;
            (
                execution.activity.clone().unwrap_or_default(),
                execution.parent,
                execution.fork_origin.clone(),
            )
        };
        let node = graph
            .activity(&activity)
            .ok_or_else(|| anyhow!("Activity not found: {}", activity))?;
        let [flow] = node.outgoing.as_slice() else { return Ok(false) };
        let Some(parent) = parent else { return Ok(false) };
        let target = flow.target.clone();
        lifecycle::remove_owned_events(instance, txn, scope, false);
        instance.forks.retain(|(s, _), _| *s != scope);
        instance.detach_remove(scope);
        let token = instance.create_execution(parent, Some(target), false, true, origin);
        queue.push_back(token);
        Ok(true)
    }

    fn set_process_variable(
        &self,
        instance: &mut ProcessInstance,
        txn: &mut TxnLog,
        name: &str,
        value: Value,
    ) {
        let root = instance.root;
        let instance_id = instance.id;
        let vars = &mut instance.get_mut(root).expect("root execution").variables;
        let created = !vars.contains_key(name);
        vars.insert(name.to_string(), value.clone());
        txn.op(StoreOp::SetGlobal { instance: instance_id, name: name.to_string(), value });
        if created {
            txn.emit(LifecycleEvent::VariableCreated {
                instance: instance_id,
                scope: root,
                name: name.to_string(),
            });
        }
    }

    // --- Public instance operations ---

    pub async fn tasks(&self, instance_id: Uuid) -> Result<Vec<TaskInfo>> {
        let slot = self.instance_slot(instance_id)?;
        let guard = slot.lock().await;
        let graph = self.graph_for(&guard)?;
        Ok(guard
            .dfs()
            .into_iter()
            .filter_map(|id| {
                let execution = guard.get(id)?;
                if !execution.active || execution.is_scope {
                    return None;
                }
                let activity = execution.activity.clone()?;
                match graph.activity(&activity).map(|n| &n.kind) {
                    Some(ActivityKind::Task { handler: None, .. }) => {
                        Some(TaskInfo { execution_id: id, activity_id: activity })
                    }
                    _ => None,
                }
            })
            .collect())
    }

    pub async fn complete_task(&self, instance_id: Uuid, execution_id: ExecutionId) -> Result<()> {
        let slot = self.instance_slot(instance_id)?;
        let mut guard = slot.lock().await;
        let graph = self.graph_for(&guard)?;
        let mut work = guard.clone();
        let mut txn = TxnLog::default();

        let activity = {
            let execution = work
                .get(execution_id)
                .ok_or_else(|| anyhow!("Execution {} not found", execution_id))?;
            if !execution.active {
                return Err(anyhow!("Execution {} is not active", execution_id));
            }
            execution.activity.clone().ok_or_else(|| anyhow!("Execution {} has no activity", execution_id))?
        };
        match graph.activity(&activity).map(|n| &n.kind) {
            Some(ActivityKind::Task { handler: None, .. }) => {}
            _ => return Err(anyhow!("Activity {} is not a waiting task", activity)),
        }

        txn.emit(LifecycleEvent::ActivityCompleted {
            instance: work.id,
            execution: execution_id,
            activity,
        });
        let mut queue = VecDeque::new();
        let mut followups = Vec::new();
        self.leave(&graph, &mut work, &mut txn, execution_id, &mut queue, &mut followups)?;
        followups.extend(self.advance(&graph, &mut work, &mut txn, &mut queue).await?);

        self.commit(&mut guard, work, txn).await?;
        self.drain_followups(followups).await
    }

    /// Completes the first waiting task at `activity_id` (tree order).
    pub async fn complete_activity(&self, instance_id: Uuid, activity_id: &str) -> Result<()> {
        let execution_id = {
            let tasks = self.tasks(instance_id).await?;
            tasks
                .iter()
                .find(|t| t.activity_id == activity_id)
                .map(|t| t.execution_id)
                .ok_or_else(|| anyhow!("No waiting task at activity '{}'", activity_id))?
        };
        self.complete_task(instance_id, execution_id).await
    }

    pub async fn send_signal(&self, instance_id: Uuid, name: &str) -> Result<()> {
        self.deliver_event(instance_id, EventKind::Signal, name).await
    }

    pub async fn correlate_message(&self, instance_id: Uuid, name: &str) -> Result<()> {
        self.deliver_event(instance_id, EventKind::Message, name).await
    }

    async fn deliver_event(&self, instance_id: Uuid, kind: EventKind, name: &str) -> Result<()> {
        let slot = self.instance_slot(instance_id)?;
        let mut guard = slot.lock().await;
        let graph = self.graph_for(&guard)?;
        let mut work = guard.clone();
        let mut txn = TxnLog::default();

        let matching: Vec<EventSubscription> = work
            .subscriptions
            .iter()
            .filter(|s| s.kind == kind && s.event_name == name)
            .cloned()
            .collect();
        if matching.is_empty() {
            return Err(anyhow!("No subscription for {:?} '{}'", kind, name));
        }

        let mut queue = VecDeque::new();
        let mut followups = Vec::new();
        for subscription in matching {
            // An earlier interrupting trigger may have torn this one down.
            if !work.subscriptions.iter().any(|s| s.id == subscription.id) {
                continue;
            }
            self.trigger_event(&graph, &mut work, &mut txn, &subscription, &mut queue, &mut followups)?;
        }
        followups.extend(self.advance(&graph, &mut work, &mut txn, &mut queue).await?);

        self.commit(&mut guard, work, txn).await?;
        self.drain_followups(followups).await
    }

    fn trigger_event(
        &self,
        graph: &ProcessGraph,
        instance: &mut ProcessInstance,
        txn: &mut TxnLog,
        subscription: &EventSubscription,
        queue: &mut VecDeque<ExecutionId>,
        followups: &mut Vec<FollowUp>,
    ) -> Result<()> {
        let node = graph
            .activity(&subscription.activity_id)
            .ok_or_else(|| anyhow!("Activity not found: {}", subscription.activity_id))?
            .clone();
        match &node.kind {
            ActivityKind::EventSubProcess { interrupting, .. } => {
                let scope = subscription.execution_id;
                if *interrupting {
                    for child in instance.get(scope).map(|s| s.children.clone()).unwrap_or_default() {
                        let outcome = lifecycle::cancel_execution_tree(instance, txn, child);
                        followups.extend(
                            outcome
                                .orphaned_children
                                .into_iter()
                                .map(|c| FollowUp::TerminateInstance { instance: c }),
                        );
                    }
                    instance.subscriptions.retain(|s| s.id != subscription.id);
                    txn.op(StoreOp::CancelSubscription { instance: instance.id, id: subscription.id });
                }
                let esp = lifecycle::enter_scope(
                    graph,
                    instance,
                    txn,
                    scope,
                    &subscription.activity_id,
                    &[],
                    None,
                )?;
                let start = node
                    .start_activity
                    .clone()
                    .ok_or_else(|| anyhow!("Scope {} has no start activity", subscription.activity_id))?;
                let token = instance.create_execution(esp, Some(start), false, true, None);
                queue.push_back(token);
            }
            ActivityKind::BoundaryEvent { interrupting, .. } => {
                let host = subscription.execution_id;
                let scope = instance.get(host).and_then(|e| e.parent).unwrap_or(instance.root);
                let host_origin = instance.get(host).and_then(|e| e.fork_origin.clone());
                let origin = if *interrupting {
                    let outcome = lifecycle::cancel_execution_tree(instance, txn, host);
                    followups.extend(
                        outcome
                            .orphaned_children
                            .into_iter()
                            .map(|c| FollowUp::TerminateInstance { instance: c }),
                    );
                    host_origin
                } else {
                    None
                };
                let token =
                    instance.create_execution(scope, Some(subscription.activity_id.clone()), false, true, origin);
                queue.push_back(token);
            }
            _ => return Err(anyhow!("Activity {} is not an event", subscription.activity_id)),
        }
        Ok(())
    }

    /// Fires a scheduled timer job by id.
    pub async fn fire_timer(&self, instance_id: Uuid, job_id: Uuid) -> Result<()> {
        let slot = self.instance_slot(instance_id)?;
        let mut guard = slot.lock().await;
        let graph = self.graph_for(&guard)?;
        let mut work = guard.clone();
        let mut txn = TxnLog::default();

        let job = work
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
            .ok_or_else(|| anyhow!("Timer job {} not found", job_id))?;
        // The job is consumed by firing; no JOB_CANCELED is emitted.
        work.jobs.retain(|j| j.id != job_id);
        txn.op(StoreOp::CancelJob { instance: work.id, id: job_id });

        let synthetic = EventSubscription {
            id: job.id,
            instance_id: job.instance_id,
            execution_id: job.execution_id,
            activity_id: job.activity_id.clone(),
            kind: EventKind::Timer,
            event_name: String::new(),
            interrupting: false,
        };
        let mut queue = VecDeque::new();
        let mut followups = Vec::new();
        self.trigger_event(&graph, &mut work, &mut txn, &synthetic, &mut queue, &mut followups)?;
        followups.extend(self.advance(&graph, &mut work, &mut txn, &mut queue).await?);

        self.commit(&mut guard, work, txn).await?;
        self.drain_followups(followups).await
    }

    /// Convenience: fires the timer attached to `activity_id`.
    pub async fn trigger_timer_at(&self, instance_id: Uuid, activity_id: &str) -> Result<()> {
        let job_id = {
            let slot = self.instance_slot(instance_id)?;
            let guard = slot.lock().await;
            guard
                .jobs
                .iter()
                .find(|j| j.activity_id == activity_id)
                .map(|j| j.id)
                .ok_or_else(|| anyhow!("No timer job at activity '{}'", activity_id))?
        };
        self.fire_timer(instance_id, job_id).await
    }

    // --- Inspection ---

    pub fn instance_exists(&self, instance_id: Uuid) -> bool {
        self.instances.contains_key(&instance_id)
    }

    pub async fn snapshot(&self, instance_id: Uuid) -> Result<InstanceSnapshot> {
        let slot = self.instance_slot(instance_id)?;
        let guard = slot.lock().await;
        let executions = guard
            .dfs()
            .into_iter()
            .filter_map(|id| {
                let execution = guard.get(id)?;
                let parent_activity =
                    execution.parent.and_then(|p| guard.get(p)).and_then(|p| p.activity.clone());
                Some(ExecutionView {
                    id,
                    activity: execution.activity.clone(),
                    parent_activity,
                    active: execution.active,
                    is_scope: execution.is_scope,
                    is_mi_root: execution.is_mi_root,
                })
            })
            .collect();
        Ok(InstanceSnapshot {
            executions,
            subscriptions: guard.subscriptions.clone(),
            jobs: guard.jobs.clone(),
        })
    }

    /// Reads a process variable from the variable store projection; works
    /// for completed instances too.
    pub async fn get_variable(&self, instance_id: Uuid, name: &str) -> Result<Option<Value>> {
        self.variables.get_global(instance_id, name).await
    }

    pub async fn subscriptions(&self, instance_id: Uuid) -> Result<Vec<EventSubscription>> {
        self.subscriptions.list(instance_id).await
    }

    pub async fn jobs(&self, instance_id: Uuid) -> Result<Vec<TimerJob>> {
        self.jobs.list(instance_id).await
    }

    /// Instances started by call activities of this instance.
    pub async fn called_instances(&self, instance_id: Uuid) -> Result<Vec<Uuid>> {
        let slot = self.instance_slot(instance_id)?;
        let guard = slot.lock().await;
        Ok(guard.child_instances.values().copied().collect())
    }

    /// Entry point of the migration API: accumulate move operations and
    /// variable writes, then commit them atomically with `change_state()`.
    pub fn change_state(&self, instance_id: Uuid) -> ChangeStateRequest<'_> {
        ChangeStateRequest::new(self, instance_id)
    }

    // --- Internals ---

    fn instance_slot(&self, instance_id: Uuid) -> Result<Arc<Mutex<ProcessInstance>>> {
        self.instances
            .get(&instance_id)
            .map(|s| s.clone())
            .ok_or_else(|| anyhow!("Process instance not found: {}", instance_id))
    }

    /// Swaps the mutated working copy in, drops the registry entry for
    /// finished instances, and flushes the transaction log.
    async fn commit(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, ProcessInstance>,
        work: ProcessInstance,
        txn: TxnLog,
    ) -> Result<()> {
        let finished = work.completed;
        let id = work.id;
        **guard = work;
        if finished {
            self.instances.remove(&id);
        }
        self.flush(txn).await
    }

    pub(crate) async fn flush(&self, txn: TxnLog) -> Result<()> {
        for op in txn.store_ops {
            match op {
                StoreOp::SetGlobal { instance, name, value } => {
                    self.variables.set_global(instance, &name, value).await?;
                }
                StoreOp::SetLocal { instance, execution, name, value } => {
                    self.variables.set_local(instance, execution, &name, value).await?;
                }
                StoreOp::CreateSubscription(subscription) => {
                    self.subscriptions.create(subscription).await?;
                }
                StoreOp::CancelSubscription { instance, id } => {
                    self.subscriptions.cancel(instance, id).await?;
                }
                StoreOp::ScheduleJob(job) => {
                    self.jobs.schedule(job).await?;
                }
                StoreOp::CancelJob { instance, id } => {
                    self.jobs.cancel(instance, id).await?;
                }
                StoreOp::ClearInstance { instance } => {
                    self.subscriptions.clear_instance(instance).await?;
                    self.jobs.clear_instance(instance).await?;
                }
            }
        }
        for event in txn.events {
            self.sink.publish(&event);
        }
        Ok(())
    }

    pub(crate) async fn drain_followups(&self, mut pending: Vec<FollowUp>) -> Result<()> {
        while let Some(followup) = pending.pop() {
            let more = match followup {
                FollowUp::StartChild { graph, vars, link, start_at, child_id } => {
                    self.launch_instance(graph, vars, Some(link), start_at, Some(child_id)).await?.1
                }
                FollowUp::ResumeParent { parent, parent_execution, outputs } => {
                    self.resume_call_activity(parent, parent_execution, outputs).await?
                }
                FollowUp::TerminateInstance { instance } => self.terminate_instance(instance).await?,
            };
            pending.extend(more);
        }
        Ok(())
    }

    /// A called instance completed: propagate its variables, complete the
    /// call activity and continue the parent.
    async fn resume_call_activity(
        &self,
        parent: Uuid,
        parent_execution: ExecutionId,
        outputs: HashMap<String, Value>,
    ) -> Result<Vec<FollowUp>> {
        let Ok(slot) = self.instance_slot(parent) else {
            warn!(parent = %parent, "parent instance of completed call activity is gone");
            return Ok(Vec::new());
        };
        let mut guard = slot.lock().await;
        let graph = self.graph_for(&guard)?;
        let mut work = guard.clone();
        let mut txn = TxnLog::default();

        let Some(activity) = work.get(parent_execution).and_then(|e| e.activity.clone()) else {
            // Cancelled while the child was finishing; nothing to resume.
            return Ok(Vec::new());
        };
        work.child_instances.remove(&parent_execution);
        for (name, value) in outputs {
            self.set_process_variable(&mut work, &mut txn, &name, value);
        }
        txn.emit(LifecycleEvent::ActivityCompleted {
            instance: work.id,
            execution: parent_execution,
            activity,
        });
        let mut queue = VecDeque::new();
        let mut followups = Vec::new();
        self.leave(&graph, &mut work, &mut txn, parent_execution, &mut queue, &mut followups)?;
        followups.extend(self.advance(&graph, &mut work, &mut txn, &mut queue).await?);

        self.commit(&mut guard, work, txn).await?;
        Ok(followups)
    }

    /// Cascade-cancels a called instance whose call activity went away.
    async fn terminate_instance(&self, instance_id: Uuid) -> Result<Vec<FollowUp>> {
        let Some((_, slot)) = self.instances.remove(&instance_id) else {
            return Ok(Vec::new());
        };
        let mut guard = slot.lock().await;
        let mut txn = TxnLog::default();
        let root = guard.root;
        let mut followups = Vec::new();
        for child in guard.get(root).map(|r| r.children.clone()).unwrap_or_default() {
            let outcome = lifecycle::cancel_execution_tree(&mut guard, &mut txn, child);
            followups.extend(
                outcome.orphaned_children.into_iter().map(|c| FollowUp::TerminateInstance { instance: c }),
            );
        }
        txn.op(StoreOp::ClearInstance { instance: instance_id });
        info!(instance = %instance_id, "called instance terminated");
        drop(guard);
        self.flush(txn).await?;
        Ok(followups)
    }

    // --- Migration commit path ---

    /// Commits a [`ChangeStateRequest`]: plans against one snapshot, then
    /// applies the plan on a working copy that is swapped in only if every
    /// phase succeeds. Contention surfaces as `Concurrency`; the caller
    /// owns the retry.
    pub(crate) async fn apply_change_state(
        &self,
        request: ChangeStateRequest<'_>,
    ) -> Result<(), MigrationError> {
        if !request.cross.is_empty() {
            return self.apply_cross_change(request).await;
        }

        let instance_id = request.instance_id;
        let slot = self.instances.get(&instance_id).map(|s| s.clone()).ok_or_else(|| {
            MigrationError::Structural(format!("Process instance not found: {}", instance_id))
        })?;
        let mut guard = slot.try_lock().map_err(|_| {
            MigrationError::Concurrency(format!("Process instance {} is locked by another operation", instance_id))
        })?;
        let graph = self
            .graph_for(&guard)
            .map_err(|e| MigrationError::Invariant(e.to_string()))?;
        let mut work = guard.clone();
        let mut txn = TxnLog::default();

        let plan = MigrationPlanner::new(&graph).plan(
            &work,
            &request.moves,
            &request.process_variables,
            &request.local_variables,
        )?;
        let outcome = TreeMutator::apply(&graph, &mut work, &mut txn, &plan)?;

        let mut queue: VecDeque<ExecutionId> = outcome.advance.into();
        let mut followups = self
            .advance(&graph, &mut work, &mut txn, &mut queue)
            .await
            .map_err(|e| MigrationError::Invariant(e.to_string()))?;
        followups.extend(
            outcome.orphaned_children.into_iter().map(|c| FollowUp::TerminateInstance { instance: c }),
        );

        self.commit(&mut guard, work, txn)
            .await
            .map_err(|e| MigrationError::Invariant(e.to_string()))?;
        drop(guard);
        self.drain_followups(followups)
            .await
            .map_err(|e| MigrationError::Invariant(e.to_string()))?;
        Ok(())
    }

    /// Cross-instance moves transfer control between two independently
    /// locked aggregates; the parent side is always locked first.
    async fn apply_cross_change(&self, request: ChangeStateRequest<'_>) -> Result<(), MigrationError> {
        if request.cross.len() != 1 || !request.moves.is_empty() {
            return Err(MigrationError::Structural(
                "A cross-instance move must be the sole operation of its request".to_string(),
            ));
        }
        match request.cross.into_iter().next().expect("one cross operation") {
            CrossMove::ToSubProcess { from, to, called_element, version } => {
                self.move_into_called_instance(request.instance_id, from, to, called_element, version).await
            }
            CrossMove::ToParent { from, to } => {
                self.move_into_parent_instance(request.instance_id, from, to).await
            }
        }
    }

    async fn move_into_called_instance(
        &self,
        instance_id: Uuid,
        from: String,
        to: String,
        called_element: String,
        version: Option<u32>,
    ) -> Result<(), MigrationError> {
        let slot = self.instances.get(&instance_id).map(|s| s.clone()).ok_or_else(|| {
            MigrationError::Structural(format!("Process instance not found: {}", instance_id))
        })?;
        let mut guard = slot.try_lock().map_err(|_| {
            MigrationError::Concurrency(format!("Process instance {} is locked by another operation", instance_id))
        })?;
        let graph = self
            .graph_for(&guard)
            .map_err(|e| MigrationError::Invariant(e.to_string()))?;

        let child_graph = self.definition(&called_element, version).ok_or_else(|| {
            MigrationError::Structural(match version {
                Some(v) => format!("Process definition '{}' version {} not found", called_element, v),
                None => format!("Process definition '{}' not found", called_element),
            })
        })?;
        child_graph.activity(&to).ok_or_else(|| {
            MigrationError::Structural(format!(
                "Activity '{}' not found in definition version {}",
                to, child_graph.version
            ))
        })?;
        let call_activity = graph
            .activities()
            .find(|n| matches!(&n.kind, ActivityKind::CallActivity { called_element: c, .. } if *c == called_element))
            .map(|n| n.id.clone())
            .ok_or_else(|| {
                MigrationError::Structural(format!("No call activity calls '{}'", called_element))
            })?;

        let mut work = guard.clone();
        let mut txn = TxnLog::default();
        let plan = MigrationPlanner::new(&graph).plan(
            &work,
            &[crate::migration::request::MoveOperation {
                sources: crate::migration::request::MoveSources::Activities(vec![from]),
                targets: vec![call_activity.clone()],
            }],
            &[],
            &[],
        )?;
        let outcome = TreeMutator::apply(&graph, &mut work, &mut txn, &plan)?;

        // The created call-activity execution waits on the child instead
        // of being interpreted.
        let call_execution = *outcome
            .advance
            .first()
            .ok_or_else(|| MigrationError::Invariant("call activity execution was not created".to_string()))?;
        {
            let execution = work
                .get_mut(call_execution)
                .ok_or_else(|| MigrationError::Invariant("call activity execution vanished".to_string()))?;
            execution.active = false;
        }
        txn.emit(LifecycleEvent::ActivityStarted {
            instance: work.id,
            execution: call_execution,
            activity: call_activity,
        });
        let child_id = Uuid::new_v4();
        work.child_instances.insert(call_execution, child_id);
        let vars = work.root_variables().clone();
        let link = CallActivityLink { parent_instance: work.id, parent_execution: call_execution };

        let mut followups: Vec<FollowUp> = outcome
            .orphaned_children
            .into_iter()
            .map(|c| FollowUp::TerminateInstance { instance: c })
            .collect();
        followups.push(FollowUp::StartChild {
            graph: child_graph,
            vars,
            link,
            start_at: StartAt::Activity(to),
            child_id,
        });

        self.commit(&mut guard, work, txn)
            .await
            .map_err(|e| MigrationError::Invariant(e.to_string()))?;
        drop(guard);
        self.drain_followups(followups)
            .await
            .map_err(|e| MigrationError::Invariant(e.to_string()))?;
        Ok(())
    }

    async fn move_into_parent_instance(
        &self,
        instance_id: Uuid,
        from: String,
        to: String,
    ) -> Result<(), MigrationError> {
        // Brief child read to learn the parent, then lock parent first.
        let child_slot = self.instances.get(&instance_id).map(|s| s.clone()).ok_or_else(|| {
            MigrationError::Structural(format!("Process instance not found: {}", instance_id))
        })?;
        let link = {
            let guard = child_slot.try_lock().map_err(|_| {
                MigrationError::Concurrency(format!(
                    "Process instance {} is locked by another operation",
                    instance_id
                ))
            })?;
            guard.parent_link.clone().ok_or_else(|| {
                MigrationError::Structural(format!(
                    "Process instance {} is not a called sub-process instance",
                    instance_id
                ))
            })?
        };
        let parent_slot = self.instances.get(&link.parent_instance).map(|s| s.clone()).ok_or_else(|| {
            MigrationError::Structural(format!("Parent instance {} not found", link.parent_instance))
        })?;
        let mut parent_guard = parent_slot.try_lock().map_err(|_| {
            MigrationError::Concurrency(format!(
                "Process instance {} is locked by another operation",
                link.parent_instance
            ))
        })?;
        let mut child_guard = child_slot.try_lock().map_err(|_| {
            MigrationError::Concurrency(format!("Process instance {} is locked by another operation", instance_id))
        })?;

        let parent_graph = self
            .graph_for(&parent_guard)
            .map_err(|e| MigrationError::Invariant(e.to_string()))?;
        let child_graph = self
            .graph_for(&child_guard)
            .map_err(|e| MigrationError::Invariant(e.to_string()))?;
        parent_graph.activity(&to).ok_or_else(|| {
            MigrationError::Structural(format!(
                "Activity '{}' not found in definition version {}",
                to, parent_graph.version
            ))
        })?;

        let mut child_work = child_guard.clone();
        let mut parent_work = parent_guard.clone();
        let mut txn = TxnLog::default();

        // Cancel the moved execution in the child with the ordinary cancel
        // phase (no creations there).
        let child_plan = MigrationPlanner::new(&child_graph).plan_cancellation(&child_work, &from)?;
        let child_outcome = TreeMutator::apply(&child_graph, &mut child_work, &mut txn, &child_plan)?;
        let mut followups: Vec<FollowUp> = child_outcome
            .orphaned_children
            .into_iter()
            .map(|c| FollowUp::TerminateInstance { instance: c })
            .collect();

        let child_drained = child_work
            .get(child_work.root)
            .map(|r| r.children.is_empty())
            .unwrap_or(true);
        if child_drained {
            child_work.completed = true;
            txn.op(StoreOp::ClearInstance { instance: child_work.id });
            // The call activity has nothing left to wait for.
            lifecycle::cancel_execution_tree(&mut parent_work, &mut txn, link.parent_execution);
        }

        // Create the target in the parent and run it.
        let parent_plan = MigrationPlanner::new(&parent_graph).plan_target_only(&parent_work, &to)?;
        let parent_outcome = TreeMutator::apply(&parent_graph, &mut parent_work, &mut txn, &parent_plan)?;
        let mut queue: VecDeque<ExecutionId> = parent_outcome.advance.into();
        followups.extend(
            self.advance(&parent_graph, &mut parent_work, &mut txn, &mut queue)
                .await
                .map_err(|e| MigrationError::Invariant(e.to_string()))?,
        );

        let child_finished = child_work.completed;
        let child_id = child_work.id;
        *child_guard = child_work;
        drop(child_guard);
        if child_finished {
            self.instances.remove(&child_id);
        }
        self.commit(&mut parent_guard, parent_work, txn)
            .await
            .map_err(|e| MigrationError::Invariant(e.to_string()))?;
        drop(parent_guard);
        self.drain_followups(followups)
            .await
            .map_err(|e| MigrationError::Invariant(e.to_string()))?;
        Ok(())
    }
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}
