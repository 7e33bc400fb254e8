use crate::graph::{ActivityKind, ProcessGraph};
use crate::migration::MigrationError;
use crate::migration::request::{MoveOperation, ScopeRef};
use crate::migration::resolver::{ScopeResolver, TargetCreation};
use crate::runtime::instance::{ExecutionId, ProcessInstance};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Ordered, side-effect-free migration plan. Nothing here touches the
/// tree; the mutator applies it phase by phase.
#[derive(Debug, Default)]
pub struct MigrationPlan {
    /// Process-variable writes, applied before the cancel phase in
    /// request order.
    pub global_writes: Vec<(String, Value)>,
    /// Cancel set, deepest scope first.
    pub cancel_roots: Vec<ExecutionId>,
    /// Scope executions the empty-scope sweep must not remove because a
    /// creation reuses them.
    pub keep_alive: HashSet<ExecutionId>,
    /// Create set, one entry per new leaf, scope chains shallowest first.
    pub creations: Vec<TargetCreation>,
    /// Fork-instance expected-count corrections.
    pub fork_deltas: Vec<(ExecutionId, String, i64)>,
    /// Event-subprocess registrations left without active context by this
    /// plan; removed at the end of the cancel phase.
    pub subscription_prunes: Vec<Uuid>,
    pub job_prunes: Vec<Uuid>,
    /// Local writes for scopes that already exist.
    pub existing_local_writes: Vec<(ExecutionId, String, Value)>,
    /// Local writes for scopes the creation phase will build, keyed by
    /// scope activity.
    pub pending_local_writes: HashMap<String, Vec<(String, Value)>>,
}

/// Validates a whole change-state request against a single pre-move tree
/// snapshot and produces a [`MigrationPlan`]. No mutation happens until
/// the full request has validated.
pub struct MigrationPlanner<'a> {
    graph: &'a ProcessGraph,
}

impl<'a> MigrationPlanner<'a> {
    pub fn new(graph: &'a ProcessGraph) -> Self {
        Self { graph }
    }

    pub fn plan(
        &self,
        instance: &ProcessInstance,
        moves: &[MoveOperation],
        process_variables: &[(String, Value)],
        local_variables: &[(ScopeRef, String, Value)],
    ) -> Result<MigrationPlan, MigrationError> {
        let resolver = ScopeResolver::new(self.graph, instance);

        let mut cancel_roots: Vec<ExecutionId> = Vec::new();
        let mut creations: Vec<TargetCreation> = Vec::new();
        let mut fork_deltas = Vec::new();
        for op in moves {
            let resolved = resolver.resolve(op)?;
            cancel_roots.extend(resolved.cancel_roots);
            creations.extend(resolved.creations);
            fork_deltas.extend(resolved.fork_delta);
        }

        // Cross-operation dedupe, then deepest first.
        let root_set: HashSet<ExecutionId> = cancel_roots.iter().copied().collect();
        let mut seen = HashSet::new();
        cancel_roots.retain(|r| {
            seen.insert(*r) && !instance.ancestors(*r).iter().any(|a| root_set.contains(a))
        });
        cancel_roots.sort_by_key(|r| std::cmp::Reverse(instance.ancestors(*r).len()));

        let mut cancelled: HashSet<ExecutionId> = HashSet::new();
        for root in &cancel_roots {
            cancelled.extend(instance.subtree(*root));
        }

        // An anchor consumed by another operation of the same request
        // falls back to a plain chain walk from the process root.
        for creation in &mut creations {
            if let Some(anchor) = creation.anchor
                && cancelled.contains(&anchor)
            {
                creation.anchor = None;
                creation.chain = self.graph.scope_chain(&creation.target);
                creation.fork_origin = None;
            }
        }

        let keep_alive = self.keep_alive(instance, &cancelled, &creations);
        let (existing_local_writes, pending_local_writes) =
            self.resolve_local_writes(instance, &cancelled, &creations, local_variables)?;
        let (subscription_prunes, job_prunes) = self.compute_prunes(instance, &cancelled, &creations);

        Ok(MigrationPlan {
            global_writes: process_variables.to_vec(),
            cancel_roots,
            keep_alive,
            creations,
            fork_deltas,
            subscription_prunes,
            job_prunes,
            existing_local_writes,
            pending_local_writes,
        })
    }

    /// Cancel-only plan: used when control leaves for another process
    /// instance.
    pub fn plan_cancellation(
        &self,
        instance: &ProcessInstance,
        from: &str,
    ) -> Result<MigrationPlan, MigrationError> {
        let resolver = ScopeResolver::new(self.graph, instance);
        let mut cancel_roots = resolver.resolve_cancellation(from)?;
        cancel_roots.sort_by_key(|r| std::cmp::Reverse(instance.ancestors(*r).len()));
        let mut cancelled: HashSet<ExecutionId> = HashSet::new();
        for root in &cancel_roots {
            cancelled.extend(instance.subtree(*root));
        }
        let (subscription_prunes, job_prunes) = self.compute_prunes(instance, &cancelled, &[]);
        let mut keep_alive = HashSet::new();
        keep_alive.insert(instance.root);
        Ok(MigrationPlan {
            cancel_roots,
            keep_alive,
            subscription_prunes,
            job_prunes,
            ..MigrationPlan::default()
        })
    }

    /// Creation-only plan: used when control arrives from another process
    /// instance.
    pub fn plan_target_only(
        &self,
        instance: &ProcessInstance,
        to: &str,
    ) -> Result<MigrationPlan, MigrationError> {
        let resolver = ScopeResolver::new(self.graph, instance);
        let creations = vec![resolver.creation_from_root(to)?];
        let keep_alive = self.keep_alive(instance, &HashSet::new(), &creations);
        Ok(MigrationPlan { creations, keep_alive, ..MigrationPlan::default() })
    }

    /// Scope executions that survive the cancel phase because creations
    /// anchor on or reuse them.
    fn keep_alive(
        &self,
        instance: &ProcessInstance,
        cancelled: &HashSet<ExecutionId>,
        creations: &[TargetCreation],
    ) -> HashSet<ExecutionId> {
        let mut keep = HashSet::new();
        keep.insert(instance.root);
        for creation in creations {
            let mut under = creation.anchor.unwrap_or(instance.root);
            if let Some(anchor) = creation.anchor {
                keep.insert(anchor);
                keep.extend(instance.ancestors(anchor));
            }
            for scope_activity in &creation.chain {
                match instance.find_child_scope(under, scope_activity) {
                    Some(existing) if !cancelled.contains(&existing) => {
                        keep.insert(existing);
                        under = existing;
                    }
                    _ => break,
                }
            }
        }
        keep
    }

    fn resolve_local_writes(
        &self,
        instance: &ProcessInstance,
        cancelled: &HashSet<ExecutionId>,
        creations: &[TargetCreation],
        local_variables: &[(ScopeRef, String, Value)],
    ) -> Result<(Vec<(ExecutionId, String, Value)>, HashMap<String, Vec<(String, Value)>>), MigrationError>
    {
        let mut existing = Vec::new();
        let mut pending: HashMap<String, Vec<(String, Value)>> = HashMap::new();
        for (scope_ref, name, value) in local_variables {
            match scope_ref {
                ScopeRef::Execution(id) => {
                    if cancelled.contains(id) || !instance.contains(*id) {
                        return Err(MigrationError::Structural(format!(
                            "Scope execution {} not found for local variable '{}'",
                            id, name
                        )));
                    }
                    if !instance.get(*id).map(|e| e.is_scope).unwrap_or(false) {
                        return Err(MigrationError::Structural(format!(
                            "Execution {} is not a scope",
                            id
                        )));
                    }
                    existing.push((*id, name.clone(), value.clone()));
                }
                ScopeRef::Activity(activity) => {
                    let surviving = instance.executions_at(activity).into_iter().find(|e| {
                        !cancelled.contains(e)
                            && instance.get(*e).map(|x| x.is_scope).unwrap_or(false)
                    });
                    if let Some(execution) = surviving {
                        existing.push((execution, name.clone(), value.clone()));
                    } else if creations.iter().any(|c| c.chain.iter().any(|s| s == activity)) {
                        pending
                            .entry(activity.clone())
                            .or_default()
                            .push((name.clone(), value.clone()));
                    } else {
                        return Err(MigrationError::Structural(format!(
                            "Scope '{}' not found for local variable '{}'",
                            activity, name
                        )));
                    }
                }
            }
        }
        Ok((existing, pending))
    }

    /// Event-subprocess start registrations whose scope is left with no
    /// active context by this plan, independent of the interrupting flag.
    /// Boundary registrations die with their host execution instead.
    fn compute_prunes(
        &self,
        instance: &ProcessInstance,
        cancelled: &HashSet<ExecutionId>,
        creations: &[TargetCreation],
    ) -> (Vec<Uuid>, Vec<Uuid>) {
        let mut subscriptions = Vec::new();
        let mut jobs = Vec::new();
        for sub in &instance.subscriptions {
            if self.is_event_sub_process(&sub.activity_id)
                && !cancelled.contains(&sub.execution_id)
                && !self.scope_keeps_event(instance, cancelled, creations, sub.execution_id, &sub.activity_id)
            {
                subscriptions.push(sub.id);
            }
        }
        for job in &instance.jobs {
            if self.is_event_sub_process(&job.activity_id)
                && !cancelled.contains(&job.execution_id)
                && !self.scope_keeps_event(instance, cancelled, creations, job.execution_id, &job.activity_id)
            {
                jobs.push(job.id);
            }
        }
        (subscriptions, jobs)
    }

    fn is_event_sub_process(&self, activity: &str) -> bool {
        matches!(
            self.graph.activity(activity).map(|n| &n.kind),
            Some(ActivityKind::EventSubProcess { .. })
        )
    }

    /// Post-move simulation: does the owning scope keep at least one
    /// active execution outside the event sub-process's own instances?
    fn scope_keeps_event(
        &self,
        instance: &ProcessInstance,
        cancelled: &HashSet<ExecutionId>,
        creations: &[TargetCreation],
        owner: ExecutionId,
        esp: &str,
    ) -> bool {
        let mut stack: Vec<ExecutionId> =
            instance.get(owner).map(|s| s.children.clone()).unwrap_or_default();
        while let Some(id) = stack.pop() {
            if cancelled.contains(&id) {
                continue;
            }
            let Some(execution) = instance.get(id) else { continue };
            if execution.activity.as_deref() == Some(esp) {
                continue;
            }
            if execution.active && !execution.is_scope {
                return true;
            }
            stack.extend(execution.children.iter().copied());
        }
        let owner_activity = instance.get(owner).and_then(|e| e.activity.clone());
        creations.iter().any(|c| {
            self.creation_lands_in(instance, c, owner, owner_activity.as_deref())
                && !self.creation_inside(instance, c, esp)
        })
    }

    fn creation_lands_in(
        &self,
        instance: &ProcessInstance,
        creation: &TargetCreation,
        scope: ExecutionId,
        scope_activity: Option<&str>,
    ) -> bool {
        if let Some(anchor) = creation.anchor {
            if anchor == scope || instance.ancestors(anchor).contains(&scope) {
                return true;
            }
            scope_activity
                .map(|a| creation.chain.iter().any(|s| s == a))
                .unwrap_or(false)
        } else {
            match scope_activity {
                None => true,
                Some(a) => creation.chain.iter().any(|s| s == a),
            }
        }
    }

    fn creation_inside(
        &self,
        instance: &ProcessInstance,
        creation: &TargetCreation,
        esp: &str,
    ) -> bool {
        if creation.chain.iter().any(|s| s == esp) || creation.target == esp {
            return true;
        }
        if let Some(anchor) = creation.anchor {
            let mut ids = vec![anchor];
            ids.extend(instance.ancestors(anchor));
            return ids.into_iter().any(|id| {
                instance.get(id).map(|e| e.activity.as_deref() == Some(esp)).unwrap_or(false)
            });
        }
        false
    }
}
