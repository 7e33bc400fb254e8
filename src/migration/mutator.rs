use crate::graph::ProcessGraph;
use crate::migration::MigrationError;
use crate::migration::planner::MigrationPlan;
use crate::runtime::events::{LifecycleEvent, StoreOp, TxnLog};
use crate::runtime::instance::{ExecutionId, ProcessInstance};
use crate::runtime::{lifecycle, sync};
use uuid::Uuid;

/// Result of applying a plan: leaf executions the interpreter still has
/// to run (activation, gateway synchronization, handler execution) and
/// called instances orphaned by the cancel phase.
#[derive(Debug, Default)]
pub struct MutationOutcome {
    pub advance: Vec<ExecutionId>,
    pub orphaned_children: Vec<Uuid>,
}

/// Applies a [`MigrationPlan`] in three phases: cancel innermost-first,
/// scope creation outermost-first, leaf activation. The caller hands in a
/// working copy of the aggregate; any error leaves the original untouched.
pub struct TreeMutator;

impl TreeMutator {
    pub fn apply(
        graph: &ProcessGraph,
        instance: &mut ProcessInstance,
        txn: &mut TxnLog,
        plan: &MigrationPlan,
    ) -> Result<MutationOutcome, MigrationError> {
        let instance_id = instance.id;
        let mut outcome = MutationOutcome::default();

        // Process-variable writes land before the cancel phase.
        for (name, value) in &plan.global_writes {
            let root = instance.root;
            let vars = &mut instance
                .get_mut(root)
                .ok_or_else(|| MigrationError::Invariant("root execution missing".to_string()))?
                .variables;
            let created = !vars.contains_key(name);
            vars.insert(name.clone(), value.clone());
            txn.op(StoreOp::SetGlobal { instance: instance_id, name: name.clone(), value: value.clone() });
            if created {
                txn.emit(LifecycleEvent::VariableCreated {
                    instance: instance_id,
                    scope: root,
                    name: name.clone(),
                });
            }
        }

        // Phase 1: cancellation, innermost-first.
        for root in &plan.cancel_roots {
            if !instance.contains(*root) {
                return Err(MigrationError::Invariant(format!(
                    "Cancel target {} vanished during apply",
                    root
                )));
            }
            let cancelled = lifecycle::cancel_execution_tree(instance, txn, *root);
            outcome.orphaned_children.extend(cancelled.orphaned_children);
        }
        for id in &plan.subscription_prunes {
            if instance.subscriptions.iter().any(|s| s.id == *id) {
                instance.subscriptions.retain(|s| s.id != *id);
                txn.op(StoreOp::CancelSubscription { instance: instance_id, id: *id });
            }
        }
        for id in &plan.job_prunes {
            if let Some(job) = instance.jobs.iter().find(|j| j.id == *id).cloned() {
                instance.jobs.retain(|j| j.id != *id);
                txn.op(StoreOp::CancelJob { instance: instance_id, id: *id });
                txn.emit(LifecycleEvent::JobCanceled {
                    instance: instance_id,
                    job: job.id,
                    activity: job.activity_id,
                });
            }
        }
        Self::sweep_empty_scopes(instance, txn, plan, &mut outcome);

        // Phase 2: local writes for scopes that already exist.
        for (execution, name, value) in &plan.existing_local_writes {
            let vars = &mut instance
                .get_mut(*execution)
                .ok_or_else(|| {
                    MigrationError::Invariant(format!("Scope execution {} vanished during apply", execution))
                })?
                .variables;
            vars.insert(name.clone(), value.clone());
            txn.op(StoreOp::SetLocal {
                instance: instance_id,
                execution: *execution,
                name: name.clone(),
                value: value.clone(),
            });
            txn.emit(LifecycleEvent::VariableCreated {
                instance: instance_id,
                scope: *execution,
                name: name.clone(),
            });
        }

        // Synchronization deltas keep the join arithmetic closed under the
        // move before any arrival is evaluated.
        for (scope, gateway, delta) in &plan.fork_deltas {
            sync::adjust_fork_expected(instance, *scope, gateway, *delta);
        }

        // Phases 2+3: scope chains outermost-first, then the leaves. The
        // leaves are handed back for interpretation, which is where
        // synchronizing-gateway targets defer to the coordinator instead
        // of running past the join.
        for creation in &plan.creations {
            let under = match creation.anchor {
                Some(anchor) => {
                    if !instance.contains(anchor) {
                        return Err(MigrationError::Invariant(format!(
                            "Anchor scope {} vanished during apply",
                            anchor
                        )));
                    }
                    anchor
                }
                None => instance.root,
            };
            let parent = lifecycle::build_scope_chain(graph, instance, txn, under, &creation.chain, &|scope| {
                plan.pending_local_writes.get(scope).cloned().unwrap_or_default()
            })
            .map_err(|e| MigrationError::Invariant(e.to_string()))?;
            let leaf = instance.create_execution(
                parent,
                Some(creation.target.clone()),
                false,
                true,
                creation.fork_origin.clone(),
            );
            let parent_is_mi = instance.get(parent).map(|e| e.is_mi_root).unwrap_or(false);
            if parent_is_mi && creation.mi_spawn {
                sync::mi_register_spawn(instance, parent);
            }
            outcome.advance.push(leaf);
        }

        Ok(outcome)
    }

    /// Scopes drained by the cancel phase and not reused by any creation
    /// are torn down too, innermost first.
    fn sweep_empty_scopes(
        instance: &mut ProcessInstance,
        txn: &mut TxnLog,
        plan: &MigrationPlan,
        outcome: &mut MutationOutcome,
    ) {
        loop {
            let empty: Vec<ExecutionId> = instance
                .dfs()
                .into_iter()
                .rev()
                .filter(|id| {
                    *id != instance.root
                        && !plan.keep_alive.contains(id)
                        && instance
                            .get(*id)
                            .map(|e| e.is_scope && e.children.is_empty())
                            .unwrap_or(false)
                })
                .collect();
            if empty.is_empty() {
                break;
            }
            for id in empty {
                if instance.contains(id) {
                    let cancelled = lifecycle::cancel_execution_tree(instance, txn, id);
                    outcome.orphaned_children.extend(cancelled.orphaned_children);
                }
            }
        }
    }
}
