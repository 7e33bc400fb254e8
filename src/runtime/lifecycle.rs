//! Scope lifecycle primitives shared by the step interpreter and the
//! migration mutator. Both sides create and tear scopes down through this
//! module only, so a migrated tree is indistinguishable from one the
//! interpreter produced by flowing there.

use crate::dsl::EventKind;
use crate::graph::{ActivityKind, ProcessGraph};
use crate::runtime::events::{LifecycleEvent, StoreOp, TxnLog};
use crate::runtime::instance::{ExecutionId, ProcessInstance};
use crate::runtime::storage::{EventSubscription, TimerJob};
use anyhow::{Result, anyhow};
use serde_json::Value;
use uuid::Uuid;

pub const NR_OF_INSTANCES: &str = "nrOfInstances";
pub const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
pub const NR_OF_LOOPS: &str = "nrOfLoops";

/// Creates the scope execution for `activity` under `parent`: local
/// variables first, then the scope itself, then its attached event
/// subscriptions and timers. Event order follows the lifecycle contract
/// (VARIABLE_CREATED*, ACTIVITY_STARTED, TIMER_SCHEDULED).
pub fn enter_scope(
    graph: &ProcessGraph,
    instance: &mut ProcessInstance,
    txn: &mut TxnLog,
    parent: ExecutionId,
    activity: &str,
    local_vars: &[(String, Value)],
    fork_origin: Option<String>,
) -> Result<ExecutionId> {
    let node = graph
        .activity(activity)
        .ok_or_else(|| anyhow!("Activity not found: {}", activity))?;
    let instance_id = instance.id;
    let scope = instance.create_execution(parent, Some(activity.to_string()), true, true, fork_origin);

    if let ActivityKind::MultiInstance { cardinality, .. } = &node.kind {
        let cardinality = *cardinality;
        let execution = instance.get_mut(scope).expect("scope execution just created");
        execution.is_mi_root = true;
        execution.variables.insert(NR_OF_INSTANCES.to_string(), Value::from(cardinality as i64));
        execution.variables.insert(NR_OF_ACTIVE_INSTANCES.to_string(), Value::from(0));
        execution.variables.insert(NR_OF_COMPLETED_INSTANCES.to_string(), Value::from(0));
        execution.variables.insert(NR_OF_LOOPS.to_string(), Value::from(0));
    }

    for (name, value) in local_vars {
        let execution = instance.get_mut(scope).expect("scope execution just created");
        execution.variables.insert(name.clone(), value.clone());
        txn.op(StoreOp::SetLocal {
            instance: instance_id,
            execution: scope,
            name: name.clone(),
            value: value.clone(),
        });
        txn.emit(LifecycleEvent::VariableCreated { instance: instance_id, scope, name: name.clone() });
    }

    txn.emit(LifecycleEvent::ActivityStarted {
        instance: instance_id,
        execution: scope,
        activity: activity.to_string(),
    });

    let attached = node.attached.clone();
    create_attached_events(graph, instance, txn, scope, &attached)?;
    Ok(scope)
}

/// Registers subscriptions and timers for the given boundary/start event
/// activities, owned by `owner`.
pub fn create_attached_events(
    graph: &ProcessGraph,
    instance: &mut ProcessInstance,
    txn: &mut TxnLog,
    owner: ExecutionId,
    attached: &[String],
) -> Result<()> {
    for event_activity in attached {
        let node = graph
            .activity(event_activity)
            .ok_or_else(|| anyhow!("Attached event activity not found: {}", event_activity))?;
        let Some((event, interrupting)) = node.event() else {
            return Err(anyhow!("Activity {} is not an event", event_activity));
        };
        match event.kind {
            EventKind::Signal | EventKind::Message => {
                let subscription = EventSubscription {
                    id: Uuid::new_v4(),
                    instance_id: instance.id,
                    execution_id: owner,
                    activity_id: event_activity.clone(),
                    kind: event.kind,
                    event_name: event.name.clone().unwrap_or_default(),
                    interrupting,
                };
                txn.op(StoreOp::CreateSubscription(subscription.clone()));
                instance.subscriptions.push(subscription);
            }
            EventKind::Timer => {
                let job = TimerJob {
                    id: Uuid::new_v4(),
                    instance_id: instance.id,
                    execution_id: owner,
                    activity_id: event_activity.clone(),
                    due_ms: event.due_ms.unwrap_or(0),
                };
                txn.op(StoreOp::ScheduleJob(job.clone()));
                instance.jobs.push(job);
                txn.emit(LifecycleEvent::TimerScheduled {
                    instance: instance.id,
                    execution: owner,
                    activity: event_activity.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Walks the missing scope levels between `under` and a target, outermost
/// first, reusing scope executions that already exist. `local_vars`
/// supplies deferred variable writes for newly created scopes.
pub fn build_scope_chain(
    graph: &ProcessGraph,
    instance: &mut ProcessInstance,
    txn: &mut TxnLog,
    mut under: ExecutionId,
    chain: &[String],
    local_vars: &dyn Fn(&str) -> Vec<(String, Value)>,
) -> Result<ExecutionId> {
    for scope_activity in chain {
        under = match instance.find_child_scope(under, scope_activity) {
            Some(existing) => existing,
            None => {
                let vars = local_vars(scope_activity);
                enter_scope(graph, instance, txn, under, scope_activity, &vars, None)?
            }
        };
    }
    Ok(under)
}

/// Drops subscriptions and timers owned by `execution`. `JOB_CANCELED` is
/// only emitted on cancellation paths; natural completion removes jobs
/// silently.
pub fn remove_owned_events(
    instance: &mut ProcessInstance,
    txn: &mut TxnLog,
    execution: ExecutionId,
    emit_job_canceled: bool,
) {
    let instance_id = instance.id;
    let mut removed_jobs = Vec::new();
    instance.jobs.retain(|job| {
        if job.execution_id == execution {
            removed_jobs.push((job.id, job.activity_id.clone()));
            false
        } else {
            true
        }
    });
    for (job_id, activity) in removed_jobs {
        txn.op(StoreOp::CancelJob { instance: instance_id, id: job_id });
        if emit_job_canceled {
            txn.emit(LifecycleEvent::JobCanceled { instance: instance_id, job: job_id, activity });
        }
    }
    let mut removed_subs = Vec::new();
    instance.subscriptions.retain(|sub| {
        if sub.execution_id == execution {
            removed_subs.push(sub.id);
            false
        } else {
            true
        }
    });
    for sub_id in removed_subs {
        txn.op(StoreOp::CancelSubscription { instance: instance_id, id: sub_id });
    }
}

pub struct CancelOutcome {
    /// Child process instances orphaned by cancelled call-activity
    /// executions; the engine terminates them separately.
    pub orphaned_children: Vec<Uuid>,
}

/// Cancels a whole subtree, innermost first: timers (JOB_CANCELED), then
/// subscriptions, then ACTIVITY_CANCELLED per removed activity-execution.
pub fn cancel_execution_tree(
    instance: &mut ProcessInstance,
    txn: &mut TxnLog,
    execution: ExecutionId,
) -> CancelOutcome {
    let mut orphaned = Vec::new();
    let instance_id = instance.id;
    for exec_id in instance.subtree_innermost_first(execution) {
        remove_owned_events(instance, txn, exec_id, true);
        instance.forks.retain(|(scope, _), _| *scope != exec_id);
        if let Some(child) = instance.child_instances.remove(&exec_id) {
            orphaned.push(child);
        }
        if let Some(removed) = instance.detach_remove(exec_id)
            && let Some(activity) = removed.activity
        {
            txn.emit(LifecycleEvent::ActivityCancelled {
                instance: instance_id,
                execution: exec_id,
                activity,
            });
        }
    }
    CancelOutcome { orphaned_children: orphaned }
}
