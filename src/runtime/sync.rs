//! Synchronization coordinator: gateway-join and multi-instance counting
//! semantics. The interpreter and the migration mutator both call in here,
//! which is what makes a migrated arrival interchangeable with a natural
//! one.

use crate::graph::{ActivityKind, ProcessGraph};
use crate::runtime::expr;
use crate::runtime::instance::{ExecutionId, ForkInstance, ProcessInstance};
use crate::runtime::lifecycle::{
    NR_OF_ACTIVE_INSTANCES, NR_OF_COMPLETED_INSTANCES, NR_OF_INSTANCES, NR_OF_LOOPS,
};
use anyhow::{Result, anyhow};
use serde_json::Value;

#[derive(Debug)]
pub enum JoinOutcome {
    /// Arrival parked; the join still waits for more branches.
    Wait,
    /// All expected branches accounted for: the parked executions are
    /// consumed and a single continuation fires.
    Fire { consumed: Vec<ExecutionId>, origin: Option<String> },
}

#[derive(Debug)]
pub enum MiOutcome {
    /// Sequential loop: spawn the next iteration at the body activity.
    SpawnNext(String),
    /// Loop finished; the wrapper completes like a normal activity.
    Completed,
    /// Parallel loop with iterations still running.
    Wait,
}

/// Records branch accounting at fork time. `expected` is the number of
/// branches actually activated, which for inclusive gateways may be fewer
/// than the outgoing flows.
pub fn register_fork(
    instance: &mut ProcessInstance,
    scope: ExecutionId,
    gateway: &str,
    expected: u32,
    outer_origin: Option<String>,
) {
    instance
        .forks
        .insert((scope, gateway.to_string()), ForkInstance { expected, completed: 0, outer_origin });
}

/// Adjusts the expected-branch count of a fork instance; used by migration
/// fan-out/fan-in so the join arithmetic stays closed under moves.
pub fn adjust_fork_expected(instance: &mut ProcessInstance, scope: ExecutionId, gateway: &str, delta: i64) {
    if let Some(fork) = instance.forks.get_mut(&(scope, gateway.to_string())) {
        let adjusted = fork.expected as i64 + delta;
        fork.expected = adjusted.max(0) as u32;
    }
}

fn fork_key<'a>(graph: &'a ProcessGraph, join_activity: &'a str) -> &'a str {
    graph
        .activity(join_activity)
        .and_then(|n| n.fork_pair())
        .unwrap_or(join_activity)
}

/// Evaluates a join after an arrival parked (or a branch completed).
///
/// Parallel joins count every parked execution at the gateway; inclusive
/// joins only count branches that carry the fork's lineage, so a migrated
/// token that never belonged to the fork does not contribute. A join whose
/// fork never ran gets a fork instance with the static incoming count.
pub fn evaluate_join(
    graph: &ProcessGraph,
    instance: &mut ProcessInstance,
    scope: ExecutionId,
    join_activity: &str,
) -> Result<JoinOutcome> {
    let node = graph
        .activity(join_activity)
        .ok_or_else(|| anyhow!("Activity not found: {}", join_activity))?;
    let inclusive = matches!(node.kind, ActivityKind::InclusiveGateway { .. });
    let key = fork_key(graph, join_activity).to_string();
    let static_expected = node.incoming.len() as u32;

    let fork = instance
        .forks
        .entry((scope, key.clone()))
        .or_insert_with(|| ForkInstance { expected: static_expected, completed: 0, outer_origin: None });
    let expected = fork.expected;
    let completed = fork.completed;
    let origin = fork.outer_origin.clone();

    let parked: Vec<ExecutionId> = instance
        .get(scope)
        .map(|s| s.children.clone())
        .unwrap_or_default()
        .into_iter()
        .filter(|c| {
            instance
                .get(*c)
                .map(|e| {
                    !e.is_scope
                        && !e.active
                        && e.activity.as_deref() == Some(join_activity)
                        && (!inclusive || e.fork_origin.as_deref() == Some(key.as_str()))
                })
                .unwrap_or(false)
        })
        .collect();

    if parked.len() as u32 + completed >= expected {
        instance.forks.remove(&(scope, key));
        Ok(JoinOutcome::Fire { consumed: parked, origin })
    } else {
        Ok(JoinOutcome::Wait)
    }
}

/// A branch of `fork_id` ended without reaching a join. Completed branches
/// count toward the fork's expected total, so a parked join may now fire.
pub fn branch_completed(
    graph: &ProcessGraph,
    instance: &mut ProcessInstance,
    scope: ExecutionId,
    fork_id: &str,
) -> Result<Option<(String, JoinOutcome)>> {
    let key = (scope, fork_id.to_string());
    match instance.forks.get_mut(&key) {
        Some(fork) => fork.completed += 1,
        None => return Ok(None),
    }

    let parked_join = instance
        .get(scope)
        .map(|s| s.children.clone())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|c| instance.get(c))
        .filter(|e| !e.is_scope && !e.active)
        .filter_map(|e| e.activity.clone())
        .find(|activity| {
            graph
                .activity(activity)
                .map(|n| n.is_synchronizing_gateway() && fork_key(graph, activity) == fork_id)
                .unwrap_or(false)
        });

    match parked_join {
        Some(join) => match evaluate_join(graph, instance, scope, &join)? {
            JoinOutcome::Wait => Ok(None),
            fire => Ok(Some((join, fire))),
        },
        None => {
            // Every branch ran to an end event; nothing waits at a join.
            if let Some(fork) = instance.forks.get(&key)
                && fork.completed >= fork.expected
            {
                instance.forks.remove(&key);
            }
            Ok(None)
        }
    }
}

fn counter(instance: &ProcessInstance, mi_root: ExecutionId, name: &str) -> i64 {
    instance
        .get(mi_root)
        .and_then(|e| e.variables.get(name))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn set_counter(instance: &mut ProcessInstance, mi_root: ExecutionId, name: &str, value: i64) {
    if let Some(execution) = instance.get_mut(mi_root) {
        execution.variables.insert(name.to_string(), Value::from(value));
    }
}

/// Bookkeeping for a newly spawned iteration.
pub fn mi_register_spawn(instance: &mut ProcessInstance, mi_root: ExecutionId) {
    let active = counter(instance, mi_root, NR_OF_ACTIVE_INSTANCES);
    let loops = counter(instance, mi_root, NR_OF_LOOPS);
    set_counter(instance, mi_root, NR_OF_ACTIVE_INSTANCES, active + 1);
    set_counter(instance, mi_root, NR_OF_LOOPS, loops + 1);
}

/// Normal completion path of one iteration: decrement active, increment
/// completed, evaluate the completion condition. Migrated iterations go
/// through the exact same accounting.
pub fn mi_iteration_completed(
    graph: &ProcessGraph,
    instance: &mut ProcessInstance,
    mi_root: ExecutionId,
) -> Result<MiOutcome> {
    let activity = instance
        .get(mi_root)
        .and_then(|e| e.activity.clone())
        .ok_or_else(|| anyhow!("Multi-instance root has no activity"))?;
    let node = graph
        .activity(&activity)
        .ok_or_else(|| anyhow!("Activity not found: {}", activity))?;
    let ActivityKind::MultiInstance { sequential, completion_condition, body, .. } = &node.kind else {
        return Err(anyhow!("Activity {} is not a multi-instance wrapper", activity));
    };

    let active = counter(instance, mi_root, NR_OF_ACTIVE_INSTANCES) - 1;
    let completed = counter(instance, mi_root, NR_OF_COMPLETED_INSTANCES) + 1;
    set_counter(instance, mi_root, NR_OF_ACTIVE_INSTANCES, active);
    set_counter(instance, mi_root, NR_OF_COMPLETED_INSTANCES, completed);
    let total = counter(instance, mi_root, NR_OF_INSTANCES);

    if let Some(condition) = completion_condition {
        let vars = instance.merged_variables(mi_root);
        if expr::eval_bool(condition, &vars) {
            return Ok(MiOutcome::Completed);
        }
    }
    if *sequential {
        if completed < total { Ok(MiOutcome::SpawnNext(body.clone())) } else { Ok(MiOutcome::Completed) }
    } else if active <= 0 && completed >= total {
        Ok(MiOutcome::Completed)
    } else {
        Ok(MiOutcome::Wait)
    }
}
