use crate::dsl::{Activity, ActivityType, Edge, Process};
use crate::graph::{ActivityKind, ActivityNode, Flow, ProcessGraph};
use anyhow::{Result, anyhow};
use std::collections::{HashMap, HashSet, VecDeque};

/// Validating compiler from the authoring DSL to a flat [`ProcessGraph`].
///
/// Nested fragments are flattened into one arena with parent pointers;
/// synchronizing gateways get paired with their fork counterpart here so
/// the runtime never has to search for it.
pub struct Compiler;

impl Compiler {
    pub fn new() -> Self {
        Self
    }

    pub fn compile(&mut self, process: Process, version: u32) -> Result<ProcessGraph> {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        flatten(&process.activities, None, &mut nodes, &mut edges)?;
        edges.extend(process.edges.iter().cloned());

        // Pass 1: indexing
        let mut map: HashMap<String, ActivityNode> = HashMap::new();
        for node in nodes {
            if map.contains_key(&node.id) {
                return Err(anyhow!("Duplicate activity id: {}", node.id));
            }
            map.insert(node.id.clone(), node);
        }

        // Pass 2: sequence flows
        for edge in &edges {
            let source_parent = map
                .get(&edge.source)
                .ok_or_else(|| anyhow!("Edge source not found: {}", edge.source))?
                .parent
                .clone();
            let target_parent = map
                .get(&edge.target)
                .ok_or_else(|| anyhow!("Edge target not found: {}", edge.target))?
                .parent
                .clone();
            if source_parent != target_parent {
                return Err(anyhow!(
                    "Sequence flow {} -> {} crosses a scope boundary",
                    edge.source,
                    edge.target
                ));
            }
            if let Some(node) = map.get_mut(&edge.source) {
                node.outgoing.push(Flow { target: edge.target.clone(), condition: edge.condition.clone() });
            }
            if let Some(node) = map.get_mut(&edge.target) {
                node.incoming.push(edge.source.clone());
            }
        }

        // Pass 3: structural validation + event attachment
        let mut root_attached = Vec::new();
        let mut attach: Vec<(String, String)> = Vec::new();
        for node in map.values() {
            match &node.kind {
                ActivityKind::End => {
                    if !node.outgoing.is_empty() {
                        return Err(anyhow!("End activity {} has outgoing flows", node.id));
                    }
                }
                ActivityKind::ParallelGateway { .. } | ActivityKind::InclusiveGateway { .. } => {}
                ActivityKind::EventSubProcess { .. } => {
                    if !node.incoming.is_empty() || !node.outgoing.is_empty() {
                        return Err(anyhow!("Event sub-process {} cannot have sequence flows", node.id));
                    }
                    match &node.parent {
                        Some(scope) => attach.push((scope.clone(), node.id.clone())),
                        None => root_attached.push(node.id.clone()),
                    }
                }
                ActivityKind::BoundaryEvent { attached_to, .. } => {
                    let host = map
                        .get(attached_to)
                        .ok_or_else(|| anyhow!("Boundary event {} attached to unknown activity {}", node.id, attached_to))?;
                    if host.parent != node.parent {
                        return Err(anyhow!(
                            "Boundary event {} must live in the same scope as its host {}",
                            node.id,
                            attached_to
                        ));
                    }
                    match host.kind {
                        ActivityKind::Task { .. }
                        | ActivityKind::SubProcess
                        | ActivityKind::MultiInstance { .. }
                        | ActivityKind::CallActivity { .. } => {}
                        _ => return Err(anyhow!("Activity {} cannot host a boundary event", attached_to)),
                    }
                    attach.push((attached_to.clone(), node.id.clone()));
                }
                _ => {
                    if node.outgoing.len() > 1 {
                        return Err(anyhow!("Only gateways may fork; {} has multiple outgoing flows", node.id));
                    }
                }
            }
        }
        for (host, event) in attach {
            if let Some(node) = map.get_mut(&host) {
                node.attached.push(event);
            }
        }

        // Pass 4: start activities per scope
        let mut starts: HashMap<Option<String>, Vec<String>> = HashMap::new();
        for node in map.values() {
            if matches!(node.kind, ActivityKind::Start) {
                starts.entry(node.parent.clone()).or_default().push(node.id.clone());
            }
        }
        let root_starts = starts.remove(&None).unwrap_or_default();
        let start = match root_starts.as_slice() {
            [only] => only.clone(),
            [] => return Err(anyhow!("Start activity not found")),
            _ => return Err(anyhow!("Process has more than one start activity")),
        };
        let scope_ids: Vec<String> = map
            .values()
            .filter(|n| matches!(n.kind, ActivityKind::SubProcess | ActivityKind::EventSubProcess { .. }))
            .map(|n| n.id.clone())
            .collect();
        for scope in scope_ids {
            let inner = starts.remove(&Some(scope.clone())).unwrap_or_default();
            let inner_start = match inner.as_slice() {
                [only] => only.clone(),
                [] => return Err(anyhow!("Scope {} has no start activity", scope)),
                _ => return Err(anyhow!("Scope {} has more than one start activity", scope)),
            };
            if let Some(node) = map.get_mut(&scope) {
                node.start_activity = Some(inner_start);
            }
        }
        let mi_bodies: Vec<(String, String)> = map
            .values()
            .filter_map(|n| match &n.kind {
                ActivityKind::MultiInstance { body, .. } => Some((n.id.clone(), body.clone())),
                _ => None,
            })
            .collect();
        for (mi, body) in mi_bodies {
            if let Some(node) = map.get_mut(&mi) {
                node.start_activity = Some(body);
            }
        }

        // Pass 5: pair each synchronizing gateway with its fork
        let mut pairs = Vec::new();
        for node in map.values() {
            if node.is_synchronizing_gateway()
                && let Some(fork) = pair_fork(&map, node)
            {
                pairs.push((node.id.clone(), fork));
            }
        }
        for (join, fork) in pairs {
            if let Some(node) = map.get_mut(&join) {
                match &mut node.kind {
                    ActivityKind::ParallelGateway { fork_id } | ActivityKind::InclusiveGateway { fork_id } => {
                        *fork_id = Some(fork);
                    }
                    _ => {}
                }
            }
        }

        let mut graph = ProcessGraph {
            id: process.id,
            name: process.name,
            version,
            initial_variables: process.variables,
            start,
            root_attached,
            activities: HashMap::new(),
        };
        for (_, node) in map {
            graph.insert_activity(node);
        }
        Ok(graph)
    }
}

fn flatten(
    list: &[Activity],
    parent: Option<&str>,
    nodes: &mut Vec<ActivityNode>,
    edges: &mut Vec<Edge>,
) -> Result<()> {
    for activity in list {
        let kind = match &activity.kind {
            ActivityType::Start => ActivityKind::Start,
            ActivityType::End => ActivityKind::End,
            ActivityType::Task { handler, params, output } => ActivityKind::Task {
                handler: handler.clone(),
                params: params.clone(),
                output: output.clone(),
            },
            ActivityType::ParallelGateway => ActivityKind::ParallelGateway { fork_id: None },
            ActivityType::InclusiveGateway => ActivityKind::InclusiveGateway { fork_id: None },
            ActivityType::SubProcess { activities, edges: inner } => {
                flatten(activities, Some(&activity.id), nodes, edges)?;
                edges.extend(inner.iter().cloned());
                ActivityKind::SubProcess
            }
            ActivityType::MultiInstance { sequential, cardinality, completion_condition, body } => {
                if *cardinality == 0 {
                    return Err(anyhow!("Multi-instance {} needs a cardinality of at least 1", activity.id));
                }
                flatten(std::slice::from_ref(body.as_ref()), Some(&activity.id), nodes, edges)?;
                ActivityKind::MultiInstance {
                    sequential: *sequential,
                    cardinality: *cardinality,
                    completion_condition: completion_condition.clone(),
                    body: body.id.clone(),
                }
            }
            ActivityType::CallActivity { called_element, version } => ActivityKind::CallActivity {
                called_element: called_element.clone(),
                version: *version,
            },
            ActivityType::EventSubProcess { event, interrupting, activities, edges: inner } => {
                flatten(activities, Some(&activity.id), nodes, edges)?;
                edges.extend(inner.iter().cloned());
                ActivityKind::EventSubProcess { event: event.clone(), interrupting: *interrupting }
            }
            ActivityType::BoundaryEvent { attached_to, event, interrupting } => ActivityKind::BoundaryEvent {
                event: event.clone(),
                interrupting: *interrupting,
                attached_to: attached_to.clone(),
            },
        };
        nodes.push(ActivityNode {
            id: activity.id.clone(),
            kind,
            parent: parent.map(String::from),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            attached: Vec::new(),
            start_activity: None,
        });
    }
    Ok(())
}

/// Reverse walk from each incoming branch of `join`, intersecting the
/// same-kind fork gateways every branch can reach. The nearest shared one
/// is the fork whose branch count the join synchronizes on.
fn pair_fork(map: &HashMap<String, ActivityNode>, join: &ActivityNode) -> Option<String> {
    let same_kind = |kind: &ActivityKind| match join.kind {
        ActivityKind::ParallelGateway { .. } => matches!(kind, ActivityKind::ParallelGateway { .. }),
        ActivityKind::InclusiveGateway { .. } => matches!(kind, ActivityKind::InclusiveGateway { .. }),
        _ => false,
    };
    let mut first_order: Vec<String> = Vec::new();
    let mut common: Option<HashSet<String>> = None;
    for (i, source) in join.incoming.iter().enumerate() {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut queue = VecDeque::from([source.clone()]);
        while let Some(cur) = queue.pop_front() {
            if !seen.insert(cur.clone()) {
                continue;
            }
            let Some(node) = map.get(&cur) else { continue };
            if node.id != join.id && same_kind(&node.kind) && node.outgoing.len() > 1 {
                found.push(node.id.clone());
            }
            for prev in &node.incoming {
                queue.push_back(prev.clone());
            }
        }
        let set: HashSet<String> = found.iter().cloned().collect();
        if i == 0 {
            first_order = found;
        }
        common = Some(match common {
            None => set,
            Some(prev) => prev.intersection(&set).cloned().collect(),
        });
    }
    let common = common?;
    first_order.into_iter().find(|id| common.contains(id))
}
