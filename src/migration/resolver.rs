use crate::graph::{ActivityKind, ProcessGraph};
use crate::migration::MigrationError;
use crate::migration::request::{MoveOperation, MoveSources};
use crate::runtime::instance::{ExecutionId, ProcessInstance};
use std::collections::HashSet;

/// Recipe for one execution to create: the scope execution to build
/// under (`None` = process root), the scope activities still missing
/// below it (outermost first), and the leaf activity itself.
#[derive(Debug, Clone)]
pub struct TargetCreation {
    pub anchor: Option<ExecutionId>,
    pub chain: Vec<String>,
    pub target: String,
    pub fork_origin: Option<String>,
    /// Whether the leaf counts as a fresh iteration when it lands
    /// directly inside a multi-instance scope. Intra-boundary moves
    /// preserve the loop counters instead.
    pub mi_spawn: bool,
}

/// Resolution of a single move operation against one tree snapshot.
#[derive(Debug, Clone)]
pub struct ResolvedMove {
    /// Executions to cancel, still in request order; overlapping
    /// descendants are already dropped.
    pub cancel_roots: Vec<ExecutionId>,
    pub creations: Vec<TargetCreation>,
    /// (scope execution, fork gateway, expected-count delta) when the
    /// moved branches carry fork lineage and the move changes how many of
    /// them exist.
    pub fork_delta: Option<(ExecutionId, String, i64)>,
}

/// Computes common ancestors and the minimal cancel/create scope chains
/// for a requested migration, using graph containment.
pub struct ScopeResolver<'a> {
    graph: &'a ProcessGraph,
    instance: &'a ProcessInstance,
}

impl<'a> ScopeResolver<'a> {
    pub fn new(graph: &'a ProcessGraph, instance: &'a ProcessInstance) -> Self {
        Self { graph, instance }
    }

    pub fn resolve(&self, op: &MoveOperation) -> Result<ResolvedMove, MigrationError> {
        for target in &op.targets {
            self.require_activity(target)?;
        }
        let (sources, fan_in) = self.resolve_sources(&op.sources)?;
        self.check_mi_boundaries(&sources, &op.targets)?;

        let mut creations = Vec::new();
        let mut fork_delta = None;

        if op.targets.len() > 1 {
            // Fan-out: a single source spreads over all targets.
            if sources.len() != 1 {
                return Err(MigrationError::Structural(format!(
                    "Fan-out requires exactly one source execution, found {}",
                    sources.len()
                )));
            }
            for target in &op.targets {
                creations.push(self.creation_for(Some(sources[0]), target)?);
            }
            if let Some((scope, origin)) = self.shared_lineage(&sources, &creations) {
                fork_delta = Some((scope, origin, op.targets.len() as i64 - 1));
            }
        } else {
            let target = op
                .targets
                .first()
                .ok_or_else(|| MigrationError::Structural("Move operation has no target".to_string()))?;
            if fan_in && sources.len() > 1 {
                // Fan-in: every source collapses into one new execution.
                creations.push(self.creation_for(Some(sources[0]), target)?);
                if let Some((scope, origin)) = self.shared_lineage(&sources, &creations) {
                    fork_delta = Some((scope, origin, 1 - sources.len() as i64));
                }
            } else {
                // One new execution per moved execution.
                for source in &sources {
                    creations.push(self.creation_for(Some(*source), target)?);
                }
            }
        }

        Ok(ResolvedMove { cancel_roots: self.dedupe_roots(sources), creations, fork_delta })
    }

    /// Creation recipe for a target with no surviving source context, used
    /// when control arrives from another process instance.
    pub fn creation_from_root(&self, target: &str) -> Result<TargetCreation, MigrationError> {
        self.creation_for(None, target)
    }

    /// Cancel set for an activity without any replacement, used when
    /// control leaves for another process instance.
    pub fn resolve_cancellation(&self, activity: &str) -> Result<Vec<ExecutionId>, MigrationError> {
        let (sources, _) =
            self.resolve_sources(&MoveSources::Activities(vec![activity.to_string()]))?;
        Ok(self.dedupe_roots(sources))
    }

    fn require_activity(&self, id: &str) -> Result<&crate::graph::ActivityNode, MigrationError> {
        self.graph.activity(id).ok_or_else(|| {
            MigrationError::Structural(format!(
                "Activity '{}' not found in definition version {}",
                id, self.graph.version
            ))
        })
    }

    /// Resolves sources to execution ids. The second component is true
    /// when the request named several sources explicitly (fan-in shape).
    fn resolve_sources(&self, sources: &MoveSources) -> Result<(Vec<ExecutionId>, bool), MigrationError> {
        match sources {
            MoveSources::Activities(activities) => {
                if activities.is_empty() {
                    return Err(MigrationError::Structural("Move operation has no source".to_string()));
                }
                let mut out = Vec::new();
                for activity in activities {
                    self.require_activity(activity)?;
                    let found = self.instance.executions_at(activity);
                    if found.is_empty() {
                        return Err(MigrationError::Structural(format!(
                            "Active execution for activity '{}' not found",
                            activity
                        )));
                    }
                    out.extend(found);
                }
                Ok((out, activities.len() > 1))
            }
            MoveSources::Executions(ids) => {
                for id in ids {
                    if !self.instance.contains(*id) {
                        return Err(MigrationError::Structural(format!("Execution {} not found", id)));
                    }
                }
                if ids.is_empty() {
                    return Err(MigrationError::Structural("Move operation has no source".to_string()));
                }
                Ok((ids.clone(), ids.len() > 1))
            }
        }
    }

    /// Iteration executions may only move inside their own multi-instance
    /// boundary; only the root may leave.
    fn check_mi_boundaries(&self, sources: &[ExecutionId], targets: &[String]) -> Result<(), MigrationError> {
        for source in sources {
            let Some(activity) = self.instance.get(*source).and_then(|e| e.activity.clone()) else {
                continue;
            };
            let node = self.require_activity(&activity)?;
            if matches!(node.kind, ActivityKind::MultiInstance { .. }) {
                // Moving the root relocates the entire loop as one unit.
                continue;
            }
            if let Some(boundary) = self.graph.mi_boundary(&activity) {
                for target in targets {
                    if !self.graph.encloses(&boundary, target) {
                        return Err(MigrationError::Structural(format!(
                            "Execution at '{}' cannot leave multi-instance '{}'; move '{}' itself instead",
                            activity, boundary, boundary
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Builds the creation recipe for `target`, anchored at the deepest
    /// scope execution of `source` that the target's scope chain shares.
    fn creation_for(
        &self,
        source: Option<ExecutionId>,
        target: &str,
    ) -> Result<TargetCreation, MigrationError> {
        let node = self.require_activity(target)?;

        // Moving onto an event sub-process means instantiating it at its
        // start activity.
        let (chain_base, leaf) = match &node.kind {
            ActivityKind::EventSubProcess { .. } => {
                let mut chain = self.graph.scope_chain(target);
                chain.push(target.to_string());
                let start = node.start_activity.clone().ok_or_else(|| {
                    MigrationError::Invariant(format!("Event sub-process {} has no start activity", target))
                })?;
                (chain, start)
            }
            _ => (self.graph.scope_chain(target), target.to_string()),
        };

        let (anchor, chain, fork_origin) = match source.and_then(|s| self.instance.get(s)) {
            Some(source_exec) => {
                let source_activity = source_exec.activity.clone().unwrap_or_default();
                let source_chain = self.graph.scope_chain(&source_activity);
                let common = source_chain
                    .iter()
                    .zip(chain_base.iter())
                    .take_while(|(a, b)| a == b)
                    .count();
                let anchor = if common == 0 {
                    None
                } else {
                    self.scope_ancestor_at(source_exec.id, &source_chain[common - 1])
                };
                let chain = match anchor {
                    Some(_) => chain_base[common..].to_vec(),
                    None => chain_base.clone(),
                };
                let origin = if source_chain == chain_base { source_exec.fork_origin.clone() } else { None };
                (anchor, chain, origin)
            }
            None => (None, chain_base.clone(), None),
        };

        // A leaf landing directly inside a multi-instance scope is a fresh
        // iteration, unless its source already was one of that loop.
        let direct_scope = chain_base.last().cloned();
        let mi_spawn = match &direct_scope {
            Some(wrapper)
                if matches!(
                    self.graph.activity(wrapper).map(|n| &n.kind),
                    Some(ActivityKind::MultiInstance { .. })
                ) =>
            {
                let source_boundary = source
                    .and_then(|s| self.instance.get(s))
                    .and_then(|e| e.activity.clone())
                    .and_then(|a| self.graph.mi_boundary(&a));
                source_boundary.as_deref() != Some(wrapper.as_str())
            }
            _ => false,
        };

        Ok(TargetCreation { anchor, chain, target: leaf, fork_origin, mi_spawn })
    }

    /// Nearest ancestor scope execution of `exec` positioned at
    /// `scope_activity`.
    fn scope_ancestor_at(&self, exec: ExecutionId, scope_activity: &str) -> Option<ExecutionId> {
        self.instance.ancestors(exec).into_iter().find(|a| {
            self.instance
                .get(*a)
                .map(|e| e.is_scope && e.activity.as_deref() == Some(scope_activity))
                .unwrap_or(false)
        })
    }

    /// Fork lineage shared by every source and preserved by every
    /// creation: same owning scope, same fork origin, and the creations
    /// keep that origin.
    fn shared_lineage(
        &self,
        sources: &[ExecutionId],
        creations: &[TargetCreation],
    ) -> Option<(ExecutionId, String)> {
        let mut scope = None;
        let mut origin: Option<String> = None;
        for source in sources {
            let execution = self.instance.get(*source)?;
            let this_origin = execution.fork_origin.clone()?;
            let this_scope = execution.parent?;
            match (&origin, &scope) {
                (None, None) => {
                    origin = Some(this_origin);
                    scope = Some(this_scope);
                }
                (Some(o), Some(s)) if *o == this_origin && *s == this_scope => {}
                _ => return None,
            }
        }
        let origin = origin?;
        if creations.iter().all(|c| c.fork_origin.as_deref() == Some(origin.as_str())) {
            Some((scope?, origin))
        } else {
            None
        }
    }

    /// Drops roots that are descendants of other roots and duplicates.
    fn dedupe_roots(&self, roots: Vec<ExecutionId>) -> Vec<ExecutionId> {
        let set: HashSet<ExecutionId> = roots.iter().copied().collect();
        let mut seen = HashSet::new();
        roots
            .into_iter()
            .filter(|r| seen.insert(*r))
            .filter(|r| !self.instance.ancestors(*r).iter().any(|a| set.contains(a)))
            .collect()
    }
}
