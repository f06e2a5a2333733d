//! Dependency graph builder.
//!
//! Compiles the registered stages into the minimal DAG needed to materialize
//! a target artifact type for one sample, topologically sorted with ties
//! broken by declaration order.

use crate::contracts::{StageDefinition, StageRegistry};
use crate::core::{ArtifactType, SampleId};
use crate::errors::{CyclicDependencyError, ImmunoflowError};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// One stage in an execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanNode {
    /// The stage contract.
    pub stage: Arc<StageDefinition>,
    /// Stage ids whose outputs this node consumes, in input order.
    pub upstream: Vec<String>,
    /// Source types read straight from the store.
    pub source_inputs: Vec<ArtifactType>,
}

impl PlanNode {
    /// The stage id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.stage.id
    }
}

/// Topologically ordered stages materializing `target` for `sample`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// Requested type.
    pub target: ArtifactType,
    /// Sample scope.
    pub sample: SampleId,
    /// Nodes in execution order. The target's producer, if any, is last.
    pub nodes: Vec<PlanNode>,
}

impl ExecutionPlan {
    /// Stage ids in execution order.
    #[must_use]
    pub fn stage_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(PlanNode::id).collect()
    }

    /// Looks up a node by stage id.
    #[must_use]
    pub fn node(&self, stage_id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.id() == stage_id)
    }

    /// Every node downstream of `stage_id`, transitively, in plan order.
    #[must_use]
    pub fn dependents_of(&self, stage_id: &str) -> Vec<&str> {
        let mut tainted: HashSet<&str> = HashSet::from([stage_id]);
        let mut result = Vec::new();
        for node in &self.nodes {
            if node.upstream.iter().any(|u| tainted.contains(u.as_str())) {
                tainted.insert(node.id());
                result.push(node.id());
            }
        }
        result
    }

    /// Returns the number of planned stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the target is a source and nothing needs to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Builds execution plans from a registry.
#[derive(Debug, Clone, Copy)]
pub struct DependencyGraph<'a> {
    registry: &'a StageRegistry,
}

impl<'a> DependencyGraph<'a> {
    /// Creates a builder over `registry`.
    #[must_use]
    pub const fn new(registry: &'a StageRegistry) -> Self {
        Self { registry }
    }

    /// Resolves the plan for `target` and `sample`.
    ///
    /// # Errors
    ///
    /// Returns the registry's resolution errors for unknown or ambiguous
    /// types, and [`CyclicDependencyError`] if the producers form a cycle.
    pub fn build(
        &self,
        target: ArtifactType,
        sample: &SampleId,
    ) -> Result<ExecutionPlan, ImmunoflowError> {
        let mut resolution = Resolution::default();
        self.resolve_type(target, &mut resolution)?;

        let nodes = self.sort(resolution.nodes)?;
        tracing::debug!(
            target = %target,
            sample = %sample,
            stages = nodes.len(),
            "Resolved execution plan"
        );
        Ok(ExecutionPlan {
            target,
            sample: sample.clone(),
            nodes,
        })
    }

    /// Returns the producing stage id, or `None` for a source type.
    fn resolve_type(
        &self,
        artifact_type: ArtifactType,
        resolution: &mut Resolution,
    ) -> Result<Option<String>, ImmunoflowError> {
        if self.registry.is_source(artifact_type) {
            return Ok(None);
        }
        let stage = self.registry.resolve(artifact_type)?;

        if let Some(start) = resolution.stack.iter().position(|id| *id == stage.id) {
            let mut cycle = resolution.stack[start..].to_vec();
            cycle.push(stage.id.clone());
            return Err(CyclicDependencyError::new(cycle).into());
        }
        if resolution.nodes.contains_key(&stage.id) {
            return Ok(Some(stage.id.clone()));
        }

        resolution.stack.push(stage.id.clone());
        let mut upstream = Vec::new();
        let mut source_inputs = Vec::new();
        for input in &stage.inputs {
            match self.resolve_type(*input, resolution)? {
                Some(producer) => upstream.push(producer),
                None => source_inputs.push(*input),
            }
        }
        resolution.stack.pop();

        let id = stage.id.clone();
        resolution.nodes.insert(
            id.clone(),
            PlanNode {
                stage,
                upstream,
                source_inputs,
            },
        );
        Ok(Some(id))
    }

    /// Kahn's algorithm; the ready set is ordered by declaration index.
    fn sort(&self, mut nodes: HashMap<String, PlanNode>) -> Result<Vec<PlanNode>, ImmunoflowError> {
        let rank = |id: &str| self.registry.declaration_index(id).unwrap_or(usize::MAX);

        let mut in_degree: HashMap<String, usize> = nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.upstream.len()))
            .collect();
        let mut ready: BTreeSet<(usize, String)> = in_degree
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(id, _)| (rank(id), id.clone()))
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(next) = ready.pop_first() {
            let (_, id) = next;
            for (child, node) in &nodes {
                if node.upstream.contains(&id) {
                    if let Some(count) = in_degree.get_mut(child) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            ready.insert((rank(child), child.clone()));
                        }
                    }
                }
            }
            order.push(id);
        }

        if order.len() < nodes.len() {
            let cycle = find_cycle(&nodes).unwrap_or_default();
            return Err(CyclicDependencyError::new(cycle).into());
        }

        Ok(order
            .into_iter()
            .filter_map(|id| nodes.remove(&id))
            .collect())
    }
}

#[derive(Debug, Default)]
struct Resolution {
    nodes: HashMap<String, PlanNode>,
    stack: Vec<String>,
}

fn find_cycle(nodes: &HashMap<String, PlanNode>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    let mut ids: Vec<&String> = nodes.keys().collect();
    ids.sort();
    for id in ids {
        if !visited.contains(id.as_str()) {
            if let Some(cycle) = dfs_cycle(id, nodes, &mut visited, &mut rec_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_cycle(
    node: &str,
    nodes: &HashMap<String, PlanNode>,
    visited: &mut HashSet<String>,
    rec_stack: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> Option<Vec<String>> {
    visited.insert(node.to_string());
    rec_stack.insert(node.to_string());
    path.push(node.to_string());

    if let Some(plan_node) = nodes.get(node) {
        for dep in &plan_node.upstream {
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(dep, nodes, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                let start = path.iter().position(|n| n == dep).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}
