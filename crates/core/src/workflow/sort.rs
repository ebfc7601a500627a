use super::graph::{build_graph, StepGraph};
use crate::error::WorkflowError;
use crate::types::{Edge, Step};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// One entry of a flattened execution plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub name: String,
    pub layer: usize,
    pub sort: u32,
}

/// Kahn's algorithm, one full layer at a time.
///
/// Members of a layer have no dependency on each other. Layers are sorted by name
/// so output is deterministic; callers must not rely on the order inside a layer.
pub fn layered(graph: &StepGraph) -> Result<Vec<Vec<String>>, WorkflowError> {
    let mut in_degree: BTreeMap<&str, usize> = graph
        .steps
        .keys()
        .map(|name| (name.as_str(), graph.dependencies_of(name).count()))
        .collect();

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut layers = Vec::new();
    let mut emitted = 0;

    while !queue.is_empty() {
        let mut layer: Vec<String> = Vec::with_capacity(queue.len());

        for _ in 0..queue.len() {
            let Some(name) = queue.pop_front() else {
                break;
            };
            layer.push(name.to_string());

            for dependent in graph.dependents_of(name) {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }

        layer.sort();
        emitted += layer.len();
        layers.push(layer);
    }

    if emitted < graph.steps.len() {
        return Err(WorkflowError::CycleDetected {
            steps: cycle_members(graph),
        });
    }

    Ok(layers)
}

/// Assign a 0-based `sort` index to every step, layer by layer
pub fn flatten(layers: &[Vec<String>]) -> Vec<PlanEntry> {
    let mut sort = 0;
    let mut plan = Vec::new();

    for (layer_idx, layer) in layers.iter().enumerate() {
        for name in layer {
            plan.push(PlanEntry {
                name: name.clone(),
                layer: layer_idx,
                sort,
            });
            sort += 1;
        }
    }

    plan
}

/// Authoring-time preview: order a node list and edge list without persisting anything
pub fn preview_order(steps: &[Step], edges: &[Edge]) -> Result<Vec<PlanEntry>, WorkflowError> {
    let graph = build_graph(steps, edges, None);
    layered(&graph).map(|layers| flatten(&layers))
}

/// Names of the steps that sit on a cycle: strongly connected components with
/// more than one member, plus self-loops. Sorted by name.
fn cycle_members(graph: &StepGraph) -> Vec<String> {
    let mut dag: DiGraph<&str, ()> = DiGraph::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();

    for name in graph.steps.keys() {
        indices.insert(name.as_str(), dag.add_node(name.as_str()));
    }
    for (target, deps) in &graph.dependencies {
        for source in deps {
            if let (Some(&s), Some(&t)) = (indices.get(source.as_str()), indices.get(target.as_str())) {
                dag.add_edge(s, t, ());
            }
        }
    }

    let mut members: Vec<String> = tarjan_scc(&dag)
        .into_iter()
        .filter(|component| {
            component.len() > 1 || dag.contains_edge(component[0], component[0])
        })
        .flatten()
        .map(|idx| dag[idx].to_string())
        .collect();

    members.sort();
    members
}
