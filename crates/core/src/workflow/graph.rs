use crate::types::{Edge, Step};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Step name -> step record
pub type StepMap = BTreeMap<String, Step>;

/// Step name -> names of the steps it waits on
pub type DependencyMap = BTreeMap<String, BTreeSet<String>>;

/// Step name -> names of the steps waiting on it
pub type DependentMap = BTreeMap<String, BTreeSet<String>>;

/// In-memory dependency index for one workflow. Derived state, rebuilt per run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepGraph {
    pub steps: StepMap,
    pub dependencies: DependencyMap,
    pub dependents: DependentMap,
}

/// Build the step, dependency and dependent maps from a node list and edge list.
///
/// Every step name becomes a key in all three maps. Edges whose source or target
/// is not a known step name are dropped. `aux` carries per-node data from the
/// authoring canvas, keyed by step name; its keys are added to the step's input
/// without overriding keys the step already defines.
pub fn build_graph(
    steps: &[Step],
    edges: &[Edge],
    aux: Option<&HashMap<String, Value>>,
) -> StepGraph {
    let mut graph = StepGraph::default();

    for step in steps {
        let mut step = step.clone();
        if let Some(extra) = aux.and_then(|aux| aux.get(&step.name)) {
            merge_aux(&mut step.input, extra);
        }

        graph.dependencies.insert(step.name.clone(), BTreeSet::new());
        graph.dependents.insert(step.name.clone(), BTreeSet::new());
        graph.steps.insert(step.name.clone(), step);
    }

    for edge in edges {
        if !graph.steps.contains_key(&edge.source) || !graph.steps.contains_key(&edge.target) {
            tracing::warn!(
                "Dropping edge {} -> {}: unknown endpoint",
                edge.source,
                edge.target
            );
            continue;
        }

        if let Some(deps) = graph.dependencies.get_mut(&edge.target) {
            deps.insert(edge.source.clone());
        }
        if let Some(dependents) = graph.dependents.get_mut(&edge.source) {
            dependents.insert(edge.target.clone());
        }
    }

    graph
}

fn merge_aux(input: &mut Value, extra: &Value) {
    match (input, extra) {
        (Value::Object(input), Value::Object(extra)) => {
            for (key, value) in extra {
                input.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        (input @ Value::Null, extra) => *input = extra.clone(),
        _ => {}
    }
}

impl StepGraph {
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.get(name)
    }

    /// Direct dependencies of a step (empty for unknown names)
    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &String> {
        self.dependencies.get(name).into_iter().flatten()
    }

    /// Direct dependents of a step (empty for unknown names)
    pub fn dependents_of(&self, name: &str) -> impl Iterator<Item = &String> {
        self.dependents.get(name).into_iter().flatten()
    }

    /// Every step reachable from `name` along dependent edges, excluding `name`
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&String> = self.dependents_of(name).collect();

        while let Some(next) = queue.pop_front() {
            if next != name && seen.insert(next.clone()) {
                queue.extend(self.dependents_of(next));
            }
        }

        seen
    }
}
