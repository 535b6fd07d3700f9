//! Per-subject stage DAG.

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use rt_types::{validation_error, RtResult, SubjectPair};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use crate::stage::{OutputKind, ParameterRecord, StageSpec};

/// Where a stage input comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    /// A file outside the graph (subject image, atlas template, ...).
    External(PathBuf),
    /// A named output of another stage in the same graph.
    Upstream { stage: String, output: String },
}

impl InputSource {
    pub fn upstream(stage: impl Into<String>, output: impl Into<String>) -> Self {
        InputSource::Upstream {
            stage: stage.into(),
            output: output.into(),
        }
    }
}

/// One stage instance in a subject graph.
#[derive(Debug, Clone)]
pub struct StageNode {
    pub spec: Arc<StageSpec>,
    pub parameters: ParameterRecord,
    /// Input slot → source. Every declared slot is bound.
    pub bindings: BTreeMap<String, InputSource>,
}

impl StageNode {
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Edge payload: which producer output feeds which consumer slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub output: String,
    pub slot: String,
}

/// DAG of stage instances for exactly one subject pair.
///
/// Construction enforces the graph invariants: unique stage names, every
/// input slot bound to exactly one producer or external file, no cycles,
/// and a single objective stage producing a scalar score.
#[derive(Debug, Clone)]
pub struct SubjectGraph {
    subject: SubjectPair,
    graph: DiGraph<StageNode, Link>,
    objective: NodeIndex,
    objective_output: String,
    order: Vec<NodeIndex>,
}

impl SubjectGraph {
    pub fn new(
        subject: SubjectPair,
        nodes: Vec<StageNode>,
        objective_stage: &str,
        objective_output: &str,
    ) -> RtResult<Self> {
        let mut graph = DiGraph::new();
        let mut by_name: HashMap<String, NodeIndex> = HashMap::new();

        for node in nodes {
            let name = node.name().to_string();
            if by_name.contains_key(&name) {
                return Err(validation_error!(
                    "subject {}: duplicate stage '{}'",
                    subject.id,
                    name
                ));
            }
            let idx = graph.add_node(node);
            by_name.insert(name, idx);
        }

        let mut edges = Vec::new();
        for idx in graph.node_indices() {
            let node = &graph[idx];
            for slot in &node.spec.inputs {
                if !node.bindings.contains_key(slot) {
                    return Err(validation_error!(
                        "subject {}: stage '{}' input '{}' is unbound",
                        subject.id,
                        node.name(),
                        slot
                    ));
                }
            }
            for (slot, source) in &node.bindings {
                if !node.spec.inputs.contains(slot) {
                    return Err(validation_error!(
                        "subject {}: stage '{}' has no input slot '{}'",
                        subject.id,
                        node.name(),
                        slot
                    ));
                }
                if let InputSource::Upstream { stage, output } = source {
                    let producer = *by_name.get(stage).ok_or_else(|| {
                        validation_error!(
                            "subject {}: stage '{}' depends on unknown stage '{}'",
                            subject.id,
                            node.name(),
                            stage
                        )
                    })?;
                    match graph[producer].spec.output(output) {
                        Some(o) if o.kind == OutputKind::File => {}
                        _ => {
                            return Err(validation_error!(
                                "subject {}: stage '{}' declares no file output '{}'",
                                subject.id,
                                stage,
                                output
                            ));
                        }
                    }
                    edges.push((
                        producer,
                        idx,
                        Link {
                            output: output.clone(),
                            slot: slot.clone(),
                        },
                    ));
                }
            }
        }
        for (from, to, link) in edges {
            graph.add_edge(from, to, link);
        }

        if is_cyclic_directed(&graph) {
            return Err(validation_error!(
                "subject {}: stage graph contains a cycle",
                subject.id
            ));
        }
        let order = toposort(&graph, None).map_err(|cycle| {
            validation_error!(
                "subject {}: cycle through stage '{}'",
                subject.id,
                graph[cycle.node_id()].name()
            )
        })?;

        let objective = *by_name.get(objective_stage).ok_or_else(|| {
            validation_error!(
                "subject {}: objective stage '{}' is not in the graph",
                subject.id,
                objective_stage
            )
        })?;
        match graph[objective].spec.output(objective_output) {
            Some(o) if o.kind == OutputKind::Scalar => {}
            _ => {
                return Err(validation_error!(
                    "subject {}: objective stage '{}' declares no scalar output '{}'",
                    subject.id,
                    objective_stage,
                    objective_output
                ));
            }
        }

        Ok(Self {
            subject,
            graph,
            objective,
            objective_output: objective_output.to_string(),
            order,
        })
    }

    pub fn subject(&self) -> &SubjectPair {
        &self.subject
    }

    pub fn node(&self, idx: NodeIndex) -> &StageNode {
        &self.graph[idx]
    }

    pub fn stage(&self, name: &str) -> Option<&StageNode> {
        self.graph.node_weights().find(|n| n.name() == name)
    }

    pub fn stage_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Stage indices in dependency order.
    pub fn topological_order(&self) -> &[NodeIndex] {
        &self.order
    }

    /// Direct producers feeding `idx`.
    pub fn dependencies(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(idx, Direction::Incoming)
    }

    pub fn objective_stage(&self) -> NodeIndex {
        self.objective
    }

    pub fn objective_output(&self) -> &str {
        &self.objective_output
    }

    /// Stages that produce no output consumed inside the graph.
    pub fn sinks(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .filter(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].name())
            .collect()
    }
}
