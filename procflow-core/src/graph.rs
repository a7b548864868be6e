//! Process graph model
//!
//! The parsed, read-only definition the interpreter walks: flow nodes, the
//! transitions between them, and the conditions gating those transitions.
//! Built programmatically through [`ProcessBuilder`] and validated once at
//! deploy time; the runtime never mutates a definition.

use crate::error::EngineError;
use crate::types::Value;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

// ─── Conditions ───────────────────────────────────────────────

/// Condition on a transition, evaluated against the execution's visible
/// variable scope. Absent variables evaluate as null.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Variable is present and truthy.
    IsTrue(String),
    /// Variable equals the given value.
    Equals(String, Value),
    Not(Box<Condition>),
}

impl Condition {
    pub fn is_true(variable: impl Into<String>) -> Self {
        Condition::IsTrue(variable.into())
    }

    pub fn equals(variable: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Equals(variable.into(), value.into())
    }

    pub fn not(inner: Condition) -> Self {
        Condition::Not(Box::new(inner))
    }

    pub fn evaluate(&self, variables: &BTreeMap<String, Value>) -> bool {
        match self {
            Condition::IsTrue(name) => variables.get(name).is_some_and(Value::is_truthy),
            Condition::Equals(name, expected) => variables.get(name) == Some(expected),
            Condition::Not(inner) => !inner.evaluate(variables),
        }
    }
}

// ─── Nodes and transitions ────────────────────────────────────

/// The closed set of node behaviors the interpreter dispatches over.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Start,
    End,
    /// Pass-through activity with no attached behavior.
    Task,
    /// Runs the named registered delegate when entered.
    ServiceTask { delegate: String },
    /// Wait state completed by an external signal.
    ReceiveTask,
    /// Takes the first outgoing transition whose condition passes.
    ExclusiveGateway,
    /// Fork on multiple outgoing, join on multiple incoming.
    ParallelGateway,
    /// Wait state completed by a timer job.
    TimerCatch { duration_ms: i64 },
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Task => "task",
            NodeKind::ServiceTask { .. } => "service-task",
            NodeKind::ReceiveTask => "receive-task",
            NodeKind::ExclusiveGateway => "exclusive-gateway",
            NodeKind::ParallelGateway => "parallel-gateway",
            NodeKind::TimerCatch { .. } => "timer-catch",
        }
    }
}

/// A sequence flow between two nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    pub name: Option<String>,
    pub source: String,
    pub target: String,
    pub condition: Option<Condition>,
}

/// Repetition spec for a non-interrupting boundary timer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleSpec {
    /// Interval between fires in milliseconds.
    pub interval_ms: i64,
    /// Total number of fires.
    pub max_fires: u32,
}

/// Timer attached to the boundary of an activity. Scheduled on enter,
/// cancelled on leave.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoundaryTimer {
    pub id: String,
    pub duration_ms: i64,
    /// Node the execution (or spawned child) continues at when the timer
    /// fires.
    pub target: String,
    /// Interrupting timers move the execution off the activity;
    /// non-interrupting timers spawn a concurrent child and leave the
    /// activity in place.
    pub interrupting: bool,
    /// Only valid on non-interrupting timers.
    pub cycle: Option<CycleSpec>,
}

impl BoundaryTimer {
    pub fn interrupting(id: impl Into<String>, duration_ms: i64, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            duration_ms,
            target: target.into(),
            interrupting: true,
            cycle: None,
        }
    }

    pub fn non_interrupting(
        id: impl Into<String>,
        duration_ms: i64,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            duration_ms,
            target: target.into(),
            interrupting: false,
            cycle: None,
        }
    }

    pub fn with_cycle(mut self, interval_ms: i64, max_fires: u32) -> Self {
        self.cycle = Some(CycleSpec {
            interval_ms,
            max_fires,
        });
        self
    }
}

/// Error boundary on an activity. `error_code: None` is the catch-all;
/// specific codes are matched first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBoundary {
    pub error_code: Option<String>,
    pub target: String,
}

/// One node of the process graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
    /// Outgoing transitions in declaration order. Order matters: forks create
    /// children in this order and exclusive gateways pick the first match.
    pub outgoing: Vec<Transition>,
    /// Number of incoming transitions, computed at build time. A parallel
    /// gateway with more than one incoming is a join barrier.
    #[serde(default)]
    pub incoming_count: u32,
    /// Entering this node happens behind an async-continuation job instead of
    /// inside the triggering transaction.
    #[serde(default)]
    pub async_before: bool,
    #[serde(default)]
    pub boundary_timers: Vec<BoundaryTimer>,
    #[serde(default)]
    pub error_boundaries: Vec<ErrorBoundary>,
}

// ─── Definition model ─────────────────────────────────────────

/// The deployable, unversioned process model. Versioning metadata is stamped
/// on at deploy time, producing a [`ProcessDefinition`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DefinitionModel {
    pub key: String,
    pub name: Option<String>,
    pub nodes: BTreeMap<String, FlowNode>,
    /// Id of the single start node.
    pub initial: String,
}

/// A versioned, immutable parsed graph as resolved through the definition
/// cache. Ids are never reused across redeploys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    pub key: String,
    pub version: u32,
    pub deployment_id: String,
    pub model: DefinitionModel,
}

impl ProcessDefinition {
    pub fn node(&self, id: &str) -> Result<&FlowNode, EngineError> {
        self.model
            .nodes
            .get(id)
            .ok_or_else(|| EngineError::not_found("flow node", id))
    }

    pub fn initial(&self) -> &str {
        &self.model.initial
    }
}

/// Recompute incoming counts and check structural soundness: exactly one
/// start node, every transition/boundary target resolves, every node is
/// reachable from the start, cycles only on non-interrupting timers.
pub(crate) fn validate_and_index(model: &mut DefinitionModel) -> Result<(), EngineError> {
    let starts: Vec<&str> = model
        .nodes
        .values()
        .filter(|n| n.kind == NodeKind::Start)
        .map(|n| n.id.as_str())
        .collect();
    if starts.len() != 1 {
        return Err(EngineError::InvalidModel(format!(
            "process '{}' must have exactly one start node, found {}",
            model.key,
            starts.len()
        )));
    }
    model.initial = starts[0].to_string();

    // Dangling targets and incoming counts in one pass.
    let mut incoming: HashMap<String, u32> = HashMap::new();
    for node in model.nodes.values() {
        for t in &node.outgoing {
            if !model.nodes.contains_key(&t.target) {
                return Err(EngineError::InvalidModel(format!(
                    "transition '{}' targets unknown node '{}'",
                    t.id, t.target
                )));
            }
            *incoming.entry(t.target.clone()).or_default() += 1;
        }
        for bt in &node.boundary_timers {
            if !model.nodes.contains_key(&bt.target) {
                return Err(EngineError::InvalidModel(format!(
                    "boundary timer '{}' targets unknown node '{}'",
                    bt.id, bt.target
                )));
            }
            if bt.interrupting && bt.cycle.is_some() {
                return Err(EngineError::InvalidModel(format!(
                    "boundary timer '{}' is interrupting and cannot cycle",
                    bt.id
                )));
            }
        }
        for eb in &node.error_boundaries {
            if !model.nodes.contains_key(&eb.target) {
                return Err(EngineError::InvalidModel(format!(
                    "error boundary on '{}' targets unknown node '{}'",
                    node.id, eb.target
                )));
            }
        }
    }

    // Reachability from the start node. Boundary targets count as edges:
    // a node reachable only through a boundary event is still live.
    let mut graph: DiGraph<(), ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for id in model.nodes.keys() {
        index.insert(id.as_str(), graph.add_node(()));
    }
    for node in model.nodes.values() {
        let from = index[node.id.as_str()];
        for t in &node.outgoing {
            graph.add_edge(from, index[t.target.as_str()], ());
        }
        for bt in &node.boundary_timers {
            graph.add_edge(from, index[bt.target.as_str()], ());
        }
        for eb in &node.error_boundaries {
            graph.add_edge(from, index[eb.target.as_str()], ());
        }
    }
    let mut reached: HashSet<NodeIndex> = HashSet::new();
    let mut dfs = Dfs::new(&graph, index[model.initial.as_str()]);
    while let Some(n) = dfs.next(&graph) {
        reached.insert(n);
    }
    let unreachable: Vec<&str> = model
        .nodes
        .keys()
        .map(String::as_str)
        .filter(|id| !reached.contains(&index[id]))
        .collect();
    if !unreachable.is_empty() {
        return Err(EngineError::InvalidModel(format!(
            "unreachable nodes: {}",
            unreachable.join(", ")
        )));
    }

    for node in model.nodes.values_mut() {
        node.incoming_count = incoming.get(&node.id).copied().unwrap_or(0);
    }
    Ok(())
}

// ─── Builder ──────────────────────────────────────────────────

/// Fluent builder for a [`DefinitionModel`].
#[derive(Debug, Default)]
pub struct ProcessBuilder {
    key: String,
    name: Option<String>,
    nodes: Vec<FlowNode>,
    flows: Vec<(String, String, Option<Condition>)>,
}

impl ProcessBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn push(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.push(FlowNode {
            id: id.into(),
            name: None,
            kind,
            outgoing: Vec::new(),
            incoming_count: 0,
            async_before: false,
            boundary_timers: Vec::new(),
            error_boundaries: Vec::new(),
        });
        self
    }

    pub fn start(self, id: impl Into<String>) -> Self {
        self.push(id, NodeKind::Start)
    }

    pub fn end(self, id: impl Into<String>) -> Self {
        self.push(id, NodeKind::End)
    }

    pub fn task(self, id: impl Into<String>) -> Self {
        self.push(id, NodeKind::Task)
    }

    pub fn service_task(self, id: impl Into<String>, delegate: impl Into<String>) -> Self {
        self.push(
            id,
            NodeKind::ServiceTask {
                delegate: delegate.into(),
            },
        )
    }

    pub fn receive_task(self, id: impl Into<String>) -> Self {
        self.push(id, NodeKind::ReceiveTask)
    }

    pub fn exclusive_gateway(self, id: impl Into<String>) -> Self {
        self.push(id, NodeKind::ExclusiveGateway)
    }

    pub fn parallel_gateway(self, id: impl Into<String>) -> Self {
        self.push(id, NodeKind::ParallelGateway)
    }

    pub fn timer_catch(self, id: impl Into<String>, duration_ms: i64) -> Self {
        self.push(id, NodeKind::TimerCatch { duration_ms })
    }

    fn modify(mut self, id: &str, f: impl FnOnce(&mut FlowNode)) -> Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
            f(node);
        }
        self
    }

    /// Mark a node as an async continuation point.
    pub fn async_before(self, node_id: &str) -> Self {
        self.modify(node_id, |n| n.async_before = true)
    }

    pub fn boundary_timer(self, node_id: &str, timer: BoundaryTimer) -> Self {
        self.modify(node_id, |n| n.boundary_timers.push(timer))
    }

    pub fn error_boundary(
        self,
        node_id: &str,
        error_code: Option<&str>,
        target: impl Into<String>,
    ) -> Self {
        let boundary = ErrorBoundary {
            error_code: error_code.map(str::to_string),
            target: target.into(),
        };
        self.modify(node_id, |n| n.error_boundaries.push(boundary))
    }

    pub fn flow(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.flows.push((source.into(), target.into(), None));
        self
    }

    pub fn flow_if(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: Condition,
    ) -> Self {
        self.flows
            .push((source.into(), target.into(), Some(condition)));
        self
    }

    pub fn build(self) -> Result<DefinitionModel, EngineError> {
        if self.key.is_empty() {
            return Err(EngineError::illegal_argument("process key is empty"));
        }
        let mut nodes: BTreeMap<String, FlowNode> = BTreeMap::new();
        for node in self.nodes {
            if nodes.insert(node.id.clone(), node).is_some() {
                return Err(EngineError::InvalidModel("duplicate node id".into()));
            }
        }
        for (i, (source, target, condition)) in self.flows.into_iter().enumerate() {
            let node = nodes.get_mut(&source).ok_or_else(|| {
                EngineError::InvalidModel(format!("flow source '{source}' is not a node"))
            })?;
            node.outgoing.push(Transition {
                id: format!("flow_{i}"),
                name: None,
                source,
                target,
                condition,
            });
        }
        let mut model = DefinitionModel {
            key: self.key,
            name: self.name,
            nodes,
            initial: String::new(),
        };
        validate_and_index(&mut model)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> ProcessBuilder {
        ProcessBuilder::new("p")
            .start("start")
            .task("work")
            .end("done")
            .flow("start", "work")
            .flow("work", "done")
    }

    #[test]
    fn build_computes_incoming_counts_and_initial() {
        let model = linear().build().unwrap();
        assert_eq!(model.initial, "start");
        assert_eq!(model.nodes["start"].incoming_count, 0);
        assert_eq!(model.nodes["work"].incoming_count, 1);
        assert_eq!(model.nodes["done"].incoming_count, 1);
    }

    #[test]
    fn build_rejects_unreachable_node() {
        let err = linear().task("orphan").build().unwrap_err();
        assert!(matches!(err, EngineError::InvalidModel(msg) if msg.contains("orphan")));
    }

    #[test]
    fn build_rejects_dangling_target() {
        let err = ProcessBuilder::new("p")
            .start("start")
            .flow("start", "nowhere")
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidModel(msg) if msg.contains("nowhere")));
    }

    #[test]
    fn build_requires_single_start() {
        let err = ProcessBuilder::new("p").task("only").build().unwrap_err();
        assert!(matches!(err, EngineError::InvalidModel(_)));
    }

    #[test]
    fn condition_evaluation() {
        let mut vars = BTreeMap::new();
        vars.insert("approved".to_string(), Value::Bool(true));
        vars.insert("amount".to_string(), Value::Int(7));

        assert!(Condition::is_true("approved").evaluate(&vars));
        assert!(!Condition::is_true("missing").evaluate(&vars));
        assert!(Condition::equals("amount", 7i64).evaluate(&vars));
        assert!(!Condition::equals("amount", 8i64).evaluate(&vars));
        assert!(Condition::not(Condition::is_true("missing")).evaluate(&vars));
    }
}
