//! Logical DAG - abstract nodes as written by the user
//!
//! Nodes live in a flat arena and reference each other by [`NodeId`], never
//! by pointer; scope back-references (`parent_scope`) are id fields so the
//! graph serialises without cycles. Edges are a separate tagged variant.
//!
//! Acyclicity is checked with the three-colour DFS, ignoring `contains`
//! edges (those express nesting, not ordering).

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::dag::ast::LoopType;
use crate::error::{PmlError, Result};

/// Arena index of a logical node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Stack-allocated adjacency: most nodes have 0-4 neighbours
pub type NodeVec = SmallVec<[NodeId; 4]>;

/// Edge kinds between logical nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeKind {
    /// Ordering dependency
    Sequence,
    /// Conditional branch, tagged by outcome ("then" / "else")
    Conditional { outcome: String },
    /// Data flow: producer provides these properties to the consumer
    Provides { props: Vec<String> },
    /// Nesting (outer operation contains nested atom); ignored for cycles
    Contains,
    /// Loop to one of its body nodes
    LoopBody,
}

impl EdgeKind {
    /// Contains edges express nesting, not ordering.
    pub fn is_ordering(&self) -> bool {
        !matches!(self, EdgeKind::Contains)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalEdge {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(flatten)]
    pub kind: EdgeKind,
}

/// Tagged logical node variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum LogicalNode {
    /// External call: `tool = "<server>:<tool>"` or a capability FQDN
    Task {
        id: NodeId,
        tool: Arc<str>,
        /// Argument source text
        inputs: String,
        /// Statement index in the original code
        position: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_scope: Option<NodeId>,
    },
    /// Pure operation: `tool = "code:<op>"`
    Operation {
        id: NodeId,
        tool: Arc<str>,
        /// Exact source substring (span-extracted)
        code: String,
        pure: bool,
        /// Nested operations are visible to the learner but never scheduled
        executable: bool,
        /// Statement index in the original code
        position: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_scope: Option<NodeId>,
    },
    /// All iterations of a loop as one node
    Loop {
        id: NodeId,
        loop_type: LoopType,
        condition: String,
        /// Full loop source, span-extracted, executed natively
        body_code: String,
        /// Deduplicated tool ids used in the body, first-seen order
        body_tools: Vec<Arc<str>>,
        position: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_scope: Option<NodeId>,
    },
    /// Conditional with tagged outgoing edges per outcome
    Decision {
        id: NodeId,
        condition: String,
        /// Full conditional source, executed natively
        code: String,
        position: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_scope: Option<NodeId>,
    },
}

impl LogicalNode {
    pub fn id(&self) -> NodeId {
        match self {
            LogicalNode::Task { id, .. }
            | LogicalNode::Operation { id, .. }
            | LogicalNode::Loop { id, .. }
            | LogicalNode::Decision { id, .. } => *id,
        }
    }

    /// The tool id this node contributes to the executed path.
    pub fn tool(&self) -> Arc<str> {
        match self {
            LogicalNode::Task { tool, .. } | LogicalNode::Operation { tool, .. } => {
                Arc::clone(tool)
            }
            LogicalNode::Loop { loop_type, .. } => {
                Arc::from(format!("loop:{}", loop_type.as_str()))
            }
            LogicalNode::Decision { .. } => Arc::from("decision"),
        }
    }

    pub fn parent_scope(&self) -> Option<NodeId> {
        match self {
            LogicalNode::Task { parent_scope, .. }
            | LogicalNode::Operation { parent_scope, .. }
            | LogicalNode::Loop { parent_scope, .. }
            | LogicalNode::Decision { parent_scope, .. } => *parent_scope,
        }
    }

    pub fn position(&self) -> usize {
        match self {
            LogicalNode::Task { position, .. }
            | LogicalNode::Operation { position, .. }
            | LogicalNode::Loop { position, .. }
            | LogicalNode::Decision { position, .. } => *position,
        }
    }

    /// Pure operations are auto-approved and safe to fail.
    pub fn is_pure(&self) -> bool {
        matches!(self, LogicalNode::Operation { pure: true, .. })
    }

    /// Scheduled nodes: top-level, executable, not inside a loop or decision.
    pub fn is_schedulable(&self) -> bool {
        if self.parent_scope().is_some() {
            return false;
        }
        match self {
            LogicalNode::Operation { executable, .. } => *executable,
            _ => true,
        }
    }
}

/// The logical DAG: node arena plus edges.
///
/// Invariants:
/// - acyclic ignoring `contains` edges
/// - every non-root node reachable from some source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogicalDag {
    pub nodes: Vec<LogicalNode>,
    pub edges: Vec<LogicalEdge>,
}

impl LogicalDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, build: impl FnOnce(NodeId) -> LogicalNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(build(id));
        id
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) {
        self.edges.push(LogicalEdge { from, to, kind });
    }

    pub fn node(&self, id: NodeId) -> &LogicalNode {
        &self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ordering successors (ignores `contains`).
    pub fn successors(&self) -> FxHashMap<NodeId, NodeVec> {
        let mut adjacency: FxHashMap<NodeId, NodeVec> = self
            .nodes
            .iter()
            .map(|n| (n.id(), NodeVec::new()))
            .collect();
        for edge in &self.edges {
            if edge.kind.is_ordering() {
                adjacency.entry(edge.from).or_default().push(edge.to);
            }
        }
        adjacency
    }

    /// Ordering predecessors (ignores `contains`).
    pub fn predecessors(&self) -> FxHashMap<NodeId, NodeVec> {
        let mut preds: FxHashMap<NodeId, NodeVec> = self
            .nodes
            .iter()
            .map(|n| (n.id(), NodeVec::new()))
            .collect();
        for edge in &self.edges {
            if edge.kind.is_ordering() {
                preds.entry(edge.to).or_default().push(edge.from);
            }
        }
        preds
    }

    /// Detect cycles using DFS with three-colour marking, ignoring
    /// `contains` edges.
    ///
    /// - White: unvisited
    /// - Gray: currently in the DFS stack
    /// - Black: fully processed
    ///
    /// A cycle exists when a Gray node is reached again.
    pub fn detect_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let adjacency = self.successors();
        let mut colors: FxHashMap<NodeId, Color> =
            self.nodes.iter().map(|n| (n.id(), Color::White)).collect();
        let mut stack: Vec<NodeId> = Vec::new();

        fn dfs(
            node: NodeId,
            adjacency: &FxHashMap<NodeId, NodeVec>,
            colors: &mut FxHashMap<NodeId, Color>,
            stack: &mut Vec<NodeId>,
        ) -> std::result::Result<(), String> {
            colors.insert(node, Color::Gray);
            stack.push(node);

            if let Some(neighbors) = adjacency.get(&node) {
                for neighbor in neighbors {
                    match colors.get(neighbor) {
                        Some(Color::Gray) => {
                            let cycle_start =
                                stack.iter().position(|x| x == neighbor).unwrap_or(0);
                            let cycle: Vec<String> =
                                stack[cycle_start..].iter().map(|s| s.to_string()).collect();
                            return Err(format!("{} -> {}", cycle.join(" -> "), neighbor));
                        }
                        Some(Color::White) | None => {
                            dfs(*neighbor, adjacency, colors, stack)?;
                        }
                        Some(Color::Black) => {}
                    }
                }
            }

            stack.pop();
            colors.insert(node, Color::Black);
            Ok(())
        }

        for node in &self.nodes {
            if colors.get(&node.id()) == Some(&Color::White) {
                if let Err(cycle) = dfs(node.id(), &adjacency, &mut colors, &mut stack) {
                    return Err(PmlError::CycleDetected { cycle });
                }
            }
        }

        Ok(())
    }

    /// Validate the structural invariants: acyclic (ignoring contains) and
    /// every non-root schedulable node reachable from some source.
    pub fn validate(&self) -> Result<()> {
        self.detect_cycles()?;

        let preds = self.predecessors();
        let adjacency = self.successors();

        let roots: Vec<NodeId> = self
            .nodes
            .iter()
            .map(LogicalNode::id)
            .filter(|id| preds.get(id).map_or(true, |p| p.is_empty()))
            .collect();

        let mut reachable: FxHashSet<NodeId> = FxHashSet::default();
        let mut queue: Vec<NodeId> = roots;
        while let Some(id) = queue.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(next) = adjacency.get(&id) {
                queue.extend(next.iter().copied());
            }
        }

        for node in &self.nodes {
            if node.is_schedulable() && !reachable.contains(&node.id()) {
                return Err(PmlError::InvalidDag {
                    reason: format!("node {} unreachable from any source", node.id()),
                });
            }
        }

        Ok(())
    }

    /// Topological order over ordering edges (Kahn). Ties break by node id,
    /// so the order is deterministic and follows statement position.
    pub fn topo_order(&self) -> Result<Vec<NodeId>> {
        let adjacency = self.successors();
        let preds = self.predecessors();

        let mut in_degree: FxHashMap<NodeId, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id(), preds.get(&n.id()).map_or(0, |p| p.len())))
            .collect();

        let mut ready: Vec<NodeId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.first().copied() {
            ready.remove(0);
            order.push(id);
            if let Some(next) = adjacency.get(&id) {
                for n in next {
                    let d = in_degree.get_mut(n).expect("node in degree map");
                    *d -= 1;
                    if *d == 0 {
                        ready.push(*n);
                    }
                }
            }
            ready.sort();
        }

        if order.len() != self.nodes.len() {
            return Err(PmlError::InvalidDag {
                reason: "cycle prevented topological ordering".to_string(),
            });
        }
        Ok(order)
    }
}
