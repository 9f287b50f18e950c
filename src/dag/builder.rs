//! DAG Builder - AST → logical DAG
//!
//! Walks the statement-level [`Program`] and produces the logical DAG:
//!
//! - `mcp.<server>.<tool>(args)` → task node `"<server>:<tool>"`
//! - `capabilities.<name>(args)` → task node `"capability:<name>"`
//!   (resolved against the registry when the layer runs)
//! - Whitelisted calls → operation nodes `"code:<op>"` with exact spans;
//!   nested calls (`nesting > 0`) are `executable = false` atoms linked by
//!   `contains` edges - the learner sees them, the scheduler never does
//! - Loops → one loop node; the body is analysed once for `bodyTools`
//!   (first-seen order, deduplicated) and body nodes carry
//!   `parent_scope = loopId`
//! - Conditionals → decision node with `conditional` outgoing edges
//! - `Promise.all` branches → siblings sharing the statement's dependencies
//!
//! Data dependencies come from variable bindings: an assignment binds
//! `name → producer node`; uses add `sequence` + `provides` edges. Literal
//! bindings (e.g. array constants) create no nodes - the fusion pass
//! assembles them into their consumers' code.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::dag::ast::{CodeParser, Expr, Head, Program, Stmt, StmtKind};
use crate::dag::logical::{EdgeKind, LogicalDag, LogicalNode, NodeId};
use crate::error::Result;
use crate::util::intern;

static IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_$][A-Za-z0-9_$]*").expect("valid regex"));

static KEYWORDS: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "const", "let", "var", "return", "await", "async", "for", "while", "do", "if", "else",
        "of", "in", "new", "true", "false", "null", "undefined", "function", "typeof", "break",
        "continue", "switch", "case", "default", "mcp", "capabilities", "Promise", "Math", "JSON",
        "Object",
    ]
    .into_iter()
    .collect()
});

/// Side information the fusion pass needs per node.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    /// Statement index in the program
    pub stmt_index: usize,
    /// Full statement source text
    pub stmt_source: String,
    /// Binding name this node's statement produces (chain tail / task only)
    pub export: Option<String>,
    /// Bindings produced by other statements that this statement reads
    pub imports: Vec<String>,
    /// Literal bindings this statement reads (inlined at fusion time)
    pub literal_refs: Vec<String>,
}

/// Builder output: the logical DAG plus fusion-facing side tables.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub logical: LogicalDag,
    pub info: FxHashMap<NodeId, NodeInfo>,
    /// Literal binding statements in source order: (name, statement source)
    pub literals: Vec<(String, String)>,
}

impl BuildOutput {
    pub fn literal_source(&self, name: &str) -> Option<&str> {
        self.literals
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, src)| src.as_str())
    }
}

/// Build the logical DAG for `code` using the supplied parser.
pub fn build_logical(parser: &dyn CodeParser, code: &str) -> Result<BuildOutput> {
    let program = parser.parse(code)?;
    let mut builder = Builder::new(&program);
    for (index, stmt) in program.statements.iter().enumerate() {
        builder.visit_statement(stmt, index);
    }
    let output = builder.finish();
    output.logical.validate()?;
    Ok(output)
}

struct Builder<'a> {
    program: &'a Program,
    dag: LogicalDag,
    info: FxHashMap<NodeId, NodeInfo>,
    literals: Vec<(String, String)>,
    /// var name → producer node (last node of the producing statement)
    bindings: FxHashMap<String, NodeId>,
    /// var name → index into `literals`
    literal_names: FxHashMap<String, usize>,
}

impl<'a> Builder<'a> {
    fn new(program: &'a Program) -> Self {
        Self {
            program,
            dag: LogicalDag::new(),
            info: FxHashMap::default(),
            literals: Vec::new(),
            bindings: FxHashMap::default(),
            literal_names: FxHashMap::default(),
        }
    }

    fn finish(self) -> BuildOutput {
        BuildOutput {
            logical: self.dag,
            info: self.info,
            literals: self.literals,
        }
    }

    /// Identifiers a source fragment reads, split into task-produced
    /// bindings and literal bindings.
    fn classify_refs(&self, source: &str) -> (Vec<String>, Vec<String>) {
        let mut imports = Vec::new();
        let mut literal_refs = Vec::new();
        let mut seen = FxHashSet::default();

        for m in IDENT.find_iter(source) {
            // Skip member accesses (`.map`, `.length`) - only bare idents bind
            if m.start() > 0 && source.as_bytes()[m.start() - 1] == b'.' {
                continue;
            }
            let name = m.as_str();
            if KEYWORDS.contains(name) || !seen.insert(name.to_string()) {
                continue;
            }
            if self.bindings.contains_key(name) {
                imports.push(name.to_string());
            } else if self.literal_names.contains_key(name) {
                literal_refs.push(name.to_string());
            }
        }
        (imports, literal_refs)
    }

    /// Wire sequence + provides edges from each import's producer to `entry`.
    fn wire_imports(&mut self, entry: NodeId, imports: &[String]) {
        for name in imports {
            if let Some(&producer) = self.bindings.get(name) {
                self.dag.add_edge(producer, entry, EdgeKind::Sequence);
                self.dag.add_edge(
                    producer,
                    entry,
                    EdgeKind::Provides {
                        props: vec![name.clone()],
                    },
                );
            }
        }
    }

    fn node_info(&self, stmt: &Stmt, index: usize, export: Option<String>) -> NodeInfo {
        let source = self.program.source_of(stmt.span).to_string();
        let (imports, literal_refs) = self.classify_refs(&source);
        NodeInfo {
            stmt_index: index,
            stmt_source: source,
            export,
            imports,
            literal_refs,
        }
    }

    fn visit_statement(&mut self, stmt: &Stmt, index: usize) {
        match &stmt.kind {
            StmtKind::Binding { name, expr } => {
                if expr.is_opaque() {
                    // Literal binding: no node; fusion inlines the statement
                    let source = self.program.source_of(stmt.span).to_string();
                    self.literal_names.insert(name.clone(), self.literals.len());
                    self.literals.push((name.clone(), source));
                    return;
                }
                let info = self.node_info(stmt, index, Some(name.clone()));
                if let Some(tail) = self.visit_expr(expr, index, &info, None) {
                    self.bindings.insert(name.clone(), tail);
                }
            }
            StmtKind::Bare { expr } | StmtKind::Return { expr: Some(expr) } => {
                if expr.is_opaque() {
                    return;
                }
                let info = self.node_info(stmt, index, None);
                self.visit_expr(expr, index, &info, None);
            }
            StmtKind::Return { expr: None } => {}
            StmtKind::Loop(loop_stmt) => {
                let source = self.program.source_of(stmt.span).to_string();
                let (imports, literal_refs) = self.classify_refs(&source);

                let mut body_tools: Vec<Arc<str>> = Vec::new();
                collect_body_tools(&loop_stmt.body, &mut body_tools);

                let loop_id = self.dag.add_node(|id| LogicalNode::Loop {
                    id,
                    loop_type: loop_stmt.loop_type,
                    condition: loop_stmt.condition.clone(),
                    body_code: source.clone(),
                    body_tools: body_tools.clone(),
                    position: index,
                    parent_scope: None,
                });
                self.info.insert(
                    loop_id,
                    NodeInfo {
                        stmt_index: index,
                        stmt_source: source,
                        export: None,
                        imports: imports.clone(),
                        literal_refs,
                    },
                );
                self.wire_imports(loop_id, &imports);

                // Body atoms for the learner: scoped, never scheduled
                self.visit_scoped_body(&loop_stmt.body, index, loop_id);
            }
            StmtKind::If(if_stmt) => {
                let source = self.program.source_of(stmt.span).to_string();
                let (imports, literal_refs) = self.classify_refs(&source);

                let decision_id = self.dag.add_node(|id| LogicalNode::Decision {
                    id,
                    condition: if_stmt.condition.clone(),
                    code: source.clone(),
                    position: index,
                    parent_scope: None,
                });
                self.info.insert(
                    decision_id,
                    NodeInfo {
                        stmt_index: index,
                        stmt_source: source,
                        export: None,
                        imports: imports.clone(),
                        literal_refs,
                    },
                );
                self.wire_imports(decision_id, &imports);

                self.visit_scoped_branch(&if_stmt.then_branch, index, decision_id, "then");
                self.visit_scoped_branch(&if_stmt.else_branch, index, decision_id, "else");
            }
        }
    }

    /// Create the nodes for one expression; returns the chain tail (the node
    /// whose output is the statement's value).
    fn visit_expr(
        &mut self,
        expr: &Expr,
        index: usize,
        info: &NodeInfo,
        parent_scope: Option<NodeId>,
    ) -> Option<NodeId> {
        if let Head::FanOut(branches) = &expr.head {
            // Branches become siblings: each gets the statement's deps
            let mut last = None;
            for branch in branches {
                last = self.visit_expr(branch, index, info, parent_scope);
            }
            return last;
        }

        let head_node = match &expr.head {
            Head::Mcp {
                server, tool, args, ..
            } => {
                let tool_id = intern(&format!("{}:{}", server, tool));
                Some(self.dag.add_node(|id| LogicalNode::Task {
                    id,
                    tool: tool_id,
                    inputs: args.clone(),
                    position: index,
                    parent_scope,
                }))
            }
            Head::Capability { name, args, .. } => {
                let tool_id = intern(&format!("capability:{}", name));
                Some(self.dag.add_node(|id| LogicalNode::Task {
                    id,
                    tool: tool_id,
                    inputs: args.clone(),
                    position: index,
                    parent_scope,
                }))
            }
            Head::FanOut(_) => unreachable!("handled above"),
            Head::Value => None,
        };

        let mut entry = head_node;
        let mut tail = head_node;
        let mut last_chain_op: Option<NodeId> = None;

        for op in &expr.ops {
            let code = op.span.slice(&self.program.source).to_string();
            let tool = intern(&format!("code:{}", op.op));
            let executable = op.nesting == 0 && parent_scope.is_none();

            if op.nesting == 0 {
                let node = self.dag.add_node(|id| LogicalNode::Operation {
                    id,
                    tool,
                    code,
                    pure: true,
                    executable,
                    position: index,
                    parent_scope,
                });
                if let Some(prev) = tail {
                    self.dag.add_edge(prev, node, EdgeKind::Sequence);
                    if let Some(export) = &info.export {
                        self.dag.add_edge(
                            prev,
                            node,
                            EdgeKind::Provides {
                                props: vec![export.clone()],
                            },
                        );
                    }
                }
                if entry.is_none() {
                    entry = Some(node);
                }
                tail = Some(node);
                last_chain_op = Some(node);
            } else {
                // Nested atom: visible to the learner only
                let node = self.dag.add_node(|id| LogicalNode::Operation {
                    id,
                    tool,
                    code,
                    pure: true,
                    executable: false,
                    position: index,
                    parent_scope,
                });
                if let Some(outer) = last_chain_op.or(head_node) {
                    self.dag.add_edge(outer, node, EdgeKind::Contains);
                }
            }
        }

        // Book-keeping: statement info on every node this expression
        // created, export on the chain tail only
        if let (Some(first), Some(_)) = (entry, tail) {
            let ids: Vec<NodeId> = self
                .dag
                .nodes
                .iter()
                .map(LogicalNode::id)
                .filter(|id| *id >= first)
                .collect();
            for id in ids {
                let mut node_info = info.clone();
                if Some(id) != tail {
                    node_info.export = None;
                }
                self.info.entry(id).or_insert(node_info);
            }
        }

        if parent_scope.is_none() {
            if let Some(entry) = entry {
                self.wire_imports(entry, &info.imports);
            }
        }

        tail
    }

    /// Loop body atoms: scoped nodes with loop_body edges.
    fn visit_scoped_body(&mut self, body: &[Stmt], index: usize, scope: NodeId) {
        for stmt in body {
            if let StmtKind::Binding { expr, .. } | StmtKind::Bare { expr }
            | StmtKind::Return { expr: Some(expr) } = &stmt.kind
            {
                if expr.is_opaque() {
                    continue;
                }
                let info = NodeInfo {
                    stmt_index: index,
                    stmt_source: self.program.source_of(stmt.span).to_string(),
                    ..Default::default()
                };
                let before = self.dag.len();
                self.visit_expr(expr, index, &info, Some(scope));
                for node_index in before..self.dag.len() {
                    let id = NodeId(node_index as u32);
                    if self.dag.node(id).parent_scope() == Some(scope) {
                        self.dag.add_edge(scope, id, EdgeKind::LoopBody);
                    }
                }
            }
        }
    }

    /// Decision branch atoms: scoped nodes with conditional edges tagged by
    /// outcome.
    fn visit_scoped_branch(&mut self, body: &[Stmt], index: usize, scope: NodeId, outcome: &str) {
        for stmt in body {
            if let StmtKind::Binding { expr, .. } | StmtKind::Bare { expr }
            | StmtKind::Return { expr: Some(expr) } = &stmt.kind
            {
                if expr.is_opaque() {
                    continue;
                }
                let info = NodeInfo {
                    stmt_index: index,
                    stmt_source: self.program.source_of(stmt.span).to_string(),
                    ..Default::default()
                };
                let before = self.dag.len();
                self.visit_expr(expr, index, &info, Some(scope));
                let mut first = true;
                for node_index in before..self.dag.len() {
                    let id = NodeId(node_index as u32);
                    if self.dag.node(id).parent_scope() == Some(scope) && first {
                        self.dag.add_edge(
                            scope,
                            id,
                            EdgeKind::Conditional {
                                outcome: outcome.to_string(),
                            },
                        );
                        first = false;
                    }
                }
            }
        }
    }
}

/// Collect the deduplicated tool list for a loop body, first-seen order.
fn collect_body_tools(body: &[Stmt], out: &mut Vec<Arc<str>>) {
    let mut push = |tool: Arc<str>, out: &mut Vec<Arc<str>>| {
        if !out.iter().any(|t| t == &tool) {
            out.push(tool);
        }
    };

    for stmt in body {
        match &stmt.kind {
            StmtKind::Binding { expr, .. } | StmtKind::Bare { expr }
            | StmtKind::Return { expr: Some(expr) } => {
                collect_expr_tools(expr, &mut push, out);
            }
            StmtKind::Loop(inner) => collect_body_tools(&inner.body, out),
            StmtKind::If(inner) => {
                collect_body_tools(&inner.then_branch, out);
                collect_body_tools(&inner.else_branch, out);
            }
            StmtKind::Return { expr: None } => {}
        }
    }
}

fn collect_expr_tools(
    expr: &Expr,
    push: &mut impl FnMut(Arc<str>, &mut Vec<Arc<str>>),
    out: &mut Vec<Arc<str>>,
) {
    match &expr.head {
        Head::Mcp { server, tool, .. } => {
            push(intern(&format!("{}:{}", server, tool)), out);
        }
        Head::Capability { name, .. } => {
            push(intern(&format!("capability:{}", name)), out);
        }
        Head::FanOut(branches) => {
            for branch in branches {
                collect_expr_tools(branch, push, out);
            }
        }
        Head::Value => {}
    }
    for op in &expr.ops {
        if op.nesting == 0 {
            push(intern(&format!("code:{}", op.op)), out);
        }
    }
}
