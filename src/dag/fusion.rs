//! Physical DAG construction - fusion
//!
//! Two fusion patterns applied over the logical DAG:
//!
//! - **Sequential fusion**: a chain `A → B → C` of pure code operations
//!   (in/out degree one within the schedulable projection) collapses into a
//!   single `code_exec` task whose body is the statement sequence ending in
//!   a return of the last binding.
//! - **Fork-join fusion**: sibling pure groups sharing the same dependency
//!   set collapse into one task that evaluates the branches and returns all
//!   of their bindings; `metadata.fusionPattern = fork-join`.
//!
//! External-effect tasks (mcp calls, non-minimal scopes) are never fused.
//! Loops become a single `code_exec` whose code is the extracted loop
//! source; `bodyTools` rides along in the metadata. Literal bindings are
//! assembled into their consumers' fused code.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::dag::builder::BuildOutput;
use crate::dag::logical::{EdgeKind, LogicalNode, NodeId};
use crate::dag::physical::{
    DepVec, FusionPattern, PhysicalDag, PhysicalTask, SandboxConfig, TaskKind, TaskMetadata,
};
use crate::error::Result;
use crate::mux::{Scope, ToolIndex};
use crate::util::intern;

/// Build the physical DAG from a logical build output.
///
/// `index` stamps mcp tasks with their declared scope; unknown tools keep
/// the default scope and surface `UnknownTool` when their layer runs.
pub fn fuse(output: &BuildOutput, index: &ToolIndex) -> Result<PhysicalDag> {
    Fuser::new(output, index).run()
}

struct Fuser<'a> {
    output: &'a BuildOutput,
    index: &'a ToolIndex,
    /// Union-find parent table over schedulable nodes
    parent: FxHashMap<NodeId, NodeId>,
    /// Groups merged by fork-join fusion (representative → branch count)
    fork_join: FxHashMap<NodeId, usize>,
}

impl<'a> Fuser<'a> {
    fn new(output: &'a BuildOutput, index: &'a ToolIndex) -> Self {
        Self {
            output,
            index,
            parent: FxHashMap::default(),
            fork_join: FxHashMap::default(),
        }
    }

    fn find(&mut self, id: NodeId) -> NodeId {
        let p = *self.parent.get(&id).unwrap_or(&id);
        if p == id {
            return id;
        }
        let root = self.find(p);
        self.parent.insert(id, root);
        root
    }

    fn union(&mut self, a: NodeId, b: NodeId) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Keep the earlier node as representative for stable ids
            let (keep, fold) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(fold, keep);
        }
    }

    fn is_fusable(&self, id: NodeId) -> bool {
        matches!(
            self.output.logical.node(id),
            LogicalNode::Operation {
                pure: true,
                executable: true,
                parent_scope: None,
                ..
            }
        )
    }

    fn run(mut self) -> Result<PhysicalDag> {
        let output = self.output;
        let logical = &output.logical;
        logical.detect_cycles()?;

        let schedulable: Vec<NodeId> = logical
            .topo_order()?
            .into_iter()
            .filter(|id| logical.node(*id).is_schedulable())
            .collect();
        let schedulable_set: FxHashSet<NodeId> = schedulable.iter().copied().collect();

        // Projected ordering edges among schedulable nodes
        let mut succs: FxHashMap<NodeId, FxHashSet<NodeId>> = FxHashMap::default();
        let mut preds: FxHashMap<NodeId, FxHashSet<NodeId>> = FxHashMap::default();
        for edge in &logical.edges {
            if edge.kind.is_ordering()
                && schedulable_set.contains(&edge.from)
                && schedulable_set.contains(&edge.to)
                && edge.from != edge.to
            {
                succs.entry(edge.from).or_default().insert(edge.to);
                preds.entry(edge.to).or_default().insert(edge.from);
            }
        }

        // ── Sequential fusion ──
        for &id in &schedulable {
            if !self.is_fusable(id) {
                continue;
            }
            let Some(next) = succs.get(&id) else { continue };
            if next.len() != 1 {
                continue;
            }
            let next = *next.iter().next().expect("single successor");
            if !self.is_fusable(next) {
                continue;
            }
            if preds.get(&next).map_or(0, FxHashSet::len) != 1 {
                continue;
            }
            self.union(id, next);
        }

        // ── Fork-join fusion ──
        // Bucket all-pure groups by their dependency group set
        let mut group_members: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
        for &id in &schedulable {
            let rep = self.find(id);
            group_members.entry(rep).or_default().push(id);
        }

        let mut buckets: FxHashMap<Vec<NodeId>, Vec<NodeId>> = FxHashMap::default();
        for (&rep, members) in &group_members {
            if !members.iter().all(|&m| self.is_fusable(m)) {
                continue;
            }
            let mut dep_reps: Vec<NodeId> = members
                .iter()
                .flat_map(|m| preds.get(m).into_iter().flatten())
                .map(|&p| self.find(p))
                .filter(|&r| r != rep)
                .collect();
            dep_reps.sort();
            dep_reps.dedup();
            buckets.entry(dep_reps).or_default().push(rep);
        }

        for (_, mut reps) in buckets {
            if reps.len() < 2 {
                continue;
            }
            reps.sort();
            let first = reps[0];
            for &other in &reps[1..] {
                self.union(first, other);
            }
            let keep = self.find(first);
            self.fork_join.insert(keep, reps.len());
        }

        // ── Materialise groups as physical tasks ──
        let mut groups: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
        for &id in &schedulable {
            let rep = self.find(id);
            groups.entry(rep).or_default().push(id);
        }
        for members in groups.values_mut() {
            members.sort_by_key(|&m| (output.info[&m].stmt_index, m));
        }

        // Stable task numbering: by first statement, then node id
        let mut ordered: Vec<NodeId> = groups.keys().copied().collect();
        ordered.sort_by_key(|rep| {
            let first = groups[rep][0];
            (output.info[&first].stmt_index, first)
        });

        let mut task_ids: FxHashMap<NodeId, Arc<str>> = FxHashMap::default();
        for (i, rep) in ordered.iter().enumerate() {
            task_ids.insert(*rep, intern(&format!("task_{}", i)));
        }

        let mut dag = PhysicalDag {
            logical: logical.clone(),
            ..Default::default()
        };

        for rep in &ordered {
            let members = &groups[rep];
            let task_id = Arc::clone(&task_ids[rep]);

            // Group dependencies
            let mut dep_ids: DepVec = DepVec::new();
            for &m in members {
                for p in preds.get(&m).into_iter().flatten() {
                    let p_rep = self.find(*p);
                    if p_rep != *rep {
                        let dep = Arc::clone(&task_ids[&p_rep]);
                        if !dep_ids.iter().any(|d| d == &dep) {
                            dep_ids.push(dep);
                        }
                    }
                }
            }

            let task = self.build_task(task_id.clone(), members, dep_ids)?;
            dag.tasks.push(task);

            for &m in members {
                dag.logical_to_physical.insert(m, Arc::clone(&task_id));
            }
            dag.physical_to_logical
                .insert(Arc::clone(&task_id), members.clone());
        }

        // Non-schedulable nodes map to their enclosing task
        for node in &logical.nodes {
            let id = node.id();
            if dag.logical_to_physical.contains_key(&id) {
                continue;
            }
            let owner = node
                .parent_scope()
                .or_else(|| {
                    logical
                        .edges
                        .iter()
                        .find(|e| e.to == id && e.kind == EdgeKind::Contains)
                        .map(|e| e.from)
                })
                .map(|owner| self.find(owner));
            if let Some(owner) = owner {
                if let Some(task_id) = task_ids.get(&owner) {
                    dag.logical_to_physical.insert(id, Arc::clone(task_id));
                    dag.physical_to_logical
                        .get_mut(task_id)
                        .expect("group entry")
                        .push(id);
                }
            }
        }

        Ok(dag)
    }

    /// Build the physical task for one group.
    fn build_task(
        &mut self,
        task_id: Arc<str>,
        members: &[NodeId],
        deps: DepVec,
    ) -> Result<PhysicalTask> {
        let output = self.output;
        let logical = &output.logical;

        if members.len() == 1 {
            let id = members[0];
            let node = logical.node(id);
            let info = &output.info[&id];

            return Ok(match node {
                LogicalNode::Task { tool, inputs, .. } => {
                    if tool.starts_with("capability:") {
                        PhysicalTask {
                            id: task_id,
                            kind: TaskKind::CodeExec,
                            tool: Arc::clone(tool),
                            code: None,
                            args: Some(inputs.clone()),
                            deps,
                            exports: info.export.clone().into_iter().collect(),
                            imports: info.imports.clone(),
                            metadata: TaskMetadata {
                                logical_tools: vec![Arc::clone(tool)],
                                ..Default::default()
                            },
                            sandbox: SandboxConfig::minimal(),
                        }
                    } else {
                        let scope = self
                            .index
                            .get(tool)
                            .map(|d| d.scope)
                            .unwrap_or(Scope::McpStandard);
                        PhysicalTask {
                            id: task_id,
                            kind: TaskKind::McpCall,
                            tool: Arc::clone(tool),
                            code: None,
                            args: Some(inputs.clone()),
                            deps,
                            exports: info.export.clone().into_iter().collect(),
                            imports: info.imports.clone(),
                            metadata: TaskMetadata {
                                logical_tools: vec![Arc::clone(tool)],
                                ..Default::default()
                            },
                            sandbox: SandboxConfig { scope },
                        }
                    }
                }
                LogicalNode::Loop {
                    id: loop_id,
                    body_code,
                    body_tools,
                    ..
                } => {
                    let external = body_tools.iter().any(|t| !t.starts_with("code:"));
                    PhysicalTask {
                        id: task_id,
                        kind: TaskKind::CodeExec,
                        tool: node.tool(),
                        code: Some(self.assemble_code(members, true)),
                        args: None,
                        deps,
                        exports: info.export.clone().into_iter().collect(),
                        imports: info.imports.clone(),
                        metadata: TaskMetadata {
                            loop_id: Some(*loop_id),
                            body_tools: body_tools.clone(),
                            logical_tools: std::iter::once(node.tool())
                                .chain(body_tools.iter().cloned())
                                .collect(),
                            ..Default::default()
                        },
                        sandbox: SandboxConfig {
                            scope: if external {
                                Scope::McpStandard
                            } else {
                                Scope::Minimal
                            },
                        },
                    }
                }
                LogicalNode::Decision { id: decision_id, .. } => {
                    let branch_external = logical.nodes.iter().any(|n| {
                        n.parent_scope() == Some(*decision_id)
                            && matches!(n, LogicalNode::Task { .. })
                    });
                    PhysicalTask {
                        id: task_id,
                        kind: TaskKind::CodeExec,
                        tool: node.tool(),
                        code: Some(self.assemble_code(members, true)),
                        args: None,
                        deps,
                        exports: info.export.clone().into_iter().collect(),
                        imports: info.imports.clone(),
                        metadata: TaskMetadata {
                            logical_tools: vec![node.tool()],
                            ..Default::default()
                        },
                        sandbox: SandboxConfig {
                            scope: if branch_external {
                                Scope::McpStandard
                            } else {
                                Scope::Minimal
                            },
                        },
                    }
                }
                LogicalNode::Operation { tool, .. } => PhysicalTask {
                    id: task_id,
                    kind: TaskKind::CodeExec,
                    tool: Arc::clone(tool),
                    code: Some(self.assemble_code(members, false)),
                    args: None,
                    deps,
                    exports: info.export.clone().into_iter().collect(),
                    imports: info.imports.clone(),
                    metadata: TaskMetadata {
                        pure: true,
                        logical_tools: vec![Arc::clone(tool)],
                        ..Default::default()
                    },
                    sandbox: SandboxConfig::minimal(),
                },
            });
        }

        // Fused group: pure operations only
        let rep = self.find(members[0]);
        let branch_count = self.fork_join.get(&rep).copied();
        let pattern = if branch_count.is_some() {
            FusionPattern::ForkJoin
        } else {
            FusionPattern::Sequential
        };

        let logical_tools: Vec<Arc<str>> =
            members.iter().map(|&m| logical.node(m).tool()).collect();

        let mut exports = Vec::new();
        let mut imports = Vec::new();
        let internal: FxHashSet<&str> = members
            .iter()
            .filter_map(|m| output.info[m].export.as_deref())
            .collect();
        for &m in members {
            let info = &output.info[&m];
            if let Some(export) = &info.export {
                if !exports.contains(export) {
                    exports.push(export.clone());
                }
            }
            for import in &info.imports {
                if !internal.contains(import.as_str()) && !imports.contains(import) {
                    imports.push(import.clone());
                }
            }
        }

        Ok(PhysicalTask {
            id: task_id,
            kind: TaskKind::CodeExec,
            tool: intern("code:exec"),
            code: Some(self.assemble_code(members, false)),
            args: None,
            deps,
            exports,
            imports,
            metadata: TaskMetadata {
                pure: true,
                fused_from: members.to_vec(),
                logical_tools,
                fusion_pattern: Some(pattern),
                branch_count,
                ..Default::default()
            },
            sandbox: SandboxConfig::minimal(),
        })
    }

    /// Assemble executable code for a group: referenced literal statements
    /// (source order), then each member statement (deduplicated, statement
    /// order), then a return of the produced bindings.
    fn assemble_code(&self, members: &[NodeId], raw: bool) -> String {
        let mut literal_needed: FxHashSet<&str> = FxHashSet::default();
        let mut stmts: Vec<(usize, &str)> = Vec::new();
        let mut seen_stmt: FxHashSet<usize> = FxHashSet::default();
        let mut exports: Vec<&str> = Vec::new();

        for &m in members {
            let info = &self.output.info[&m];
            for name in &info.literal_refs {
                literal_needed.insert(name.as_str());
            }
            if seen_stmt.insert(info.stmt_index) {
                stmts.push((info.stmt_index, info.stmt_source.as_str()));
            }
            if let Some(export) = &info.export {
                if !exports.contains(&export.as_str()) {
                    exports.push(export.as_str());
                }
            }
        }
        stmts.sort_by_key(|(i, _)| *i);

        let mut body = String::new();
        for (name, source) in &self.output.literals {
            if literal_needed.contains(name.as_str()) {
                body.push_str(source.trim_end_matches(';'));
                body.push_str(";\n");
            }
        }
        for (_, source) in &stmts {
            body.push_str(source.trim_end_matches(';'));
            body.push_str(";\n");
        }

        if raw {
            return body.trim_end().to_string();
        }

        let last_is_return = stmts
            .last()
            .map(|(_, s)| s.trim_start().starts_with("return"))
            .unwrap_or(false);
        if !last_is_return {
            match exports.as_slice() {
                [] => {}
                [single] => body.push_str(&format!("return {};\n", single)),
                many => {
                    body.push_str("return { ");
                    body.push_str(&many.join(", "));
                    body.push_str(" };\n");
                }
            }
        }

        body.trim_end().to_string()
    }
}
