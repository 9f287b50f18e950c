//! Property tests: logical DAG serialisation round-trips and layering laws

use proptest::prelude::*;
use std::sync::Arc;

use pml_gateway::dag::logical::{EdgeKind, LogicalDag, LogicalNode, NodeId};
use pml_gateway::dag::{build_logical, fuse, SourceScanner};
use pml_gateway::mux::ToolIndex;

/// Build an acyclic DAG from a node count and a set of forward edges.
fn arb_dag() -> impl Strategy<Value = LogicalDag> {
    (2usize..12, proptest::collection::vec((0usize..12, 0usize..12), 0..20)).prop_map(
        |(node_count, raw_edges)| {
            let mut dag = LogicalDag::new();
            for i in 0..node_count {
                if i % 3 == 0 {
                    dag.add_node(|id| LogicalNode::Task {
                        id,
                        tool: Arc::from(format!("srv:tool{}", i)),
                        inputs: format!("{{ \"i\": {} }}", i),
                        position: i,
                        parent_scope: None,
                    });
                } else {
                    dag.add_node(|id| LogicalNode::Operation {
                        id,
                        tool: Arc::from("code:map"),
                        code: format!("v{}.map(x => x)", i),
                        pure: true,
                        executable: true,
                        position: i,
                        parent_scope: None,
                    });
                }
            }
            // Forward edges only: acyclic by construction
            for (a, b) in raw_edges {
                let (a, b) = (a % node_count, b % node_count);
                if a < b {
                    dag.add_edge(
                        NodeId(a as u32),
                        NodeId(b as u32),
                        EdgeKind::Sequence,
                    );
                }
            }
            dag
        },
    )
}

proptest! {
    /// Serialising and reparsing yields an isomorphic graph.
    #[test]
    fn serde_round_trip_is_isomorphic(dag in arb_dag()) {
        let json = serde_json::to_string(&dag).unwrap();
        let back: LogicalDag = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(&back.nodes, &dag.nodes);
        prop_assert_eq!(&back.edges, &dag.edges);
    }

    /// Forward-edge DAGs never report cycles and always topo-sort fully.
    #[test]
    fn forward_edges_are_acyclic(dag in arb_dag()) {
        prop_assert!(dag.detect_cycles().is_ok());
        let order = dag.topo_order().unwrap();
        prop_assert_eq!(order.len(), dag.len());
    }

    /// Every task in a fused DAG keeps its dependencies inside earlier layers.
    #[test]
    fn layers_respect_dependencies(dag in arb_dag()) {
        // Route through fusion to get a physical DAG; reuse the logical arena
        let output = pml_gateway::dag::BuildOutput {
            logical: dag,
            info: Default::default(),
            literals: Vec::new(),
        };
        // Fusion needs node info; synthesise neutral entries
        let mut output = output;
        for node in &output.logical.nodes {
            output.info.insert(node.id(), Default::default());
        }

        let physical = fuse(&output, &ToolIndex::new()).unwrap();
        let layers = physical.layers().unwrap();

        let layer_of = |id: &str| -> usize {
            layers
                .iter()
                .position(|l| l.iter().any(|t| &**t == id))
                .expect("task in some layer")
        };

        for task in &physical.tasks {
            for dep in &task.deps {
                prop_assert!(layer_of(dep) < layer_of(&task.id));
            }
        }
    }
}

/// The fusion round-trip law on the seed pipeline: the fused execution path,
/// with pure-operation entries dropped, matches the unfused path.
#[test]
fn fused_and_unfused_paths_agree_on_external_calls() {
    let code = "const rows = await mcp.db.query({}); const a = rows.filter(r => r.ok); const b = a.map(r => r.id);";
    let output = build_logical(&SourceScanner::new(), code).unwrap();
    let physical = fuse(&output, &ToolIndex::new()).unwrap();

    // Logical tools across physical tasks, fusion order
    let fused_path: Vec<String> = physical
        .tasks
        .iter()
        .flat_map(|t| t.metadata.logical_tools.iter().map(|s| s.to_string()))
        .collect();

    // Direct (unfused) path: schedulable logical nodes in topo order
    let direct_path: Vec<String> = output
        .logical
        .topo_order()
        .unwrap()
        .into_iter()
        .map(|id| output.logical.node(id))
        .filter(|n| n.is_schedulable())
        .map(|n| n.tool().to_string())
        .collect();

    let drop_pure = |path: &[String]| -> Vec<String> {
        path.iter()
            .filter(|t| !t.starts_with("code:"))
            .cloned()
            .collect()
    };

    assert_eq!(drop_pure(&fused_path), drop_pure(&direct_path));
    assert_eq!(fused_path, direct_path);
}
