//! Property tests over generated graphs.

use memblock_assign::{
    AssignConfig, BlockMemAssigner, MemoryAssignment, RangeStrategy, ReuseStrategy,
};
use memblock_graph::{Graph, InputRef, SymbolTable};
use memblock_test_utils::fixtures::hcom_cascade;
use memblock_test_utils::{build_dag, out, NodeSpec};
use proptest::collection::vec;
use proptest::prelude::*;

fn node_spec() -> impl Strategy<Value = NodeSpec> {
    (
        0i64..3,
        vec(0i64..5000, 0..3),
        vec(0i64..3000, 0..2),
        vec((0usize..24, 0u32..3), 0..3),
        prop_oneof![4 => Just(None), 1 => Just(Some("b1")), 1 => Just(Some("b2"))],
    )
        .prop_map(|(stream, output_bytes, workspace_bytes, inputs, label)| NodeSpec {
            stream,
            output_bytes,
            workspace_bytes,
            inputs,
            batch_label: label.map(str::to_string),
        })
}

fn config() -> impl Strategy<Value = AssignConfig> {
    (
        prop_oneof![
            Just(RangeStrategy::Binary),
            Just(RangeStrategy::Max),
            Just(RangeStrategy::Hybrid)
        ],
        any::<[bool; 4]>(),
        any::<bool>(),
        any::<bool>(),
        1usize..=8,
    )
        .prop_map(|(strategy, flags, optimize, level2, depth)| AssignConfig {
            strategy,
            reuse: ReuseStrategy {
                use_range: flags[0],
                ascending_sort: flags[1],
                reuse_first_release: flags[2],
                memory_priority_mode: flags[3],
            },
            optimize_diff_stream: optimize,
            level2_reuse: level2,
            max_reuse_depth: depth,
            ..AssignConfig::new()
        })
}

fn run(graph: &Graph, config: AssignConfig) -> MemoryAssignment {
    let symbols = SymbolTable::new();
    BlockMemAssigner::new(graph, &symbols, config)
        .unwrap()
        .assign()
        .unwrap()
}

proptest! {
    #[test]
    fn placements_never_collide(
        specs in vec(node_spec(), 1..24),
        config in config(),
    ) {
        let graph = build_dag(&specs);
        let plan = run(&graph, config);
        prop_assert!(plan.check_invariants().is_ok(), "{:?}", plan.check_invariants());
    }

    #[test]
    fn every_slot_is_placed_and_aligned(specs in vec(node_spec(), 1..24)) {
        let graph = build_dag(&specs);
        let plan = run(&graph, AssignConfig::new());
        for node in graph.nodes() {
            for anchor in graph.output_refs(node.id) {
                let slot = plan.output(anchor);
                prop_assert!(slot.is_some(), "{} unplaced", anchor);
                if let Some(slot) = slot {
                    prop_assert_eq!(slot.offset % 512, 0);
                    prop_assert!(slot.offset + slot.size <= plan.total_size(slot.memory_type));
                }
            }
            for index in 0..node.workspaces.len() as u32 {
                prop_assert!(plan.workspace(node.id, index).is_some());
            }
            for (i, src) in graph.in_data_anchors(node.id).iter().enumerate() {
                if let Some(src) = src {
                    prop_assert_eq!(
                        plan.input_offset(InputRef::new(node.id, i as u32)),
                        plan.output_offset(*src)
                    );
                }
            }
        }
    }

    #[test]
    fn assignment_is_deterministic(
        specs in vec(node_spec(), 1..16),
        config in config(),
    ) {
        let graph = build_dag(&specs);
        let a = run(&graph, config.clone());
        let b = run(&graph, config);
        prop_assert_eq!(a.overall_size(), b.overall_size());
        prop_assert!(a.outputs().map(|(k, s)| (k, *s)).eq(b.outputs().map(|(k, s)| (k, *s))));
    }

    #[test]
    fn hybrid_is_never_worse_than_binary(specs in vec(node_spec(), 1..16)) {
        let graph = build_dag(&specs);
        let symbols = SymbolTable::new();
        let assigner = BlockMemAssigner::new(&graph, &symbols, AssignConfig::new()).unwrap();
        let hybrid = assigner.assign_with(RangeStrategy::Hybrid).unwrap();
        let binary = assigner.assign_with(RangeStrategy::Binary).unwrap();
        prop_assert!(hybrid.overall_size() <= binary.overall_size());
    }

    #[test]
    fn continuous_members_stay_adjacent(
        sizes in (1i64..20_000, 1i64..20_000),
        separate in any::<bool>(),
    ) {
        let (graph, [p0, p1, hcom, _]) = hcom_cascade([sizes.0, sizes.1]);
        let config = AssignConfig {
            separate_atomic_clean: separate,
            ..AssignConfig::new()
        };
        let plan = run(&graph, config);
        prop_assert!(plan.check_invariants().is_ok());

        let first = plan.output(out(p0, 0)).unwrap();
        let aligned = first.size.div_ceil(512) * 512;
        prop_assert_eq!(plan.output_offset(out(p1, 0)), Some(first.offset + aligned));
        let h0 = plan.output(out(hcom, 0)).unwrap();
        let aligned = h0.size.div_ceil(512) * 512;
        prop_assert_eq!(plan.output_offset(out(hcom, 1)), Some(h0.offset + aligned));
    }
}
