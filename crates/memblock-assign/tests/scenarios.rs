//! End-to-end assignment scenarios on small hand-built graphs.

use indexmap::IndexMap;
use memblock_assign::{
    assign_graph, AssignConfig, AssignError, BlockMemAssigner, ErrorKind, MemoryAssignment,
    RangeStrategy,
};
use memblock_graph::{
    DataType, Graph, InputRef, MemoryType, NodeAttrs, NodeDef, NodeId, StreamId, SymbolTable,
    TensorDesc,
};
use memblock_test_utils::fixtures::{
    atomic_beside_data, dynamic_batch, grow_chain, hcom_cascade, hcom_fanout, linear_chain,
    ref_passthrough, two_stream_fork,
};
use memblock_test_utils::{bytes, out, symbols, GraphBuilder};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn assign(graph: &Graph, config: AssignConfig) -> MemoryAssignment {
    init_tracing();
    let symbols = symbols(graph).unwrap();
    let plan = BlockMemAssigner::new(graph, &symbols, config)
        .unwrap()
        .assign()
        .unwrap();
    plan.check_invariants().unwrap();
    plan
}

fn assign_err(graph: &Graph, config: AssignConfig) -> AssignError {
    init_tracing();
    let symbols = symbols(graph).unwrap();
    BlockMemAssigner::new(graph, &symbols, config)
        .unwrap()
        .assign()
        .unwrap_err()
}

fn off(plan: &MemoryAssignment, node: NodeId, index: u32) -> u64 {
    plan.output_offset(out(node, index))
        .unwrap_or_else(|| panic!("no offset for {node}:{index}"))
}

// ── reuse ──────────────────────────────────────────────────────

#[test]
fn later_output_reuses_released_block() {
    let (g, [a, b, c, d]) = grow_chain();
    let plan = assign(&g, AssignConfig::new());

    assert_eq!(off(&plan, a, 0), off(&plan, c, 0));
    assert_eq!(off(&plan, b, 0), off(&plan, d, 0));
    assert_ne!(off(&plan, a, 0), off(&plan, b, 0));
    assert_eq!(plan.total_size(MemoryType::Hbm), 1024);

    let stats = plan.stats(MemoryType::Hbm).unwrap();
    assert_eq!(stats.theory_size, 2048);
    assert!(stats.theory_min_size <= stats.total_size);
    assert_eq!(stats.reused_slots, 2);
}

#[test]
fn inputs_read_their_producer_offset() {
    let (g, [a, b, c, _]) = grow_chain();
    let plan = assign(&g, AssignConfig::new());
    assert_eq!(plan.input_offset(InputRef::new(b, 0)), Some(off(&plan, a, 0)));
    assert_eq!(plan.input_offset(InputRef::new(c, 0)), Some(off(&plan, b, 0)));
}

#[test]
fn chain_alternates_between_two_blocks() {
    let (g, ids) = linear_chain(3, 512);
    let plan = assign(&g, AssignConfig::new());
    let offsets: Vec<u64> = ids.iter().map(|&n| off(&plan, n, 0)).collect();
    assert_eq!(offsets[0], offsets[2]);
    assert_ne!(offsets[0], offsets[1]);
}

#[test]
fn workspaces_are_reused_after_their_node() {
    let mut g = Graph::new("ws");
    let n0 = g.add_node(NodeDef::new("n0", "Op").workspace(1000));
    let n1 = g.add_node(NodeDef::new("n1", "Op").workspace(1000));
    let plan = assign(&g, AssignConfig::new());

    assert_eq!(plan.workspace_offset(n0, 0), plan.workspace_offset(n1, 0));
    assert_eq!(plan.workspace(n1, 0).map(|s| s.size), Some(1024));
    assert_eq!(plan.total_size(MemoryType::Hbm), 1024);
}

#[test]
fn memory_types_are_laid_out_independently() {
    let mut b = GraphBuilder::new("mixed");
    let host = b.node(
        NodeDef::new("host", "Op").output(bytes(512).with_memory_type(MemoryType::Host)),
        &[],
    );
    let dev = b.op("dev", &[out(host, 0)], 512);
    let g = b.build();
    let plan = assign(&g, AssignConfig::new());

    assert_eq!(off(&plan, host, 0), 0);
    assert_eq!(off(&plan, dev, 0), 0);
    assert_eq!(plan.total_size(MemoryType::Host), 512);
    assert_eq!(plan.total_size(MemoryType::Hbm), 512);
    assert_eq!(plan.overall_size(), 1024);
    assert_eq!(
        plan.memory_types().collect::<Vec<_>>(),
        vec![MemoryType::Hbm, MemoryType::Host]
    );
}

// ── attributes ─────────────────────────────────────────────────

#[test]
fn atomic_output_never_lands_on_graph_input_block() {
    let (g, [input, _, atomic, _]) = atomic_beside_data();
    let plan = assign(&g, AssignConfig::new());
    assert_ne!(off(&plan, input, 0), off(&plan, atomic, 0));
}

#[test]
fn separate_atomic_clean_lifts_the_conflict() {
    let (g, [input, _, atomic, _]) = atomic_beside_data();
    let config = AssignConfig {
        separate_atomic_clean: true,
        ..AssignConfig::new()
    };
    let plan = assign(&g, config);
    assert_eq!(off(&plan, input, 0), off(&plan, atomic, 0));
}

#[test]
fn ref_output_shares_its_source_offset() {
    let (g, [src, assign_node, reader]) = ref_passthrough();
    let plan = assign(&g, AssignConfig::new());

    assert_eq!(off(&plan, src, 0), off(&plan, assign_node, 0));
    assert_eq!(plan.input_offset(InputRef::new(reader, 0)), Some(off(&plan, src, 0)));
    // The alias keeps the source alive through `reader`.
    assert_ne!(off(&plan, reader, 0), off(&plan, src, 0));
}

#[test]
fn zero_copy_output_keeps_a_dedicated_block() {
    let mut b = GraphBuilder::new("zero_copy");
    let x = b.op("x", &[], 512);
    let y = b.op("y", &[out(x, 0)], 512);
    b.net_output(&[out(y, 0)]);
    let z = b.op("z", &[], 512);
    let g = b.build();
    let plan = assign(&g, AssignConfig::new());

    let y_slot = *plan.output(out(y, 0)).unwrap();
    let block = &plan.blocks()[y_slot.block.unwrap().index()];
    assert!(block.is_zero_copy);
    assert!(!block.reuse_mem);
    assert_eq!(off(&plan, z, 0), off(&plan, x, 0));
    for (anchor, slot) in plan.outputs() {
        if anchor != out(y, 0) && slot.size > 0 {
            assert_ne!(slot.offset, y_slot.offset, "{anchor} shares the zero-copy block");
        }
    }
}

#[test]
fn fixed_address_outputs_are_laid_out_first() {
    let mut b = GraphBuilder::new("fixed");
    let a = b.op("a", &[], 512);
    let fixed = b.node(
        NodeDef::new("fixed", "Op").output(bytes(512)).attrs(NodeAttrs {
            fixed_addr_prior_outputs: vec![0],
            ..NodeAttrs::default()
        }),
        &[out(a, 0)],
    );
    let g = b.build();
    let plan = assign(&g, AssignConfig::new());
    assert_eq!(off(&plan, fixed, 0), 0);
    assert_eq!(off(&plan, a, 0), 512);
}

#[test]
fn zero_size_outputs_sit_at_offset_zero() {
    let mut b = GraphBuilder::new("empty");
    let e = b.node(NodeDef::new("e", "Op").output(bytes(0)), &[]);
    let r = b.op("r", &[out(e, 0)], 512);
    let g = b.build();
    let plan = assign(&g, AssignConfig::new());

    let slot = plan.output(out(e, 0)).unwrap();
    assert_eq!((slot.offset, slot.size, slot.block), (0, 0, None));
    assert_eq!(plan.input_offset(InputRef::new(r, 0)), Some(0));
}

#[test]
fn no_tiling_output_gets_a_descriptor_slot() {
    let mut b = GraphBuilder::new("no_tiling");
    let n = b.node(
        NodeDef::new("dyn", "Op")
            .output(TensorDesc::new(&[-1, 16], DataType::Float32).with_no_tiling(&[8, 16])),
        &[],
    );
    let g = b.build();
    let plan = assign(&g, AssignConfig::new());

    assert_eq!(plan.output(out(n, 0)).map(|s| s.size), Some(512));
    let desc = plan.output_desc_offset(out(n, 0)).unwrap();
    assert_ne!(desc, off(&plan, n, 0));
}

// ── continuous ─────────────────────────────────────────────────

#[test]
fn collective_inputs_and_outputs_are_contiguous() {
    let (g, [p0, p1, hcom, _]) = hcom_cascade([1000, 3000]);
    let plan = assign(&g, AssignConfig::new());

    assert_eq!(off(&plan, p1, 0), off(&plan, p0, 0) + 1024);
    assert_eq!(off(&plan, hcom, 1), off(&plan, hcom, 0) + 1024);
    assert_eq!(plan.continuous().len(), 2);
    assert_eq!(plan.input_offset(InputRef::new(hcom, 1)), Some(off(&plan, p1, 0)));
}

#[test]
fn one_block_group_is_one_block() {
    let (g, [p0, p1, hcom, _]) = hcom_cascade([512, 512]);
    let config = AssignConfig {
        separate_atomic_clean: true,
        ..AssignConfig::new()
    };
    let plan = assign(&g, config);

    let block_of = |n: NodeId, i: u32| plan.output(out(n, i)).and_then(|s| s.block);
    assert_eq!(block_of(p0, 0), block_of(p1, 0));
    assert_eq!(block_of(hcom, 0), block_of(hcom, 1));
    assert_ne!(block_of(p0, 0), block_of(hcom, 0));
}

#[test]
fn collective_fanout_is_one_contiguous_allocation() {
    let (g, [_, hcom1, hcom2, hcom3, reader]) = hcom_fanout();
    let plan = assign(&g, AssignConfig::new());

    let (_, group) = plan.continuous().group_of(out(hcom1, 0)).unwrap();
    assert_eq!(group.members(), &[out(hcom1, 0), out(hcom1, 1), out(hcom1, 2)]);
    assert_eq!(group.total_size(), 1024 + 2048 + 3072);
    assert!(plan.continuous().is_need_assign_memory(out(hcom1, 0)));
    assert!(!plan.continuous().is_need_assign_memory(out(hcom1, 1)));
    assert!(!plan.continuous().is_need_assign_memory(out(hcom1, 2)));

    let base = off(&plan, hcom1, 0);
    assert_eq!(off(&plan, hcom1, 1), base + 1024);
    assert_eq!(off(&plan, hcom1, 2), base + 1024 + 2048);
    let block_of = |i: u32| plan.output(out(hcom1, i)).and_then(|s| s.block);
    assert_eq!(block_of(0), block_of(1));
    assert_eq!(block_of(1), block_of(2));

    assert_eq!(plan.input_offset(InputRef::new(hcom2, 1)), Some(base + 1024));
    assert_eq!(plan.input_offset(InputRef::new(hcom3, 1)), Some(base + 3072));
    assert_eq!(plan.input_offset(InputRef::new(reader, 0)), Some(base + 3072));
}

fn continuous_outputs(name: &str, attrs: NodeAttrs) -> NodeDef {
    NodeDef::new(name, "Split")
        .output(bytes(512))
        .output(bytes(512))
        .attrs(NodeAttrs {
            continuous_output: true,
            ..attrs
        })
}

#[test]
fn continuous_block_read_on_another_stream_stays_out_of_the_pool() {
    let mut b = GraphBuilder::new("split_side_read");
    let split = b.node(continuous_outputs("split", NodeAttrs::default()), &[]);
    b.node(
        NodeDef::new("reader", "Op").stream(1).output(bytes(512)),
        &[out(split, 0), out(split, 1)],
    );
    let split2 = b.node(continuous_outputs("split2", NodeAttrs::default()), &[]);
    let g = b.build();
    let plan = assign(&g, AssignConfig::new());

    let block = plan.output(out(split, 0)).and_then(|s| s.block).unwrap();
    assert!(!plan.blocks()[block.index()].same_stream);
    assert_ne!(off(&plan, split2, 0), off(&plan, split, 0));
    assert_ne!(off(&plan, split2, 0), off(&plan, split, 1));
}

#[test]
fn fixed_address_continuous_group_is_pinned_and_first() {
    let mut b = GraphBuilder::new("split_fixed");
    b.op("a", &[], 512);
    let split = b.node(
        continuous_outputs(
            "split",
            NodeAttrs {
                fixed_addr_prior_outputs: vec![0],
                ..NodeAttrs::default()
            },
        ),
        &[],
    );
    b.op("use", &[out(split, 0), out(split, 1)], 512);
    let split2 = b.node(continuous_outputs("split2", NodeAttrs::default()), &[]);
    let g = b.build();
    let plan = assign(&g, AssignConfig::new());

    let block = &plan.blocks()[plan.output(out(split, 0)).and_then(|s| s.block).unwrap().index()];
    assert!(block.fixed_addr_prior);
    assert!(!block.reuse_mem);
    assert_eq!(off(&plan, split, 0), 0);
    assert_eq!(off(&plan, split, 1), 512);
    assert!(off(&plan, split2, 0) >= 1024);
}

#[test]
fn continuous_group_feeding_net_output_is_zero_copy() {
    let mut b = GraphBuilder::new("split_zero_copy");
    let split = b.node(continuous_outputs("split", NodeAttrs::default()), &[]);
    b.net_output(&[out(split, 0), out(split, 1)]);
    let split2 = b.node(continuous_outputs("split2", NodeAttrs::default()), &[]);
    let g = b.build();
    let plan = assign(&g, AssignConfig::new());

    let block = &plan.blocks()[plan.output(out(split, 0)).and_then(|s| s.block).unwrap().index()];
    assert!(block.is_zero_copy);
    assert!(!block.reuse_mem);
    assert_ne!(off(&plan, split2, 0), off(&plan, split, 0));
}

#[test]
fn unconnected_continuous_input_is_unsupported() {
    let mut b = GraphBuilder::new("dangling");
    let p = b.op("p", &[], 512);
    b.node(
        NodeDef::new("hcom", "HcomAllReduce").inputs(2).attrs(NodeAttrs {
            continuous_input: true,
            ..NodeAttrs::default()
        }),
        &[out(p, 0)],
    );
    let g = b.build();
    let err = assign_err(&g, AssignConfig::new());
    assert!(matches!(err, AssignError::UnresolvedContinuousInput { input_index: 1, .. }));
    assert_eq!(err.kind(), ErrorKind::UnsupportedGraphShape);
}

#[test]
fn conflicting_continuous_orders_are_ambiguous() {
    let mut b = GraphBuilder::new("ambiguous");
    let p0 = b.op("p0", &[], 512);
    let p1 = b.op("p1", &[], 512);
    let p2 = b.op("p2", &[], 512);
    let continuous = || NodeAttrs {
        continuous_input: true,
        ..NodeAttrs::default()
    };
    b.node(NodeDef::new("h0", "Hcom").attrs(continuous()), &[out(p0, 0), out(p1, 0)]);
    b.node(NodeDef::new("h1", "Hcom").attrs(continuous()), &[out(p0, 0), out(p2, 0)]);
    let g = b.build();
    let err = assign_err(&g, AssignConfig::new());
    assert!(matches!(err, AssignError::AmbiguousContinuousBinding { .. }), "{err}");
    assert_eq!(err.kind(), ErrorKind::UnsupportedGraphShape);
}

// ── streams ────────────────────────────────────────────────────

#[test]
fn cross_stream_read_blocks_pool_reuse() {
    let (g, [a, side, c]) = two_stream_fork();
    let plan = assign(&g, AssignConfig::new());

    let a_block = plan.output(out(a, 0)).and_then(|s| s.block).unwrap();
    assert!(!plan.blocks()[a_block.index()].same_stream);
    assert_ne!(off(&plan, c, 0), off(&plan, a, 0));
    assert_ne!(off(&plan, side, 0), off(&plan, a, 0));
    assert_eq!(plan.stats(MemoryType::Hbm).unwrap().stream_count, 2);
}

#[test]
fn later_blocks_nest_after_a_cross_stream_lifetime() {
    let mut b = GraphBuilder::new("nest");
    let a = b.op("a", &[], 4096);
    let side = b.node(NodeDef::new("side", "Op").stream(1).output(bytes(512)), &[out(a, 0)]);
    let c = b.op("c", &[out(a, 0)], 1024);
    let join = b.op("join", &[out(side, 0), out(c, 0)], 512);
    let d = b.op("d", &[out(join, 0)], 1024);
    b.op("e", &[out(d, 0)], 512);
    let g = b.build();
    let plan = assign(&g, AssignConfig::new());

    assert_eq!(plan.strategy(), RangeStrategy::Binary);
    assert_eq!(off(&plan, d, 0), off(&plan, a, 0));
    assert!(plan.stats(MemoryType::Hbm).unwrap().nested_blocks >= 1);
}

#[test]
fn optimized_chain_moves_back_to_origin_stream() {
    let mut b = GraphBuilder::new("returning");
    let a = b.op("a", &[], 512);
    let mid = b.node(NodeDef::new("mid", "Op").stream(1).output(bytes(512)), &[out(a, 0)]);
    b.op("c", &[out(mid, 0)], 512);
    let mut g = b.build();
    let config = AssignConfig {
        optimize_diff_stream: true,
        ..AssignConfig::new()
    };
    let symbols = symbols(&g).unwrap();
    let plan = assign_graph(&mut g, &symbols, config).unwrap();

    assert_eq!(plan.stream_reassignments().get(&mid), Some(&StreamId(0)));
    assert_eq!(g.node(mid).unwrap().stream_id, StreamId(0));
}

// ── dynamic batch ──────────────────────────────────────────────

#[test]
fn batch_branches_overlay_each_other() {
    let (g, [_, b1a, b1b, b2, _]) = dynamic_batch();
    let plan = assign(&g, AssignConfig::new());

    assert_eq!(off(&plan, b1a, 0), off(&plan, b2, 0));
    assert_ne!(off(&plan, b1b, 0), off(&plan, b2, 0));
    assert!(plan.total_size(MemoryType::Hbm) < 512 + 2048 + 1024 + 4096);
}

// ── strategies and config ─────────────────────────────────────

#[test]
fn hybrid_keeps_the_smaller_result() {
    let (g, _) = dynamic_batch();
    let symbols = symbols(&g).unwrap();
    let assigner = BlockMemAssigner::new(&g, &symbols, AssignConfig::new()).unwrap();
    let binary = assigner.assign_with(RangeStrategy::Binary).unwrap();
    let max = assigner.assign_with(RangeStrategy::Max).unwrap();
    let hybrid = assigner.assign().unwrap();
    assert_eq!(hybrid.overall_size(), binary.overall_size().min(max.overall_size()));
}

#[test]
fn assignment_is_deterministic() {
    let (g, _) = dynamic_batch();
    let first = assign(&g, AssignConfig::new());
    let second = assign(&g, AssignConfig::new());
    let collect =
        |p: &MemoryAssignment| p.outputs().map(|(a, s)| (a, *s)).collect::<IndexMap<_, _>>();
    assert_eq!(collect(&first), collect(&second));
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let g = Graph::new("empty");
    let config = AssignConfig {
        max_reuse_depth: 0,
        ..AssignConfig::new()
    };
    let err = BlockMemAssigner::new(&g, &SymbolTable::new(), config).unwrap_err();
    assert!(matches!(err, AssignError::InvalidConfig { .. }));
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
}

#[test]
fn unknown_dimension_is_a_precondition_violation() {
    let mut g = Graph::new("dynamic");
    g.add_node(NodeDef::new("d", "Op").output(TensorDesc::new(&[-1, 4], DataType::Float16)));
    let err = assign_err(&g, AssignConfig::new());
    assert!(matches!(err, AssignError::InvalidTensorSize { .. }), "{err}");
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
}

#[test]
fn empty_graph_needs_no_memory() {
    let plan = assign(&Graph::new("empty"), AssignConfig::new());
    assert_eq!(plan.overall_size(), 0);
    assert_eq!(plan.outputs().count(), 0);
}

// ── write-back ─────────────────────────────────────────────────

#[test]
fn assign_graph_writes_offsets_into_descriptors() {
    let (mut g, [a, b, c, _]) = grow_chain();
    let symbols = symbols(&g).unwrap();
    let plan = assign_graph(&mut g, &symbols, AssignConfig::new()).unwrap();

    let a_off = off(&plan, a, 0);
    assert_eq!(g.node(a).unwrap().desc.output_offsets[0], Some(a_off));
    assert_eq!(g.node(c).unwrap().desc.output_offsets[0], Some(a_off));
    assert_eq!(g.node(b).unwrap().desc.input_offsets[0], Some(a_off));
    assert_eq!(
        g.node(a).unwrap().desc.output_memory_types[0],
        MemoryType::Hbm
    );
}

#[test]
fn apply_reports_sink_errors() {
    let (g, _) = grow_chain();
    let plan = assign(&g, AssignConfig::new());
    let mut other = Graph::new("other");
    let err = plan.apply(&mut other).unwrap_err();
    assert!(matches!(err, AssignError::Graph(_)));
}
