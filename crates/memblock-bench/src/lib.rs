//! Benchmark profiles for the memblock assignment engine.
//!
//! Provides pre-built graphs for benchmarking:
//!
//! - [`transformer_profile`]: stacked decoder layers with a collective per
//!   layer and a side stream
//! - [`random_profile`]: a seeded random DAG of plain ops
//! - [`lcg`]: the deterministic generator behind [`random_profile`]

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use indexmap::IndexMap;
use memblock_graph::{
    op_type, DataType, Graph, InputRef, NodeAttrs, NodeDef, NodeId, OutputRef, TensorDesc,
};

const BATCH: i64 = 8;
const SEQ: i64 = 512;
const HIDDEN: i64 = 1024;

fn activation(width: i64) -> TensorDesc {
    TensorDesc::new(&[BATCH, SEQ, width], DataType::Float16)
}

fn add(graph: &mut Graph, def: NodeDef, inputs: &[OutputRef]) -> NodeId {
    let id = graph.add_node(def.inputs(inputs.len() as u32));
    for (i, &src) in inputs.iter().enumerate() {
        // Sources are always earlier nodes of the same profile.
        graph
            .connect(src, InputRef::new(id, i as u32))
            .unwrap_or_else(|e| panic!("profile wiring failed: {e}"));
    }
    id
}

/// `layers` decoder layers over an `[8, 512, 1024]` f16 activation.
///
/// Each layer: norm, fused QKV projection with a workspace, attention with
/// an atomic workspace, output projection, an all-reduce with continuous
/// input and output, a residual add, and a two-matmul MLP. A statistics op
/// on stream 1 reads the norm output and feeds the residual add, so every
/// layer carries cross-stream edges.
pub fn transformer_profile(layers: usize) -> Graph {
    let mut g = Graph::new("transformer");
    let mut x = add(
        &mut g,
        NodeDef::new("input", op_type::DATA).output(activation(HIDDEN)),
        &[],
    );
    for l in 0..layers {
        let norm = add(
            &mut g,
            NodeDef::new(format!("l{l}.norm"), "LayerNorm").output(activation(HIDDEN)),
            &[OutputRef::new(x, 0)],
        );
        let stats = add(
            &mut g,
            NodeDef::new(format!("l{l}.stats"), "ReduceMean")
                .stream(1)
                .output(TensorDesc::new(&[BATCH, SEQ], DataType::Float32)),
            &[OutputRef::new(norm, 0)],
        );
        let qkv = add(
            &mut g,
            NodeDef::new(format!("l{l}.qkv"), "MatMul")
                .output(activation(3 * HIDDEN))
                .workspace(1 << 20),
            &[OutputRef::new(norm, 0)],
        );
        let attn = add(
            &mut g,
            NodeDef::new(format!("l{l}.attn"), "FlashAttention")
                .output(activation(HIDDEN))
                .workspace(4 << 20)
                .attrs(NodeAttrs {
                    atomic_workspaces: vec![0],
                    ..NodeAttrs::default()
                }),
            &[OutputRef::new(qkv, 0)],
        );
        let proj = add(
            &mut g,
            NodeDef::new(format!("l{l}.proj"), "MatMul").output(activation(HIDDEN)),
            &[OutputRef::new(attn, 0)],
        );
        let reduce = add(
            &mut g,
            NodeDef::new(format!("l{l}.allreduce"), "HcomAllReduce")
                .output(activation(HIDDEN))
                .attrs(NodeAttrs {
                    continuous_input: true,
                    continuous_output: true,
                    ..NodeAttrs::default()
                }),
            &[OutputRef::new(proj, 0)],
        );
        let residual = add(
            &mut g,
            NodeDef::new(format!("l{l}.residual"), "Add").output(activation(HIDDEN)),
            &[
                OutputRef::new(x, 0),
                OutputRef::new(reduce, 0),
                OutputRef::new(stats, 0),
            ],
        );
        let up = add(
            &mut g,
            NodeDef::new(format!("l{l}.mlp_up"), "MatMul").output(activation(4 * HIDDEN)),
            &[OutputRef::new(residual, 0)],
        );
        let down = add(
            &mut g,
            NodeDef::new(format!("l{l}.mlp_down"), "MatMul").output(activation(HIDDEN)),
            &[OutputRef::new(up, 0)],
        );
        x = add(
            &mut g,
            NodeDef::new(format!("l{l}.out"), "Add").output(activation(HIDDEN)),
            &[OutputRef::new(residual, 0), OutputRef::new(down, 0)],
        );
    }
    add(
        &mut g,
        NodeDef::new("net_output", op_type::NET_OUTPUT),
        &[OutputRef::new(x, 0)],
    );
    g
}

/// A 64-bit linear congruential step.
pub fn lcg(state: u64) -> u64 {
    state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407)
}

/// A seeded random DAG of `nodes` plain ops.
///
/// Every node has one to three outputs of up to 64 KiB, an occasional
/// workspace, and reads up to three outputs of the previous 16 nodes.
/// One node in eight runs on stream 1. An in-place op every so often
/// writes through its first input.
pub fn random_profile(nodes: usize, seed: u64) -> Graph {
    let mut g = Graph::new("random");
    let mut state = lcg(seed);
    let mut next = |bound: u64| {
        state = lcg(state);
        (state >> 33) % bound.max(1)
    };
    let mut ids: Vec<NodeId> = Vec::with_capacity(nodes);
    for n in 0..nodes {
        let mut inputs = Vec::new();
        if !ids.is_empty() {
            for _ in 0..next(4) {
                let window = ids.len().min(16) as u64;
                let src = ids[ids.len() - 1 - next(window) as usize];
                let count = g.node(src).map_or(1, |s| s.output_count()) as u64;
                let anchor = OutputRef::new(src, next(count) as u32);
                if !inputs.contains(&anchor) {
                    inputs.push(anchor);
                }
            }
        }
        let mut def = NodeDef::new(format!("n{n}"), "Op").stream(i64::from(next(8) == 0));
        for _ in 0..=next(3) {
            def = def.output(TensorDesc::new(&[next(16 * 1024) as i64 + 1], DataType::Float32));
        }
        if next(4) == 0 {
            def = def.workspace(next(256 * 1024) as i64);
        }
        if !inputs.is_empty() && next(10) == 0 {
            def = def.attrs(NodeAttrs {
                ref_outputs: IndexMap::from([(0, 0)]),
                ..NodeAttrs::default()
            });
        }
        ids.push(add(&mut g, def, &inputs));
    }
    g
}
