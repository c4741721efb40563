//! Standard graph shapes.
//!
//! - [`linear_chain`]: `n0 -> n1 -> ... `, one output each.
//! - [`grow_chain`]: a 100-byte producer freed before a 200-byte one.
//! - [`hcom_cascade`]: two producers feeding a collective with
//!   continuous inputs and outputs.
//! - [`atomic_beside_data`]: an atomic-cleaned output after plain data.
//! - [`ref_passthrough`]: an in-place op aliasing its input.
//! - [`dynamic_batch`]: two labeled branches that never run together.
//! - [`two_stream_fork`]: a producer read from another stream.

use indexmap::IndexMap;
use memblock_graph::{Graph, NodeAttrs, NodeDef, NodeId, StreamId};

use crate::{bytes, out, GraphBuilder};

/// `count` ops in a line, each producing `size` bytes for the next.
pub fn linear_chain(count: usize, size: i64) -> (Graph, Vec<NodeId>) {
    let mut b = GraphBuilder::new("linear_chain");
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let inputs: Vec<_> = ids.last().map(|&p| out(p, 0)).into_iter().collect();
        ids.push(b.op(&format!("n{i}"), &inputs, size));
    }
    (b.build(), ids)
}

/// `a(100) -> b(100) -> c(200) -> d`. `a` is dead once `b` ran, so `c`
/// can take its block.
pub fn grow_chain() -> (Graph, [NodeId; 4]) {
    let mut b = GraphBuilder::new("grow_chain");
    let a = b.op("a", &[], 100);
    let n1 = b.op("b", &[out(a, 0)], 100);
    let c = b.op("c", &[out(n1, 0)], 200);
    let d = b.op("d", &[out(c, 0)], 100);
    (b.build(), [a, n1, c, d])
}

/// `p0`, `p1` feed an all-reduce whose inputs and outputs must each be
/// contiguous; a consumer reads both outputs.
pub fn hcom_cascade(sizes: [i64; 2]) -> (Graph, [NodeId; 4]) {
    let mut b = GraphBuilder::new("hcom_cascade");
    let p0 = b.op("p0", &[], sizes[0]);
    let p1 = b.op("p1", &[], sizes[1]);
    let hcom = b.node(
        NodeDef::new("allreduce", "HcomAllReduce")
            .output(bytes(sizes[0]))
            .output(bytes(sizes[1]))
            .attrs(NodeAttrs {
                continuous_input: true,
                continuous_output: true,
                ..NodeAttrs::default()
            }),
        &[out(p0, 0), out(p1, 0)],
    );
    let sink = b.op("sink", &[out(hcom, 0), out(hcom, 1)], 64);
    (b.build(), [p0, p1, hcom, sink])
}

/// `a -> hcom1 -> {hcom2, hcom3, b}`.
///
/// `hcom1` has three continuous outputs of 1000, 2000 and 3000 bytes.
/// `hcom2` needs outputs 0 and 1 as a continuous input list, `hcom3`
/// outputs 1 and 2; `b` reads output 2 directly.
pub fn hcom_fanout() -> (Graph, [NodeId; 5]) {
    let continuous_input = || NodeAttrs {
        continuous_input: true,
        ..NodeAttrs::default()
    };
    let mut b = GraphBuilder::new("hcom_fanout");
    let a = b.op("a", &[], 512);
    let hcom1 = b.node(
        NodeDef::new("hcom1", "HcomBroadcast")
            .output(bytes(1000))
            .output(bytes(2000))
            .output(bytes(3000))
            .attrs(NodeAttrs {
                continuous_output: true,
                ..NodeAttrs::default()
            }),
        &[out(a, 0)],
    );
    let hcom2 = b.node(
        NodeDef::new("hcom2", "HcomAllReduce").output(bytes(512)).attrs(continuous_input()),
        &[out(hcom1, 0), out(hcom1, 1)],
    );
    let hcom3 = b.node(
        NodeDef::new("hcom3", "HcomAllReduce").output(bytes(512)).attrs(continuous_input()),
        &[out(hcom1, 1), out(hcom1, 2)],
    );
    let reader = b.op("b", &[out(hcom1, 2)], 512);
    (b.build(), [a, hcom1, hcom2, hcom3, reader])
}

/// `input -> x -> atomic -> sink`. `input` is plain data and is dead by
/// the time `atomic` needs a block of the same size.
pub fn atomic_beside_data() -> (Graph, [NodeId; 4]) {
    let mut b = GraphBuilder::new("atomic_beside_data");
    let input = b.data("input", 256);
    let x = b.op("x", &[out(input, 0)], 256);
    let atomic = b.node(
        NodeDef::new("atomic", "ReduceSumAtomic")
            .output(bytes(256))
            .attrs(NodeAttrs {
                atomic_outputs: vec![0],
                ..NodeAttrs::default()
            }),
        &[out(x, 0)],
    );
    let sink = b.op("sink", &[out(atomic, 0)], 128);
    (b.build(), [input, x, atomic, sink])
}

/// `src -> assign(ref 0:0) -> reader`. `assign` writes into `src`'s
/// memory.
pub fn ref_passthrough() -> (Graph, [NodeId; 3]) {
    let mut b = GraphBuilder::new("ref_passthrough");
    let src = b.op("src", &[], 1024);
    let assign = b.node(
        NodeDef::new("assign", "Assign").output(bytes(1024)).attrs(NodeAttrs {
            ref_outputs: IndexMap::from([(0, 0)]),
            ..NodeAttrs::default()
        }),
        &[out(src, 0)],
    );
    let reader = b.op("reader", &[out(assign, 0)], 512);
    (b.build(), [src, assign, reader])
}

/// `input` feeds branch `b1` (two ops) and branch `b2` (one larger op);
/// an unlabeled `merge` reads both branch ends.
pub fn dynamic_batch() -> (Graph, [NodeId; 5]) {
    let labeled = |label: &str| NodeAttrs {
        batch_label: Some(label.to_string()),
        ..NodeAttrs::default()
    };
    let mut b = GraphBuilder::new("dynamic_batch");
    let input = b.data("input", 64);
    let b1a = b.node(
        NodeDef::new("b1_a", "Op").output(bytes(2048)).attrs(labeled("b1")),
        &[out(input, 0)],
    );
    let b1b = b.node(
        NodeDef::new("b1_b", "Op").output(bytes(1024)).attrs(labeled("b1")),
        &[out(b1a, 0)],
    );
    let b2 = b.node(
        NodeDef::new("b2_a", "Op").output(bytes(4096)).attrs(labeled("b2")),
        &[out(input, 0)],
    );
    let merge = b.op("merge", &[out(b1b, 0), out(b2, 0)], 64);
    (b.build(), [input, b1a, b1b, b2, merge])
}

/// `a` on stream 0 is read by `b` on stream 1 and `c` on stream 0.
pub fn two_stream_fork() -> (Graph, [NodeId; 3]) {
    let mut b = GraphBuilder::new("two_stream_fork");
    let a = b.op("a", &[], 1024);
    let side = b.node(NodeDef::new("side", "Op").stream(1).output(bytes(512)), &[out(a, 0)]);
    let c = b.op("c", &[out(a, 0)], 1024);
    (b.build(), [a, side, c])
}

/// Streams of a graph's nodes, in node order.
pub fn streams(graph: &Graph) -> Vec<StreamId> {
    graph.nodes().map(|n| n.stream_id).collect()
}
