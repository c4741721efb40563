//! Cross-stream ordering: the edge table and the returning-chain heuristics.
//!
//! Streams execute concurrently; topological ids only order nodes on the
//! same stream. The only cross-stream ordering comes from edges whose two
//! endpoints sit on different streams. [`DiffStreamEdgeLife`] indexes
//! those edges by sub-graph and consumer stream so that lifetimes can be
//! translated from one stream's id space into another's.

use indexmap::IndexMap;

use memblock_graph::{Graph, NodeId, StreamId, SubGraphId};

use crate::error::AssignError;
use crate::utils::{predecessors, successors};

/// One edge whose producer and consumer run on different streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiffStreamEdge {
    /// The node waiting on the edge.
    pub consumer: NodeId,
    /// The node the consumer waits for.
    pub producer: NodeId,
    /// Stream of the producer.
    pub producer_stream: StreamId,
}

/// Cross-stream edges keyed by sub-graph, then by consumer stream.
///
/// Edges for each consumer stream are stored in consumer topological order.
#[derive(Clone, Debug, Default)]
pub struct DiffStreamEdgeLife {
    edges: IndexMap<SubGraphId, IndexMap<StreamId, Vec<DiffStreamEdge>>>,
}

impl DiffStreamEdgeLife {
    /// Collect every data and control edge that crosses streams.
    pub fn build<F>(graph: &Graph, stream_of: F) -> Result<Self, AssignError>
    where
        F: Fn(NodeId) -> StreamId,
    {
        let mut table = Self::default();
        for node in graph.nodes() {
            let consumer_stream = stream_of(node.id);
            for producer in predecessors(graph, node.id) {
                let producer_stream = stream_of(producer);
                if producer_stream == consumer_stream {
                    continue;
                }
                table
                    .edges
                    .entry(node.attrs.sub_graph_id)
                    .or_default()
                    .entry(consumer_stream)
                    .or_default()
                    .push(DiffStreamEdge {
                        consumer: node.id,
                        producer,
                        producer_stream,
                    });
            }
        }
        Ok(table)
    }

    /// Edges whose consumer runs on `stream`.
    pub fn edges_into(&self, sub_graph: SubGraphId, stream: StreamId) -> &[DiffStreamEdge] {
        self.edges
            .get(&sub_graph)
            .and_then(|by_stream| by_stream.get(&stream))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Total number of cross-stream edges.
    pub fn len(&self) -> usize {
        self.edges
            .values()
            .flat_map(IndexMap::values)
            .map(Vec::len)
            .sum()
    }

    /// Whether there are no cross-stream edges.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Express an end observed on `from` in the id space of `to`.
    ///
    /// The earliest node on `to` that waits for a node on `from` at or
    /// after `end`. `None` when `to` never waits for that point.
    pub fn translate_end(
        &self,
        sub_graph: SubGraphId,
        from: StreamId,
        end: u32,
        to: StreamId,
    ) -> Option<u32> {
        self.edges_into(sub_graph, to)
            .iter()
            .filter(|e| e.producer_stream == from && e.producer.0 >= end)
            .map(|e| e.consumer.0)
            .min()
    }

    /// Whether node `end` on `from` has finished before node `begin` on
    /// `to` starts.
    ///
    /// On one stream this is topological order. Across streams some chain
    /// of cross-stream edges, in any sub-graph, must leave `from` at or
    /// after `end` and enter `to` at or before `begin`.
    pub fn happens_before(&self, from: StreamId, end: u32, to: StreamId, begin: u32) -> bool {
        if from == to {
            return end < begin;
        }
        // Per stream, the earliest node that cannot finish before `end`.
        let mut after: IndexMap<StreamId, u32> = IndexMap::new();
        after.insert(from, end);
        loop {
            let mut changed = false;
            for (consumer_stream, edge) in self.iter() {
                let Some(&reached) = after.get(&edge.producer_stream) else {
                    continue;
                };
                if edge.producer.0 < reached {
                    continue;
                }
                let entry = after.entry(consumer_stream).or_insert(u32::MAX);
                if edge.consumer.0 < *entry {
                    *entry = edge.consumer.0;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        after.get(&to).is_some_and(|&first| first <= begin)
    }

    fn iter(&self) -> impl Iterator<Item = (StreamId, &DiffStreamEdge)> + '_ {
        self.edges
            .values()
            .flat_map(IndexMap::iter)
            .flat_map(|(&stream, edges)| edges.iter().map(move |e| (stream, e)))
    }

    /// Latest node on `producer_stream` that a node on `consumer_stream`
    /// at or before `begin` waits for.
    pub fn depend_producer(
        &self,
        sub_graph: SubGraphId,
        consumer_stream: StreamId,
        begin: u32,
        producer_stream: StreamId,
    ) -> Option<u32> {
        self.edges_into(sub_graph, consumer_stream)
            .iter()
            .filter(|e| e.producer_stream == producer_stream && e.consumer.0 <= begin)
            .map(|e| e.producer.0)
            .max()
    }
}

/// A run of nodes that leaves a stream and comes back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffStreamChain {
    /// The node whose output starts the chain.
    pub origin: NodeId,
    /// Nodes on other streams, in execution order.
    pub intermediates: Vec<NodeId>,
    /// First node back on the origin's stream.
    pub return_node: NodeId,
}

/// Find the returning chain that starts at `origin`, if there is one.
///
/// The origin must have exactly one successor on another stream. From
/// there every link must be the node's only successor and have the next
/// topological id, until a node on the origin's stream is reached. Chains
/// longer than `max_chain` intermediates are ignored.
pub fn diff_stream_prior<F>(
    graph: &Graph,
    origin: NodeId,
    stream_of: F,
    max_chain: usize,
) -> Option<DiffStreamChain>
where
    F: Fn(NodeId) -> StreamId,
{
    let origin_stream = stream_of(origin);
    let heads: Vec<NodeId> = successors(graph, origin)
        .into_iter()
        .filter(|&n| stream_of(n) != origin_stream)
        .collect();
    let [head] = heads.as_slice() else {
        return None;
    };
    if head.0 != origin.0 + 1 {
        return None;
    }

    let mut intermediates = Vec::new();
    let mut cur = *head;
    loop {
        if stream_of(cur) == origin_stream {
            return Some(DiffStreamChain {
                origin,
                intermediates,
                return_node: cur,
            });
        }
        if intermediates.len() >= max_chain {
            return None;
        }
        intermediates.push(cur);
        let next = successors(graph, cur);
        let [next] = next.as_slice() else {
            return None;
        };
        if next.0 != cur.0 + 1 {
            return None;
        }
        cur = *next;
    }
}

/// Whether a chain's intermediates can move onto the origin's stream.
///
/// Nodes with an explicit sub-stream or thread-scope stream stay put, as
/// do nodes that depend on anything outside the chain.
pub fn optimize_diff_stream(graph: &Graph, chain: &DiffStreamChain) -> Result<bool, AssignError> {
    for (pos, &id) in chain.intermediates.iter().enumerate() {
        let node = graph.node(id)?;
        if node.attrs.sub_stream_id.is_some() || node.attrs.thread_scope_stream_id.is_some() {
            return Ok(false);
        }
        let expected_pred = if pos == 0 {
            chain.origin
        } else {
            chain.intermediates[pos - 1]
        };
        if predecessors(graph, id) != [expected_pred] {
            return Ok(false);
        }
    }
    Ok(true)
}
