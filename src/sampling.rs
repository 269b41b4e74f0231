//! Splitting a whole-feeder graph into transformer-level training examples

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use crate::encoding::{EdgeType, NodeType};
use crate::error::SampleError;
use crate::graph::GraphRecord;

/// How each grid model is turned into dataset rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sampling {
    /// One row per model
    #[default]
    Whole,
    /// One row per distribution transformer whose upstream bus feeds no other transformer
    Transformer,
}

impl fmt::Display for Sampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sampling::Whole => write!(f, "whole"),
            Sampling::Transformer => write!(f, "transformer"),
        }
    }
}

impl FromStr for Sampling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "whole" => Ok(Sampling::Whole),
            "transformer" => Ok(Sampling::Transformer),
            other => Err(format!(
                "unknown sampling mode '{other}' (expected 'whole' or 'transformer')"
            )),
        }
    }
}

impl Sampling {
    pub fn apply(self, record: GraphRecord) -> Result<Vec<GraphRecord>, SampleError> {
        match self {
            Sampling::Whole => Ok(vec![record]),
            Sampling::Transformer => transformer_subgraphs(&record),
        }
    }
}

/// Breadth-first orientation of the source's component.
struct Orientation {
    depth: Vec<Option<usize>>,
    /// Child node and connecting edge, in discovery order
    children: Vec<Vec<(usize, usize)>>,
}

fn orient(record: &GraphRecord, source: usize) -> Result<Orientation, SampleError> {
    let adjacency = record.adjacency();
    let n = record.node_count();
    let mut depth = vec![None; n];
    let mut parent_edge: Vec<Option<usize>> = vec![None; n];
    let mut children = vec![Vec::new(); n];
    let mut queue = VecDeque::from([source]);
    depth[source] = Some(0);

    while let Some(node) = queue.pop_front() {
        let node_depth = depth[node].unwrap_or_default();
        for &(next, edge) in &adjacency[node] {
            if parent_edge[node] == Some(edge) {
                continue;
            }
            if depth[next].is_some() {
                return Err(SampleError::Loop(edge));
            }
            depth[next] = Some(node_depth + 1);
            parent_edge[next] = Some(edge);
            children[node].push((next, edge));
            queue.push_back(next);
        }
    }

    Ok(Orientation { depth, children })
}

/// One subgraph per transformer whose upstream bus has no other transformer below it.
///
/// The subgraph is the whole downstream tree of the transformer's upstream bus,
/// sibling laterals included, and that bus is relabelled SOURCE. Nodes are
/// renumbered in breadth-first order from the root; edges keep their original
/// direction.
pub fn transformer_subgraphs(record: &GraphRecord) -> Result<Vec<GraphRecord>, SampleError> {
    let source = record.source_node().ok_or(SampleError::NoSource)?;
    let orientation = orient(record, source)?;

    let mut subgraphs = Vec::new();
    for (k, edge) in record.edges.iter().enumerate() {
        if edge.edge_type != EdgeType::Transformer {
            continue;
        }
        let (a, b) = record.edge_index[k];
        let (Some(depth_a), Some(depth_b)) = (orientation.depth[a], orientation.depth[b]) else {
            // not connected to the source
            continue;
        };
        let root = if depth_a < depth_b { a } else { b };

        if let Some(sub) = extract(record, &orientation, root) {
            subgraphs.push(sub);
        }
    }

    Ok(subgraphs)
}

/// Downstream tree of `root`, or `None` unless it holds exactly one transformer.
fn extract(record: &GraphRecord, orientation: &Orientation, root: usize) -> Option<GraphRecord> {
    let mut new_index = vec![None; record.node_count()];
    let mut order = vec![root];
    new_index[root] = Some(0);
    let mut kept_edges = Vec::new();
    let mut transformers = 0;

    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        for &(child, edge) in &orientation.children[node] {
            if record.edges[edge].edge_type == EdgeType::Transformer {
                transformers += 1;
                if transformers > 1 {
                    return None;
                }
            }
            new_index[child] = Some(order.len());
            order.push(child);
            kept_edges.push(edge);
            queue.push_back(child);
        }
    }
    if transformers != 1 {
        return None;
    }

    let mut nodes: Vec<_> = order.iter().map(|&i| record.nodes[i].clone()).collect();
    nodes[0].node_type = NodeType::Source;

    let mut edge_index = Vec::with_capacity(kept_edges.len());
    let mut edges = Vec::with_capacity(kept_edges.len());
    for k in kept_edges {
        let (from, to) = record.edge_index[k];
        edge_index.push((new_index[from]?, new_index[to]?));
        edges.push(record.edges[k].clone());
    }

    Some(GraphRecord {
        nodes,
        edge_index,
        edges,
    })
}
